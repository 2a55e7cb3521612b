//! Where release manifests come from.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::Value as Json;
use tracing::{debug, warn};

use keel_core::{ComponentKind, Error, Result};

use crate::yaml::parse_documents;

/// Raw documents and image table of one release of one kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Release {
    pub version: String,
    pub documents: Vec<Json>,
    /// Logical image name → image reference, used by `${IMAGE:<name>}`
    pub images: BTreeMap<String, String>,
}

impl Release {
    pub fn from_yaml(version: &str, yaml: &str, images: BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            version: version.to_string(),
            documents: parse_documents(yaml)?,
            images,
        })
    }
}

pub trait ManifestSource: Send + Sync {
    /// Versions available for `kind`, in name order.
    fn supported_versions(&self, kind: &ComponentKind) -> Vec<String>;

    fn release(&self, kind: &ComponentKind, version: &str) -> Result<Release>;
}

/// Releases laid out on disk as `<root>/<kind>/<version>/*.yaml`.
///
/// `images.yaml` in a version directory is read as the image table rather
/// than as manifests. Other files are concatenated in file-name order.
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load(&self, kind: &ComponentKind, version: &str) -> anyhow::Result<Release> {
        let dir = self.root.join(kind.as_str()).join(version);
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("reading release directory {}", dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|x| x.to_str()), Some("yaml" | "yml")))
            .collect();
        files.sort();

        let mut release = Release {
            version: version.to_string(),
            ..Default::default()
        };
        for path in files {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            if path.file_stem().and_then(|s| s.to_str()) == Some("images") {
                release.images = serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing image table {}", path.display()))?;
                continue;
            }
            let docs = parse_documents(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            debug!(file = %path.display(), docs = docs.len(), "loaded manifests");
            release.documents.extend(docs);
        }
        Ok(release)
    }
}

impl ManifestSource for DirSource {
    fn supported_versions(&self, kind: &ComponentKind) -> Vec<String> {
        let dir = self.root.join(kind.as_str());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "no releases for kind");
                return Vec::new();
            }
        };
        let mut versions: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        versions.sort();
        versions
    }

    fn release(&self, kind: &ComponentKind, version: &str) -> Result<Release> {
        self.load(kind, version)
            .map_err(|e| Error::transform("load", format!("{kind}@{version}: {e:#}")))
    }
}

/// In-process release table.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    releases: BTreeMap<ComponentKind, BTreeMap<String, Release>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: impl Into<ComponentKind>, release: Release) -> &mut Self {
        self.releases
            .entry(kind.into())
            .or_default()
            .insert(release.version.clone(), release);
        self
    }

    pub fn with_yaml(
        mut self,
        kind: &str,
        version: &str,
        yaml: &str,
        images: &[(&str, &str)],
    ) -> Result<Self> {
        let images = images
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.insert(kind, Release::from_yaml(version, yaml, images)?);
        Ok(self)
    }

    /// Releases shipped with the operator for the built-in kinds.
    pub fn builtin() -> Result<Self> {
        let mut source = Self::new();
        for (kind, version, manifests, images) in crate::builtin::RELEASES {
            let images: BTreeMap<String, String> = serde_yaml::from_str(images)
                .map_err(|e| Error::transform("load", format!("{kind}@{version} images: {e}")))?;
            source.insert(*kind, Release::from_yaml(version, manifests, images)?);
        }
        Ok(source)
    }
}

impl ManifestSource for StaticSource {
    fn supported_versions(&self, kind: &ComponentKind) -> Vec<String> {
        self.releases
            .get(kind)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn release(&self, kind: &ComponentKind, version: &str) -> Result<Release> {
        self.releases
            .get(kind)
            .and_then(|r| r.get(version))
            .cloned()
            .ok_or_else(|| Error::transform("load", format!("no release {version} for {kind}")))
    }
}
