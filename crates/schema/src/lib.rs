//! Keel schema: validation and defaulting collaborators for component specs.
//!
//! The reconciler treats both as external seams ([`Validator`],
//! [`Defaulter`]); [`SpecValidator`] and [`SpecDefaulter`] are the
//! implementations wired in by default.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

use keel_core::{ComponentSpec, Error, Result};

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$").expect("static regex")
});

/// Config keys every kind accepts.
pub const COMMON_CONFIG_KEYS: &[&str] = &["images", "resources", "labels", "annotations"];

/// Kind-specific inputs the validator needs.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Component instance name, for error messages
    pub component: &'a str,
    pub supported_versions: &'a [String],
    /// Config keys accepted on top of [`COMMON_CONFIG_KEYS`]
    pub extra_config_keys: &'a [&'a str],
    pub default_namespace: &'a str,
    /// Optional JSON Schema for the whole config payload
    pub config_schema: Option<&'a Json>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub error: String,
}

pub trait Validator: Send + Sync {
    fn validate(&self, spec: &ComponentSpec, ctx: &ValidationContext<'_>) -> Result<()>;
}

pub trait Defaulter: Send + Sync {
    fn apply_defaults(&self, spec: &ComponentSpec, ctx: &ValidationContext<'_>) -> ComponentSpec;
}

/// Compare release strings numerically where possible (`v1.10.0 > v1.9.3`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> Vec<Result<u64, &str>> {
        v.trim_start_matches('v')
            .split(['.', '-'])
            .map(|p| p.parse::<u64>().map_err(|_| p))
            .collect()
    }
    let (pa, pb) = (parts(a), parts(b));
    for (x, y) in pa.iter().zip(pb.iter()) {
        let ord = match (x, y) {
            (Ok(x), Ok(y)) => x.cmp(y),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(x), Err(y)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    pa.len().cmp(&pb.len())
}

pub fn newest_version(versions: &[String]) -> Option<&String> {
    versions.iter().max_by(|a, b| compare_versions(a, b))
}

/// Fills an empty version with the newest supported release and an empty
/// namespace with the kind's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecDefaulter;

impl Defaulter for SpecDefaulter {
    fn apply_defaults(&self, spec: &ComponentSpec, ctx: &ValidationContext<'_>) -> ComponentSpec {
        let mut out = spec.clone();
        if out.target_namespace.trim().is_empty() {
            out.target_namespace = ctx.default_namespace.to_string();
        }
        if out.version.trim().is_empty() {
            if let Some(v) = newest_version(ctx.supported_versions) {
                debug!(component = ctx.component, version = %v, "defaulting version");
                out.version = v.clone();
            }
        }
        out
    }
}

/// Structural validation of a defaulted component spec.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecValidator;

impl SpecValidator {
    pub fn issues(&self, spec: &ComponentSpec, ctx: &ValidationContext<'_>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut push = |path: &str, error: String| {
            issues.push(ValidationIssue {
                path: path.to_string(),
                error,
            })
        };

        if spec.version.is_empty() {
            push("spec.version", "no version requested and none supported".into());
        } else if !ctx.supported_versions.iter().any(|v| v == &spec.version) {
            push(
                "spec.version",
                format!(
                    "unsupported version {} (supported: {})",
                    spec.version,
                    ctx.supported_versions.join(", ")
                ),
            );
        }

        let ns = &spec.target_namespace;
        if ns.len() > 63 || !DNS_LABEL.is_match(ns) {
            push(
                "spec.targetNamespace",
                format!("{ns:?} is not a valid DNS-1123 label"),
            );
        }

        for key in spec.config.keys() {
            let known = COMMON_CONFIG_KEYS.contains(&key.as_str())
                || ctx.extra_config_keys.contains(&key.as_str());
            if !known {
                push(&format!("spec.config.{key}"), "unknown config key".into());
            }
        }

        if let Some(images) = spec.config.get("images") {
            check_string_map(images, "spec.config.images", &mut push);
        }
        for key in ["labels", "annotations"] {
            if let Some(v) = spec.config.get(key) {
                check_string_map(v, &format!("spec.config.{key}"), &mut push);
            }
        }
        if let Some(resources) = spec.config.get("resources") {
            check_resources(resources, &mut push);
        }

        #[cfg(feature = "jsonschema-validate")]
        if let Some(schema) = ctx.config_schema {
            let config = serde_json::to_value(&spec.config).unwrap_or(Json::Null);
            for issue in validate::against_schema(schema, &config) {
                push(&format!("spec.config{}", issue.path), issue.error);
            }
        }

        issues
    }
}

fn check_string_map(v: &Json, path: &str, push: &mut impl FnMut(&str, String)) {
    match v.as_object() {
        Some(map) => {
            for (k, val) in map {
                if !val.as_str().is_some_and(|s| !s.is_empty()) {
                    push(&format!("{path}.{k}"), "must be a non-empty string".into());
                }
            }
        }
        None => push(path, "must be a map of strings".into()),
    }
}

fn check_resources(v: &Json, push: &mut impl FnMut(&str, String)) {
    let Some(containers) = v.as_object() else {
        push("spec.config.resources", "must be a map keyed by container name".into());
        return;
    };
    for (container, body) in containers {
        let base = format!("spec.config.resources.{container}");
        let Some(sections) = body.as_object() else {
            push(&base, "must contain requests and/or limits".into());
            continue;
        };
        for (section, values) in sections {
            let path = format!("{base}.{section}");
            if section != "requests" && section != "limits" {
                push(&path, "expected requests or limits".into());
                continue;
            }
            let Some(values) = values.as_object() else {
                push(&path, "must be a map".into());
                continue;
            };
            for (res, qty) in values {
                let qpath = format!("{path}.{res}");
                if res != "cpu" && res != "memory" {
                    push(&qpath, "only cpu and memory may be overridden".into());
                } else if !qty.as_str().is_some_and(|q| QUANTITY.is_match(q)) {
                    push(&qpath, format!("{qty} is not a valid quantity"));
                }
            }
        }
    }
}

impl Validator for SpecValidator {
    fn validate(&self, spec: &ComponentSpec, ctx: &ValidationContext<'_>) -> Result<()> {
        let issues = self.issues(spec, ctx);
        let Some(first) = issues.first() else {
            return Ok(());
        };
        let message = issues
            .iter()
            .map(|i| format!("{}: {}", i.path, i.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::validation_for_field(ctx.component, first.path.clone(), message))
    }
}

// Feature-gated JSON Schema validation of config payloads
#[cfg(feature = "jsonschema-validate")]
pub mod validate {
    use super::*;
    use jsonschema::{Draft, JSONSchema};

    pub fn against_schema(schema: &Json, instance: &Json) -> Vec<ValidationIssue> {
        let compiled = match JSONSchema::options().with_draft(Draft::Draft7).compile(schema) {
            Ok(c) => c,
            Err(e) => {
                return vec![ValidationIssue {
                    path: String::new(),
                    error: format!("invalid config schema: {e}"),
                }]
            }
        };
        let mut issues = Vec::new();
        if let Err(errors) = compiled.validate(instance) {
            for err in errors {
                issues.push(ValidationIssue {
                    path: err.instance_path.to_string().replace('/', "."),
                    error: err.to_string(),
                });
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn versions() -> Vec<String> {
        vec!["v0.9.1".into(), "v0.10.0".into(), "v0.9.12".into()]
    }

    fn ctx<'a>(versions: &'a [String]) -> ValidationContext<'a> {
        ValidationContext {
            component: "pipeline",
            supported_versions: versions,
            extra_config_keys: &["featureFlags"],
            default_namespace: "tekton-pipelines",
            config_schema: None,
        }
    }

    fn spec(version: &str, ns: &str) -> ComponentSpec {
        ComponentSpec {
            kind: "pipeline".into(),
            version: version.into(),
            target_namespace: ns.into(),
            config: Default::default(),
        }
    }

    #[test]
    fn version_ordering_is_numeric() {
        assert_eq!(compare_versions("v0.10.0", "v0.9.12"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
        assert_eq!(newest_version(&versions()).map(String::as_str), Some("v0.10.0"));
    }

    #[test]
    fn defaults_fill_namespace_and_version() {
        let v = versions();
        let out = SpecDefaulter.apply_defaults(&spec("", " "), &ctx(&v));
        assert_eq!(out.target_namespace, "tekton-pipelines");
        assert_eq!(out.version, "v0.10.0");

        let kept = SpecDefaulter.apply_defaults(&spec("v0.9.1", "custom"), &ctx(&v));
        assert_eq!(kept.version, "v0.9.1");
        assert_eq!(kept.target_namespace, "custom");
    }

    #[test]
    fn rejects_unsupported_version_and_bad_namespace() {
        let v = versions();
        let err = SpecValidator
            .validate(&spec("v9.9.9", "Bad_NS"), &ctx(&v))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unsupported version v9.9.9"), "{msg}");
        assert!(msg.contains("DNS-1123"), "{msg}");
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.version")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn config_keys_and_quantities_checked() {
        let v = versions();
        let mut s = spec("v0.9.1", "tekton");
        s.config.insert("featureFlags".into(), json!({"a": "b"}));
        s.config.insert(
            "resources".into(),
            json!({"controller": {"limits": {"cpu": "500m", "memory": "1Gi"}}}),
        );
        assert!(SpecValidator.validate(&s, &ctx(&v)).is_ok());

        s.config.insert("bogus".into(), json!(1));
        s.config.insert(
            "resources".into(),
            json!({"controller": {"limits": {"cpu": "lots", "gpu": "1"}}}),
        );
        let issues = SpecValidator.issues(&s, &ctx(&v));
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"spec.config.bogus"));
        assert!(paths.contains(&"spec.config.resources.controller.limits.cpu"));
        assert!(paths.contains(&"spec.config.resources.controller.limits.gpu"));
    }

    #[test]
    fn images_must_be_strings() {
        let v = versions();
        let mut s = spec("v0.9.1", "tekton");
        s.config.insert("images".into(), json!({"controller": 3}));
        let issues = SpecValidator.issues(&s, &ctx(&v));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "spec.config.images.controller");
    }
}
