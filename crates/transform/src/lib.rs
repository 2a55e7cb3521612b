//! Keel transform: turns release manifests into installer-set items.

#![forbid(unsafe_code)]

mod builtin;
pub mod defaults;
pub mod pipeline;
pub mod source;
pub mod yaml;

pub use pipeline::{render, transform, Rendered, ResourceOverride, TransformConfig};
pub use source::{DirSource, ManifestSource, Release, StaticSource};
pub use yaml::{manifest_id, parse_documents};
