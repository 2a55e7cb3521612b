//! Deterministic content hashing for installer sets.

use serde::Serialize;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::ManifestItem;

const PREFIX: &str = "sha256:";

/// Serialize JSON with object keys sorted at every level.
pub fn canonical_json(v: &Json) -> String {
    fn write(v: &Json, out: &mut String) {
        match v {
            Json::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Json::String((*k).clone()).to_string());
                    out.push(':');
                    write(&map[k.as_str()], out);
                }
                out.push('}');
            }
            Json::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }
    let mut out = String::new();
    write(v, &mut out);
    out
}

/// Digest of a transformed manifest set plus the configuration inputs that produced it.
///
/// Item order is significant (it is the apply order); map key order is not.
pub fn content_hash<C: Serialize>(items: &[ManifestItem], config: &C) -> Result<String> {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(canonical_json(&serde_json::to_value(item)?).as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"config:");
    hasher.update(canonical_json(&serde_json::to_value(config)?).as_bytes());
    Ok(format!("{PREFIX}{}", hex::encode(hasher.finalize())))
}

/// First ten hex characters of a content hash, used in object names.
pub fn short_hash(hash: &str) -> &str {
    let hex = hash.strip_prefix(PREFIX).unwrap_or(hash);
    &hex[..hex.len().min(10)]
}
