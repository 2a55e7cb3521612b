//! Multi-document YAML loading with size and complexity budgets.

use serde::Deserialize;
use serde_json::Value as Json;

use keel_core::{Error, ManifestId, Result};

fn max_yaml_bytes() -> usize {
    std::env::var("KEEL_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("KEEL_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse every non-empty document of a YAML stream into JSON.
///
/// The node budget applies to the stream as a whole.
pub fn parse_documents(yaml: &str) -> Result<Vec<Json>> {
    let max_bytes = max_yaml_bytes();
    if yaml.len() > max_bytes {
        return Err(Error::transform(
            "parse",
            format!("YAML payload too large (>{max_bytes} bytes)"),
        ));
    }
    let max_nodes = max_yaml_nodes();
    let mut remaining = max_nodes;
    let mut docs = Vec::new();
    for (idx, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(de)
            .map_err(|e| Error::transform("parse", format!("document {idx}: {e}")))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val)
            .map_err(|e| Error::transform("parse", format!("document {idx}: {e}")))?;
        if json_node_budget_exceeded(&json, remaining) {
            return Err(Error::transform(
                "parse",
                format!("YAML stream too complex (>{max_nodes} nodes)"),
            ));
        }
        remaining -= count_nodes(&json);
        docs.push(json);
    }
    Ok(docs)
}

fn count_nodes(v: &Json) -> usize {
    1 + match v {
        Json::Object(map) => map.values().map(count_nodes).sum(),
        Json::Array(arr) => arr.iter().map(count_nodes).sum(),
        _ => 0,
    }
}

/// Identity of a manifest document; `apiVersion`, `kind` and `metadata.name` are required.
pub fn manifest_id(doc: &Json) -> Result<ManifestId> {
    let field = |key: &str| doc.get(key).and_then(Json::as_str);
    let api_version = field("apiVersion")
        .ok_or_else(|| Error::transform("parse", "manifest missing apiVersion"))?;
    let kind = field("kind").ok_or_else(|| Error::transform("parse", "manifest missing kind"))?;
    let meta = doc.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .ok_or_else(|| Error::transform("parse", format!("{kind} missing metadata.name")))?;
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(Json::as_str)
        .map(str::to_string);
    Ok(ManifestId {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        namespace,
        name: name.to_string(),
    })
}
