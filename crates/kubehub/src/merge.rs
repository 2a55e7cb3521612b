//! JSON merge patch (RFC 7386).

use serde_json::Value as Json;

/// Apply `patch` onto `target` in place. `null` removes a key; non-object
/// patch values replace the target wholesale.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(serde_json::Map::new());
    }
    if let Json::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}
