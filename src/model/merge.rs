use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntryType, Revision};

/// One source file of a merged-JSON read. An optional source that does not
/// exist is skipped instead of failing the merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct MergeSource {
    pub path: String,
    #[serde(default)]
    pub optional: bool,
}

impl MergeSource {
    pub fn required(path: &str) -> MergeSource {
        MergeSource {
            path: path.to_string(),
            optional: false,
        }
    }

    pub fn optional(path: &str) -> MergeSource {
        MergeSource {
            path: path.to_string(),
            optional: true,
        }
    }
}

/// The result of merging JSON files at one revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergedEntry {
    /// Revision the merge was evaluated at.
    pub revision: Revision,
    /// The entry type of the merged result, always JSON.
    pub r#type: EntryType,
    /// The source paths that contributed, in merge order.
    pub paths: Vec<String>,
    /// The merged document, after any JSON path projection.
    pub content: Value,
}

/// Merges `overlay` into `base`: objects merge recursively, a null overlay
/// field removes the base field, and everything else is replaced.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    base_map.remove(&key);
                } else if let Some(existing) = base_map.get_mut(&key) {
                    merge_json(existing, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_merge_recursively() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_json(&mut base, json!({"a": {"b": 10}, "e": 4}));
        assert_eq!(base, json!({"a": {"b": 10, "c": 2}, "d": 3, "e": 4}));
    }

    #[test]
    fn null_removes_a_field() {
        let mut base = json!({"a": 1, "b": 2});
        merge_json(&mut base, json!({"a": null}));
        assert_eq!(base, json!({"b": 2}));
    }

    #[test]
    fn scalars_and_arrays_are_replaced() {
        let mut base = json!({"a": [1, 2, 3]});
        merge_json(&mut base, json!({"a": [9]}));
        assert_eq!(base, json!({"a": [9]}));
    }
}
