use serde::{Deserialize, Serialize};

/// Typed content of a [`Change`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum ChangeContent {
    /// Adds a new JSON file or replaces an existing file with the provided json.
    UpsertJson(serde_json::Value),

    /// Adds a new text file or replaces an existing file with the provided content.
    UpsertText(String),

    /// Adds a new YAML file or replaces an existing file with the provided document.
    UpsertYaml(String),

    /// Removes an existing file.
    Remove,

    /// Renames an existing file to this provided path.
    Rename(String),

    /// Applies a JSON patch to a JSON file with the provided JSON patch object,
    /// as defined in [RFC 6902](https://tools.ietf.org/html/rfc6902).
    ApplyJsonPatch(serde_json::Value),

    /// Applies a textual patch to a text file with the provided
    /// [unified format](https://en.wikipedia.org/wiki/Diff_utility#Unified_format) string.
    ApplyTextPatch(String),
}

/// A modification of an individual [`Entry`](super::Entry)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Path of the file change.
    pub path: String,
    /// Content of the file change.
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: &str, content: serde_json::Value) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertJson(content),
        }
    }

    pub fn upsert_text(path: &str, content: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertText(content.to_string()),
        }
    }

    pub fn upsert_yaml(path: &str, content: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertYaml(content.to_string()),
        }
    }

    pub fn remove(path: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::Remove,
        }
    }

    pub fn rename(path: &str, new_path: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::Rename(new_path.to_string()),
        }
    }

    pub fn apply_json_patch(path: &str, patch: serde_json::Value) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::ApplyJsonPatch(patch),
        }
    }

    pub fn apply_text_patch(path: &str, patch: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::ApplyTextPatch(patch.to_string()),
        }
    }

    /// Paths this change touches: the changed path itself, plus the target of
    /// a rename.
    pub fn touched_paths(&self) -> Vec<&str> {
        match &self.content {
            ChangeContent::Rename(new_path) => vec![self.path.as_str(), new_path.as_str()],
            _ => vec![self.path.as_str()],
        }
    }
}
