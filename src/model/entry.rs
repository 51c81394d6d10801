use serde::{Deserialize, Serialize};

use super::Revision;

/// The content of an [`Entry`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum EntryContent {
    /// Content as a JSON Value.
    Json(serde_json::Value),
    /// Content as a String.
    Text(String),
    /// Content as a YAML document, kept in its textual form.
    Yaml(String),
    /// This Entry is a directory.
    Directory,
}

impl EntryContent {
    pub fn entry_type(&self) -> EntryType {
        match self {
            EntryContent::Json(_) => EntryType::Json,
            EntryContent::Text(_) => EntryType::Text,
            EntryContent::Yaml(_) => EntryType::Yaml,
            EntryContent::Directory => EntryType::Directory,
        }
    }
}

/// A file or a directory in a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Path of this entry.
    pub path: String,
    /// Content of this entry.
    #[serde(flatten)]
    pub content: EntryContent,
    /// Revision of this entry.
    pub revision: Revision,
    /// Url of this entry.
    pub url: String,
    /// When this entry was last modified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

impl Entry {
    pub fn entry_type(&self) -> EntryType {
        self.content.entry_type()
    }
}

/// The type of a [`ListEntry`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// A UTF-8 encoded JSON file.
    Json,
    /// A UTF-8 encoded text file.
    Text,
    /// A UTF-8 encoded YAML file.
    Yaml,
    /// A directory.
    Directory,
}

impl EntryType {
    /// Guesses the entry type from a path, the way pushed upserts do.
    pub fn guess_from_path(path: &str) -> EntryType {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".json") {
            EntryType::Json
        } else if lower.ends_with(".yml") || lower.ends_with(".yaml") {
            EntryType::Yaml
        } else {
            EntryType::Text
        }
    }
}

/// A metadata of a file or a directory in a repository.
/// ListEntry has no content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub path: String,
    pub r#type: EntryType,
}
