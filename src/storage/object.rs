use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::Error;
use crate::model::{Author, Change, CommitDetail, EntryType, Revision};

/// SHA-1 identifier of a stored object, computed over the object kind and its
/// serialized payload so that equal content always shares an id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub fn compute(kind: ObjectKind, payload: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(payload.len().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(payload);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        ObjectId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The two-hex-character shard directory and the remaining file name.
    pub fn shard(&self) -> (String, String) {
        let h = self.to_hex();
        (h[..2].to_string(), h[2..].to_string())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::InvalidInput(format!("invalid object id: {}", s)))?;
        if bytes.len() != 20 {
            return Err(Error::InvalidInput(format!("invalid object id: {}", s)));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(ObjectId(id))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

/// What a tree entry points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreeEntryKind {
    Tree,
    Json,
    Text,
    Yaml,
}

impl TreeEntryKind {
    pub fn entry_type(self) -> EntryType {
        match self {
            TreeEntryKind::Tree => EntryType::Directory,
            TreeEntryKind::Json => EntryType::Json,
            TreeEntryKind::Text => EntryType::Text,
            TreeEntryKind::Yaml => EntryType::Yaml,
        }
    }

    pub fn of(entry_type: EntryType) -> TreeEntryKind {
        match entry_type {
            EntryType::Directory => TreeEntryKind::Tree,
            EntryType::Json => TreeEntryKind::Json,
            EntryType::Text => TreeEntryKind::Text,
            EntryType::Yaml => TreeEntryKind::Yaml,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: TreeEntryKind,
    pub id: ObjectId,
}

/// A directory object: child name to (kind, id), kept sorted so that equal
/// trees serialize identically and hash to the same id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeObject {
    pub entries: BTreeMap<String, TreeEntry>,
}

/// A commit object: the root tree it produced, its parent, the commit
/// metadata, and the changes that were actually applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitObject {
    pub revision: Revision,
    pub parent: Option<ObjectId>,
    pub tree: ObjectId,
    pub author: Author,
    pub timestamp: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<CommitDetail>,
    pub changes: Vec<Change>,
}
