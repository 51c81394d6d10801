use serde::{Deserialize, Serialize};

use super::{Author, Revision};

/// Lifecycle status of a project or repository. Removed entities disappear
/// from normal listings but stay restorable until they are purged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Removed,
}

/// The encryption marker of a repository, updated by key rotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMarker {
    /// Identifier of the key currently in effect.
    pub key_id: String,
    /// When the key was last rotated.
    pub rotated_at: String,
}

/// A top-level element in Central Dogma storage model. Every project owns
/// the reserved "dogma" and "meta" repositories, which hold project
/// configuration for administrators and project owners.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Name of this project.
    pub name: String,
    /// The author who initially created this project.
    pub creator: Author,
    /// Whether this project is active or removed.
    pub status: EntityStatus,
    /// Url of this project
    pub url: Option<String>,
    /// When the project was created
    pub created_at: Option<String>,
    /// When the project was removed; absent while the project is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<String>,
}

/// Server-side view of a repository and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Name of this repository.
    pub name: String,
    /// The author who initially created this repository.
    pub creator: Author,
    /// Head [`Revision`] of the repository.
    pub head_revision: Revision,
    /// Whether this repository is active or removed.
    pub status: EntityStatus,
    /// Url of this repository.
    pub url: Option<String>,
    /// When the repository was created.
    pub created_at: Option<String>,
    /// When the repository was removed; absent while it is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<String>,
    /// Present when the repository content is encrypted at rest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionMarker>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn removed_fields_are_omitted_while_active() {
        let p = Project {
            name: "foo".to_string(),
            creator: Author::new("minux", "minux@m.x"),
            status: EntityStatus::Active,
            url: Some("/api/v1/projects/foo".to_string()),
            created_at: Some("2024-01-01T00:00:00Z".to_string()),
            removed_at: None,
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["status"], "active");
        assert!(v.get("removedAt").is_none());
    }

    #[test]
    fn removed_project_carries_its_timestamp() {
        let p = Project {
            name: "foo".to_string(),
            creator: Author::new("minux", "minux@m.x"),
            status: EntityStatus::Removed,
            url: None,
            created_at: None,
            removed_at: Some("2024-02-01T00:00:00Z".to_string()),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["status"], "removed");
        assert_eq!(v["removedAt"], "2024-02-01T00:00:00Z");
    }

    #[test]
    fn encryption_marker_wire_shape() {
        let r = Repository {
            name: "bar".to_string(),
            creator: Author::new("minux", "minux@m.x"),
            head_revision: Revision::INIT,
            status: EntityStatus::Active,
            url: None,
            created_at: None,
            removed_at: None,
            encryption: Some(EncryptionMarker {
                key_id: "abc".to_string(),
                rotated_at: "2024-03-01T00:00:00Z".to_string(),
            }),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["encryption"]["keyId"], "abc");
        assert_eq!(v["encryption"]["rotatedAt"], "2024-03-01T00:00:00Z");
    }
}
