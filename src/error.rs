use std::io;

use thiserror::Error;

use crate::model::Revision;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the server surfaces to a caller.
///
/// The variants mirror the exception taxonomy of the upstream Java server so
/// that existing clients keep working against the HTTP error envelope.
#[derive(Error, Debug)]
pub enum Error {
    #[error("project exists: {0}")]
    ProjectExists(String),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("repository exists: {0}")]
    RepositoryExists(String),
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("entry not found: {path} (revision: {revision})")]
    EntryNotFound { revision: Revision, path: String },
    #[error("revision not found: {0}")]
    RevisionNotFound(Revision),
    #[error("change conflict: {0}")]
    ChangeConflict(String),
    #[error("changes did not change anything")]
    RedundantChange,
    #[error("failed to execute query: {0}")]
    QueryExecution(String),
    #[error("read-only: {0}")]
    ReadOnly(String),
    #[error("too many commits are sent to {0}")]
    QuotaExceeded(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("storage failure")]
    Storage(#[from] io::Error),
    #[error("replication unavailable: {0}")]
    ReplicationUnavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to parse json")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse yaml")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Re-materializes an error observed through a shared reference, for
    /// cache loaders that fan one failure out to several concurrent callers.
    /// Wrapped source errors that cannot be rebuilt keep their message.
    pub fn duplicate(&self) -> Error {
        use Error::*;
        match self {
            ProjectExists(s) => ProjectExists(s.clone()),
            ProjectNotFound(s) => ProjectNotFound(s.clone()),
            RepositoryExists(s) => RepositoryExists(s.clone()),
            RepositoryNotFound(s) => RepositoryNotFound(s.clone()),
            EntryNotFound { revision, path } => EntryNotFound {
                revision: *revision,
                path: path.clone(),
            },
            RevisionNotFound(r) => RevisionNotFound(*r),
            ChangeConflict(s) => ChangeConflict(s.clone()),
            RedundantChange => RedundantChange,
            QueryExecution(s) => QueryExecution(s.clone()),
            ReadOnly(s) => ReadOnly(s.clone()),
            QuotaExceeded(s) => QuotaExceeded(s.clone()),
            PermissionDenied(s) => PermissionDenied(s.clone()),
            Unauthenticated => Unauthenticated,
            Storage(e) => Storage(io::Error::new(e.kind(), e.to_string())),
            ReplicationUnavailable(s) => ReplicationUnavailable(s.clone()),
            InvalidInput(s) => InvalidInput(s.clone()),
            Json(e) => InvalidInput(format!("failed to parse json: {}", e)),
            Yaml(e) => InvalidInput(format!("failed to parse yaml: {}", e)),
        }
    }

    /// The fully-qualified exception name carried in the HTTP error envelope.
    /// These are the upstream Java class names, kept verbatim for client
    /// compatibility.
    pub fn exception_name(&self) -> &'static str {
        match self {
            Error::ProjectExists(_) => "com.linecorp.centraldogma.common.ProjectExistsException",
            Error::ProjectNotFound(_) => {
                "com.linecorp.centraldogma.common.ProjectNotFoundException"
            }
            Error::RepositoryExists(_) => {
                "com.linecorp.centraldogma.common.RepositoryExistsException"
            }
            Error::RepositoryNotFound(_) => {
                "com.linecorp.centraldogma.common.RepositoryNotFoundException"
            }
            Error::EntryNotFound { .. } => {
                "com.linecorp.centraldogma.common.EntryNotFoundException"
            }
            Error::RevisionNotFound(_) => {
                "com.linecorp.centraldogma.common.RevisionNotFoundException"
            }
            Error::ChangeConflict(_) => {
                "com.linecorp.centraldogma.common.ChangeConflictException"
            }
            Error::RedundantChange => {
                "com.linecorp.centraldogma.common.RedundantChangeException"
            }
            Error::QueryExecution(_) => {
                "com.linecorp.centraldogma.common.QueryExecutionException"
            }
            Error::ReadOnly(_) => "com.linecorp.centraldogma.common.ReadOnlyException",
            Error::QuotaExceeded(_) => {
                "com.linecorp.centraldogma.common.TooManyRequestsException"
            }
            Error::PermissionDenied(_) => {
                "com.linecorp.centraldogma.common.PermissionException"
            }
            Error::Unauthenticated => {
                "com.linecorp.centraldogma.common.AuthorizationException"
            }
            Error::Storage(_) => "com.linecorp.centraldogma.common.StorageException",
            Error::ReplicationUnavailable(_) => {
                "com.linecorp.centraldogma.common.ReplicationException"
            }
            Error::InvalidInput(_) | Error::Json(_) | Error::Yaml(_) => {
                "com.linecorp.centraldogma.common.InvalidPushException"
            }
        }
    }
}
