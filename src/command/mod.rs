//! Typed write commands. Every mutation of server state is expressed as a
//! `Command` value so that it can be dispatched locally or shipped through
//! the replication log and applied identically on every replica.

mod executor;
mod replicated;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub use executor::{
    CommandExecutor, ExecutorState, LeadershipCallback, RepositoryWorkers,
    StandaloneCommandExecutor,
};
pub use replicated::ReplicatedCommandExecutor;

use crate::error::{Error, Result};
use crate::model::{
    Author, Change, CommitDetail, Project, PushResult, Query, Repository, Revision,
};
use crate::session::Session;

/// A single write, stamped with its author and origination time. Commands are
/// deterministic: applying the same command against the same state produces
/// the same result on every replica, and the stamped timestamp is used
/// instead of the clock during apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Command {
    CreateProject {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
    },
    RemoveProject {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
    },
    UnremoveProject {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
    },
    PurgeProject {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
    },
    CreateRepository {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
    },
    RemoveRepository {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
    },
    UnremoveRepository {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
    },
    PurgeRepository {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
    },
    /// A push whose upserts are canonicalized before comparison and storage.
    NormalizingPush {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
        base_revision: Revision,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<CommitDetail>,
        changes: Vec<Change>,
    },
    /// A push stored exactly as sent, used when replaying already-normalized
    /// change sets.
    PushAsIs {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
        base_revision: Revision,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<CommitDetail>,
        changes: Vec<Change>,
    },
    CreateSession {
        timestamp_millis: i64,
        author: Author,
        session: Session,
    },
    RemoveSession {
        timestamp_millis: i64,
        author: Author,
        session_id: String,
    },
    UpdateServerStatus {
        timestamp_millis: i64,
        author: Author,
        writable: bool,
    },
    /// Wraps any command and bypasses the read-only gate.
    ForcePush { command: Box<Command> },
    /// Rotates the repository encryption key. Key I/O is totally ordered on
    /// a dedicated serial section.
    RotateRepositoryKey {
        timestamp_millis: i64,
        author: Author,
        project_name: String,
        repo_name: String,
    },
}

impl Command {
    /// The (project, repository) a push targets, if this is a push.
    pub fn push_target(&self) -> Option<(&str, &str)> {
        match self {
            Command::NormalizingPush {
                project_name,
                repo_name,
                ..
            }
            | Command::PushAsIs {
                project_name,
                repo_name,
                ..
            } => Some((project_name, repo_name)),
            Command::ForcePush { command } => command.push_target(),
            _ => None,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        match self {
            Command::CreateProject { timestamp_millis, .. }
            | Command::RemoveProject { timestamp_millis, .. }
            | Command::UnremoveProject { timestamp_millis, .. }
            | Command::PurgeProject { timestamp_millis, .. }
            | Command::CreateRepository { timestamp_millis, .. }
            | Command::RemoveRepository { timestamp_millis, .. }
            | Command::UnremoveRepository { timestamp_millis, .. }
            | Command::PurgeRepository { timestamp_millis, .. }
            | Command::NormalizingPush { timestamp_millis, .. }
            | Command::PushAsIs { timestamp_millis, .. }
            | Command::CreateSession { timestamp_millis, .. }
            | Command::RemoveSession { timestamp_millis, .. }
            | Command::UpdateServerStatus { timestamp_millis, .. }
            | Command::RotateRepositoryKey { timestamp_millis, .. } => *timestamp_millis,
            Command::ForcePush { command } => command.timestamp_millis(),
        }
    }
}

/// What a successfully executed command produced.
#[derive(Debug)]
pub enum CommandResult {
    Project(Project),
    Repository(Repository),
    Push(PushResult),
    Session(Session),
    Unit,
}

impl CommandResult {
    pub fn into_push(self) -> Result<PushResult> {
        match self {
            CommandResult::Push(p) => Ok(p),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_project(self) -> Result<Project> {
        match self {
            CommandResult::Project(p) => Ok(p),
            other => Err(unexpected(&other)),
        }
    }

    pub fn into_repository(self) -> Result<Repository> {
        match self {
            CommandResult::Repository(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(result: &CommandResult) -> Error {
    Error::InvalidInput(format!("unexpected command result: {:?}", result))
}

/// A content transformation resolved into a normalizing push on the
/// executing node; only the resulting push is replicated, because the
/// transformer itself is not replayable.
pub struct Transform {
    pub timestamp_millis: i64,
    pub author: Author,
    pub project_name: String,
    pub repo_name: String,
    pub base_revision: Revision,
    pub summary: String,
    pub query: Query,
    pub transformer:
        Box<dyn FnOnce(Option<serde_json::Value>) -> Result<serde_json::Value> + Send>,
}

/// Formats a command timestamp for commit metadata. Deterministic given the
/// stamped milliseconds.
pub fn format_timestamp(timestamp_millis: i64) -> String {
    match Utc.timestamp_millis_opt(timestamp_millis).single() {
        Some(t) => t.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => Utc
            .timestamp_millis_opt(0)
            .single()
            .expect("epoch is representable")
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_wire_shape() {
        let cmd = Command::NormalizingPush {
            timestamp_millis: 42,
            author: Author::new("minux", "minux@m.x"),
            project_name: "foo".to_string(),
            repo_name: "bar".to_string(),
            base_revision: Revision::HEAD,
            summary: "Add a file".to_string(),
            detail: None,
            changes: vec![Change::upsert_text("/a.txt", "a\n")],
        };
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["type"], "NORMALIZING_PUSH");
        assert_eq!(v["projectName"], "foo");
        assert_eq!(v["baseRevision"], 0);

        let back: Command = serde_json::from_value(v).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn force_push_delegates() {
        let inner = Command::UpdateServerStatus {
            timestamp_millis: 7,
            author: Author::system(),
            writable: true,
        };
        let cmd = Command::ForcePush {
            command: Box::new(inner),
        };
        assert_eq!(cmd.timestamp_millis(), 7);
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["type"], "FORCE_PUSH");
        assert_eq!(v["command"]["type"], "UPDATE_SERVER_STATUS");
    }

    #[test]
    fn timestamps_format_deterministically() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_timestamp(1_700_000_000_000), "2023-11-14T22:13:20.000Z");
    }
}
