//! Data models of CentralDogma

mod change;
mod commit;
mod entry;
mod merge;
mod pattern;
mod project;
mod query;
mod revision;
mod watch;

pub use change::{Change, ChangeContent};
pub use commit::{Author, Commit, CommitDetail, CommitMessage, PushResult};
pub use entry::{Entry, EntryContent, EntryType, ListEntry};
pub use merge::{merge_json, MergeSource, MergedEntry};
pub use pattern::{validate_file_path, PathPattern};
pub use project::{EncryptionMarker, EntityStatus, Project, Repository};
pub use query::{Query, QueryType};
pub use revision::Revision;
pub use watch::{WatchFileResult, WatchRepoResult};
