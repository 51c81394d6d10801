//! Content-addressed object storage backing each repository.

mod object;
mod store;

pub use object::{CommitObject, ObjectId, ObjectKind, TreeEntry, TreeEntryKind, TreeObject};
pub use store::ObjectStore;
