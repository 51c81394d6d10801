//! Near-real-time change notification.
//!
//! A watch call resolves the first revision after the caller's last-known
//! revision where its matcher observes a different state, or `None` when the
//! deadline passes first. Waiters hold no thread while suspended: they park
//! on the repository's head channel and are woken by the commit path.

mod watcher;

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

pub use watcher::{file_watcher, repo_watcher, Latest, Watcher, WatcherMetrics};

use crate::error::Result;
use crate::model::{Entry, EntryContent, PathPattern, Query, Revision};
use crate::repository::Repo;

/// Waits for the first revision newer than `last_known` whose commit touches
/// a path matching `pattern`. Returns `None` when the deadline expires, and
/// immediately when an intervening commit already matches.
pub async fn watch_repo(
    repo: &Repo,
    last_known: Revision,
    pattern: &PathPattern,
    timeout: Duration,
) -> Result<Option<Revision>> {
    let mut rx = repo.head_receiver();
    let mut checked = last_known.normalize(repo.head())?;
    let deadline = Instant::now() + timeout;

    loop {
        let head = repo.head();
        while checked < head {
            checked = checked.forward();
            let commit = repo.commit_object(checked)?;
            let touches = commit
                .changes
                .iter()
                .flat_map(|c| c.touched_paths())
                .any(|p| pattern.matches(p));
            if touches {
                return Ok(Some(checked));
            }
        }
        // Cancellation drops this future and with it the parked waiter.
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            // Repository dropped or deadline passed: timeout sentinel.
            Ok(Err(_)) | Err(_) => return Ok(None),
        }
    }
}

/// Waits for the first revision newer than `last_known` where the query's
/// projected output differs from its output at `last_known`, by structural
/// equality. Commits that touch the file without changing the projection do
/// not wake the waiter.
pub async fn watch_file(
    repo: &Repo,
    last_known: Revision,
    query: &Query,
    timeout: Duration,
) -> Result<Option<(Revision, Entry)>> {
    let mut rx = repo.head_receiver();
    let mut checked = last_known.normalize(repo.head())?;
    let baseline = projected_at(repo, checked, query)?;
    let deadline = Instant::now() + timeout;

    loop {
        let head = repo.head();
        while checked < head {
            checked = checked.forward();
            if let Some(entry) = repo.get(checked, query)? {
                let value = value_of(&entry.content);
                if baseline.as_ref() != Some(&value) {
                    return Ok(Some((checked, entry)));
                }
            }
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) | Err(_) => return Ok(None),
        }
    }
}

fn projected_at(repo: &Repo, revision: Revision, query: &Query) -> Result<Option<Value>> {
    Ok(repo.get(revision, query)?.map(|e| value_of(&e.content)))
}

/// The comparison value of projected content: JSON as-is, text as a string.
pub(crate) fn value_of(content: &EntryContent) -> Value {
    match content {
        EntryContent::Json(v) => v.clone(),
        EntryContent::Text(s) | EntryContent::Yaml(s) => Value::String(s.clone()),
        EntryContent::Directory => Value::Null,
    }
}
