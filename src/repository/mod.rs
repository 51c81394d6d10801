//! The versioned repository engine: an append-only commit log per repository
//! over the content-addressed object store, with revision normalization,
//! tree listing, queries, history, diff and atomic multi-file commits.

mod apply;
mod cache;
mod diff;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error};

pub use apply::{apply_changes, Snapshot};
pub use cache::{CacheKey, CacheOp, CachedValue, RepositoryCache, Weighted};
pub use diff::entry_diff;

use crate::error::{Error, Result};
use crate::model::{
    Author, Change, Commit, CommitDetail, CommitMessage, Entry, EntryContent, MergeSource,
    MergedEntry, PathPattern, Query, Revision,
};
use crate::storage::{CommitObject, ObjectStore};

/// Reserved repository that holds project metadata and operational data.
pub const REPO_DOGMA: &str = "dogma";
/// Reserved repository that holds mirror and integration configuration.
pub const REPO_META: &str = "meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoMetadata {
    creator: Author,
    created_at: String,
}

/// A single repository: one head ref, a commit per revision, and the tree
/// each commit produced.
///
/// Writers are serialized through `write_lock`; readers never take it and
/// observe the head through a watch channel that also drives the watch
/// service. After an unrecoverable storage error the repository is quiesced:
/// reads keep serving but every further write fails until the process is
/// restarted.
pub struct Repo {
    project_name: String,
    name: String,
    store: ObjectStore,
    metadata: RepoMetadata,
    head_tx: watch::Sender<Revision>,
    write_lock: Mutex<()>,
    quiesced: AtomicBool,
    cache: Option<Arc<RepositoryCache>>,
}

impl Repo {
    /// Creates a new repository at `dir` with its initial empty commit at
    /// revision 1.
    pub fn create(
        dir: &Path,
        project_name: &str,
        name: &str,
        author: &Author,
        timestamp: &str,
        cache: Option<Arc<RepositoryCache>>,
    ) -> Result<Arc<Repo>> {
        let meta_path = dir.join("repo.json");
        if meta_path.exists() {
            return Err(Error::RepositoryExists(format!(
                "{}/{}",
                project_name, name
            )));
        }
        fs::create_dir_all(dir)?;
        let store = ObjectStore::open(dir)?;
        let metadata = RepoMetadata {
            creator: author.clone(),
            created_at: timestamp.to_string(),
        };
        fs::write(&meta_path, serde_json::to_vec_pretty(&metadata)?)?;

        let tree = apply::write_tree(&store, &Snapshot::default())?;
        let initial = CommitObject {
            revision: Revision::INIT,
            parent: None,
            tree,
            author: author.clone(),
            timestamp: timestamp.to_string(),
            summary: "Create a new repository".to_string(),
            detail: None,
            changes: Vec::new(),
        };
        let cid = store.put_commit(&initial)?;
        store.update_ref(None, cid)?;
        store.tag_revision(Revision::INIT, cid)?;
        debug!(project = project_name, repo = name, "created repository");

        Ok(Arc::new(Repo {
            project_name: project_name.to_string(),
            name: name.to_string(),
            store,
            metadata,
            head_tx: watch::channel(Revision::INIT).0,
            write_lock: Mutex::new(()),
            quiesced: AtomicBool::new(false),
            cache,
        }))
    }

    /// Opens an existing repository directory.
    pub fn open(
        dir: &Path,
        project_name: &str,
        name: &str,
        cache: Option<Arc<RepositoryCache>>,
    ) -> Result<Arc<Repo>> {
        let metadata: RepoMetadata =
            serde_json::from_slice(&fs::read(dir.join("repo.json"))?)?;
        let store = ObjectStore::open(dir)?;
        let head_id = store.read_ref()?.ok_or_else(|| {
            Error::Storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}/{} has no head ref", project_name, name),
            ))
        })?;
        let head = store.read_commit(&head_id)?.revision;
        Ok(Arc::new(Repo {
            project_name: project_name.to_string(),
            name: name.to_string(),
            store,
            metadata,
            head_tx: watch::channel(head).0,
            write_lock: Mutex::new(()),
            quiesced: AtomicBool::new(false),
            cache,
        }))
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creator(&self) -> &Author {
        &self.metadata.creator
    }

    pub fn created_at(&self) -> &str {
        &self.metadata.created_at
    }

    /// Current head revision.
    pub fn head(&self) -> Revision {
        *self.head_tx.borrow()
    }

    /// A receiver that observes every head advance; the watch service parks
    /// waiters on it.
    pub fn head_receiver(&self) -> watch::Receiver<Revision> {
        self.head_tx.subscribe()
    }

    pub fn normalize_revision(&self, revision: Revision) -> Result<Revision> {
        revision.normalize(self.head())
    }

    /// Appends a commit produced from `changes` against `base`.
    ///
    /// The change set is applied in listing order against the current head
    /// tree. A base older than the head is accepted only when the change set
    /// does not touch any path a later commit touched; otherwise the push
    /// fails with `ChangeConflict`. A change set in which every change is
    /// redundant fails with `RedundantChange`. On success the head ref
    /// advances atomically and the new revision plus the surviving changes
    /// are returned.
    pub fn commit(
        &self,
        base: Revision,
        timestamp: &str,
        author: &Author,
        summary: &str,
        detail: Option<CommitDetail>,
        changes: &[Change],
        normalizing: bool,
    ) -> Result<(Revision, Vec<Change>)> {
        if self.quiesced.load(Ordering::Acquire) {
            return Err(Error::ReadOnly(format!(
                "{}/{} is quiesced after a storage failure",
                self.project_name, self.name
            )));
        }
        if changes.is_empty() {
            return Err(Error::InvalidInput("no changes to commit".to_string()));
        }
        let result = self.commit_inner(base, timestamp, author, summary, detail, changes, normalizing);
        if let Err(Error::Storage(e)) = &result {
            error!(
                project = %self.project_name,
                repo = %self.name,
                error = %e,
                "storage failure, quiescing repository"
            );
            self.quiesced.store(true, Ordering::Release);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_inner(
        &self,
        base: Revision,
        timestamp: &str,
        author: &Author,
        summary: &str,
        detail: Option<CommitDetail>,
        changes: &[Change],
        normalizing: bool,
    ) -> Result<(Revision, Vec<Change>)> {
        let _guard = self.write_lock.lock();

        let head = self.head();
        let base = base.normalize(head)?;

        // A stale base is fine as long as no interleaved commit touched the
        // same paths.
        if base < head {
            let touched: HashSet<String> = changes
                .iter()
                .flat_map(|c| c.touched_paths())
                .map(|p| p.to_string())
                .collect();
            let mut rev = base.forward();
            while rev <= head {
                let interleaved = self.commit_object(rev)?;
                for change in &interleaved.changes {
                    for path in change.touched_paths() {
                        if touched.contains(path) {
                            return Err(Error::ChangeConflict(format!(
                                "{} was modified by revision {} after base revision {}",
                                path, rev, base
                            )));
                        }
                    }
                }
                rev = rev.forward();
            }
        }

        let head_id = self
            .store
            .lookup_revision(head)?
            .ok_or_else(|| corrupt(format!("missing tag for revision {}", head)))?;
        let head_commit = self.store.read_commit(&head_id)?;
        let snapshot = Snapshot::load(&self.store, &head_commit.tree)?;

        let (new_snapshot, applied) =
            apply::apply_changes(&self.store, &snapshot, changes, normalizing)?;
        if applied.is_empty() {
            return Err(Error::RedundantChange);
        }

        let tree = apply::write_tree(&self.store, &new_snapshot)?;
        let revision = head.forward();
        let commit = CommitObject {
            revision,
            parent: Some(head_id),
            tree,
            author: author.clone(),
            timestamp: timestamp.to_string(),
            summary: summary.to_string(),
            detail,
            changes: applied.clone(),
        };
        let cid = self.store.put_commit(&commit)?;
        self.store.update_ref(Some(head_id), cid)?;
        self.store.tag_revision(revision, cid)?;
        self.head_tx.send_replace(revision);

        if let Some(cache) = &self.cache {
            cache.invalidate_repo(&self.project_name, &self.name);
        }
        debug!(
            project = %self.project_name,
            repo = %self.name,
            revision = revision.value(),
            changes = applied.len(),
            "commit"
        );
        Ok((revision, applied))
    }

    /// Queries a single file at the given revision. Returns `None` when the
    /// path does not exist at that revision.
    pub fn get(&self, revision: Revision, query: &Query) -> Result<Option<Entry>> {
        let revision = self.normalize_revision(revision)?;
        let key = self.cache_key(CacheOp::Get {
            revision,
            query: query.clone(),
        });
        let computed = self.cached(key, || {
            let commit = self.commit_object(revision)?;
            let snapshot = Snapshot::load(&self.store, &commit.tree)?;
            let path = query.path();
            let entry = match snapshot.content(&self.store, path)? {
                Some(content) => Some(self.entry_of(
                    path,
                    query.apply(&content)?,
                    revision,
                    Some(commit.timestamp.clone()),
                )),
                None if is_directory(&snapshot, path) => Some(self.entry_of(
                    path,
                    EntryContent::Directory,
                    revision,
                    Some(commit.timestamp.clone()),
                )),
                None => None,
            };
            Ok(CachedValue::Entry(entry))
        })?;
        match &computed.value {
            CachedValue::Entry(e) => Ok(e.clone()),
            _ => unreachable!("cache slot holds what its key computed"),
        }
    }

    /// Like `get` but failing with `EntryNotFound` when absent.
    pub fn get_strict(&self, revision: Revision, query: &Query) -> Result<Entry> {
        self.get(revision, query)?.ok_or_else(|| Error::EntryNotFound {
            revision,
            path: query.path().to_string(),
        })
    }

    pub fn exists(&self, revision: Revision, path: &str) -> Result<bool> {
        let query = Query::identity(path)
            .ok_or_else(|| Error::InvalidInput("empty path".to_string()))?;
        Ok(self.get(revision, &query)?.is_some())
    }

    /// Lists entries matching the pattern at the given revision, in
    /// lexicographic path order. Directories appear as `DIRECTORY` entries
    /// without content.
    pub fn list(&self, revision: Revision, pattern: &PathPattern) -> Result<Vec<Entry>> {
        let revision = self.normalize_revision(revision)?;
        let key = self.cache_key(CacheOp::List {
            revision,
            pattern: pattern.as_str().to_string(),
        });
        let computed = self.cached(key, || {
            let commit = self.commit_object(revision)?;
            let snapshot = Snapshot::load(&self.store, &commit.tree)?;

            let mut paths: BTreeMap<String, EntryContent> = BTreeMap::new();
            for dir in snapshot.directories() {
                if pattern.matches(&dir) {
                    paths.insert(dir, EntryContent::Directory);
                }
            }
            for path in snapshot.files.keys() {
                if pattern.matches(path) {
                    let content = snapshot
                        .content(&self.store, path)?
                        .expect("file just listed");
                    paths.insert(path.clone(), content);
                }
            }
            let entries = paths
                .into_iter()
                .map(|(path, content)| self.entry_of(&path, content, revision, None))
                .collect();
            Ok(CachedValue::Entries(entries))
        })?;
        match &computed.value {
            CachedValue::Entries(e) => Ok(e.clone()),
            _ => unreachable!("cache slot holds what its key computed"),
        }
    }

    /// Commits in the closed revision interval whose change set touches the
    /// pattern, ordered along the `from` -> `to` direction (`from > to`
    /// yields newest first), bounded by `max_commits` when non-zero.
    pub fn history(
        &self,
        from: Revision,
        to: Revision,
        pattern: &PathPattern,
        max_commits: usize,
    ) -> Result<Vec<Commit>> {
        let from = self.normalize_revision(from)?;
        let to = self.normalize_revision(to)?;
        let key = self.cache_key(CacheOp::History {
            from,
            to,
            pattern: pattern.as_str().to_string(),
            max_commits,
        });
        let computed = self.cached(key, || {
            let (lo, hi) = (from.min(to), from.max(to));
            let mut commits = Vec::new();
            let mut rev = lo;
            while rev <= hi {
                let commit = self.commit_object(rev)?;
                let touches = commit
                    .changes
                    .iter()
                    .flat_map(|c| c.touched_paths())
                    .any(|p| pattern.matches(p));
                if touches {
                    commits.push(Commit {
                        revision: commit.revision,
                        author: commit.author.clone(),
                        commit_message: CommitMessage {
                            summary: commit.summary.clone(),
                            detail: commit.detail.clone(),
                        },
                        pushed_at: Some(commit.timestamp.clone()),
                    });
                }
                rev = rev.forward();
            }
            if from > to {
                commits.reverse();
            }
            if max_commits > 0 {
                commits.truncate(max_commits);
            }
            Ok(CachedValue::Commits(commits))
        })?;
        match &computed.value {
            CachedValue::Commits(c) => Ok(c.clone()),
            _ => unreachable!("cache slot holds what its key computed"),
        }
    }

    /// Minimal changes that turn the tree at `from` into the tree at `to`,
    /// restricted to the pattern.
    pub fn diff(
        &self,
        from: Revision,
        to: Revision,
        pattern: &PathPattern,
    ) -> Result<Vec<Change>> {
        let from = self.normalize_revision(from)?;
        let to = self.normalize_revision(to)?;
        let key = self.cache_key(CacheOp::Diff {
            from,
            to,
            pattern: pattern.as_str().to_string(),
        });
        let computed = self.cached(key, || {
            let from_snapshot = self.snapshot_at(from)?;
            let to_snapshot = self.snapshot_at(to)?;
            let changes = diff::tree_diff(&self.store, &from_snapshot, &to_snapshot, pattern)?;
            Ok(CachedValue::Changes(changes))
        })?;
        match &computed.value {
            CachedValue::Changes(c) => Ok(c.clone()),
            _ => unreachable!("cache slot holds what its key computed"),
        }
    }

    /// Single-file diff with the query projection applied to both sides.
    pub fn diff_file(&self, from: Revision, to: Revision, query: &Query) -> Result<Change> {
        let from = self.normalize_revision(from)?;
        let to = self.normalize_revision(to)?;
        let key = self.cache_key(CacheOp::DiffFile {
            from,
            to,
            query: query.clone(),
        });
        let computed = self.cached(key, || {
            let old = self.get(from, query)?.map(|e| e.content);
            let new = self.get(to, query)?.map(|e| e.content);
            if old.is_none() && new.is_none() {
                return Err(Error::EntryNotFound {
                    revision: to,
                    path: query.path().to_string(),
                });
            }
            let change = diff::query_diff(query.path(), old.as_ref(), new.as_ref())?;
            Ok(CachedValue::Change(change))
        })?;
        match &computed.value {
            CachedValue::Change(c) => Ok(c.clone()),
            _ => unreachable!("cache slot holds what its key computed"),
        }
    }

    /// Merges the JSON documents at the given paths in order, then applies
    /// the JSON path expressions to the merged result. A missing source
    /// fails the merge unless it is marked optional; a merge with no
    /// surviving source fails with `EntryNotFound`.
    pub fn merge_query(
        &self,
        revision: Revision,
        sources: &[MergeSource],
        expressions: &[String],
    ) -> Result<MergedEntry> {
        let revision = self.normalize_revision(revision)?;
        let key = self.cache_key(CacheOp::MergedQuery {
            revision,
            sources: sources.to_vec(),
            expressions: expressions.to_vec(),
        });
        let computed = self.cached(key, || {
            let mut merged = serde_json::Value::Null;
            let mut paths = Vec::new();
            for source in sources {
                let query = Query::of_json(&source.path).ok_or_else(|| {
                    Error::InvalidInput(format!("invalid merge source: {}", source.path))
                })?;
                match self.get(revision, &query)? {
                    Some(entry) => {
                        let value = match entry.content {
                            EntryContent::Json(v) => v,
                            _ => {
                                return Err(Error::QueryExecution(format!(
                                    "{} is not a JSON entry",
                                    source.path
                                )))
                            }
                        };
                        if paths.is_empty() {
                            merged = value;
                        } else {
                            crate::model::merge_json(&mut merged, value);
                        }
                        paths.push(source.path.clone());
                    }
                    None if source.optional => {}
                    None => {
                        return Err(Error::EntryNotFound {
                            revision,
                            path: source.path.clone(),
                        })
                    }
                }
            }
            if paths.is_empty() {
                return Err(Error::EntryNotFound {
                    revision,
                    path: "no merge source exists".to_string(),
                });
            }
            let mut content = merged;
            for expr in expressions {
                let query = Query::of_json_path("/merged.json", vec![expr.clone()])
                    .ok_or_else(|| Error::QueryExecution(format!("bad expression: {}", expr)))?;
                content = match query.apply(&EntryContent::Json(content))? {
                    EntryContent::Json(v) => v,
                    other => {
                        return Err(Error::QueryExecution(format!(
                            "unexpected projection result: {:?}",
                            other
                        )))
                    }
                };
            }
            Ok(CachedValue::Merged(MergedEntry {
                revision,
                r#type: crate::model::EntryType::Json,
                paths,
                content,
            }))
        })?;
        match &computed.value {
            CachedValue::Merged(m) => Ok(m.clone()),
            _ => unreachable!("cache slot holds what its key computed"),
        }
    }

    /// Applies the changes in memory against `base` and returns the minimal
    /// set that would actually alter state; redundant changes are dropped.
    pub fn preview_diff(&self, base: Revision, changes: &[Change]) -> Result<Vec<Change>> {
        let base = self.normalize_revision(base)?;
        let snapshot = self.snapshot_at(base)?;
        let (_, applied) = apply::apply_changes(&self.store, &snapshot, changes, true)?;
        Ok(applied)
    }

    /// The stored commit object at an absolute revision.
    pub fn commit_object(&self, revision: Revision) -> Result<CommitObject> {
        let id = self
            .store
            .lookup_revision(revision)?
            .ok_or(Error::RevisionNotFound(revision))?;
        Ok(self.store.read_commit(&id)?)
    }

    fn snapshot_at(&self, revision: Revision) -> Result<Snapshot> {
        let commit = self.commit_object(revision)?;
        Snapshot::load(&self.store, &commit.tree)
    }

    fn entry_of(
        &self,
        path: &str,
        content: EntryContent,
        revision: Revision,
        modified_at: Option<String>,
    ) -> Entry {
        Entry {
            path: path.to_string(),
            content,
            revision,
            url: format!(
                "/api/v1/projects/{}/repos/{}/contents{}",
                self.project_name, self.name, path
            ),
            modified_at,
        }
    }

    fn cache_key(&self, op: CacheOp) -> CacheKey {
        CacheKey {
            project: self.project_name.clone(),
            repo: self.name.clone(),
            op,
        }
    }

    fn cached<F>(&self, key: CacheKey, compute: F) -> Result<Arc<Weighted>>
    where
        F: FnOnce() -> Result<CachedValue>,
    {
        match &self.cache {
            Some(cache) => cache.get_or_compute(key, compute),
            None => {
                let value = compute()?;
                Ok(Arc::new(Weighted::unweighted(value)))
            }
        }
    }
}

fn is_directory(snapshot: &Snapshot, path: &str) -> bool {
    let prefix = format!("{}/", path);
    snapshot.files.keys().any(|k| k.starts_with(&prefix))
}

fn corrupt(message: String) -> Error {
    Error::Storage(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        message,
    ))
}
