use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Change, Commit, Entry, MergeSource, MergedEntry, Query, Revision};

/// Cache key: one read operation against one repository, with every
/// revision already normalized to its absolute number so that `head` and the
/// equivalent absolute revision share a slot.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub project: String,
    pub repo: String,
    pub op: CacheOp,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum CacheOp {
    Get {
        revision: Revision,
        query: Query,
    },
    List {
        revision: Revision,
        pattern: String,
    },
    History {
        from: Revision,
        to: Revision,
        pattern: String,
        max_commits: usize,
    },
    Diff {
        from: Revision,
        to: Revision,
        pattern: String,
    },
    DiffFile {
        from: Revision,
        to: Revision,
        query: Query,
    },
    MergedQuery {
        revision: Revision,
        sources: Vec<MergeSource>,
        expressions: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CachedValue {
    Entry(Option<Entry>),
    Entries(Vec<Entry>),
    Commits(Vec<Commit>),
    Changes(Vec<Change>),
    Change(Change),
    Merged(MergedEntry),
}

/// A cached value plus its weight, measured once as encoded byte size.
#[derive(Debug)]
pub struct Weighted {
    pub value: CachedValue,
    weight: u32,
}

impl Weighted {
    /// Wraps a value computed outside any cache.
    pub fn unweighted(value: CachedValue) -> Weighted {
        Weighted { value, weight: 0 }
    }
}

/// Process-wide bounded read cache shared by every repository. Size-and-age
/// eviction: entries are weighed by encoded byte size against a maximum
/// total weight, and expire after the configured idle period. Invalidation
/// is per repository, on every successful commit.
pub struct RepositoryCache {
    cache: Cache<CacheKey, Arc<Weighted>>,
}

impl RepositoryCache {
    pub fn new(max_weight: u64, expire_after_access: Duration) -> RepositoryCache {
        let cache = Cache::builder()
            .max_capacity(max_weight)
            .weigher(|_k: &CacheKey, v: &Arc<Weighted>| v.weight)
            .time_to_idle(expire_after_access)
            .support_invalidation_closures()
            .build();
        RepositoryCache { cache }
    }

    /// Returns the cached value or computes it, coalescing concurrent
    /// lookups of the same key into a single load.
    pub fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<Arc<Weighted>>
    where
        F: FnOnce() -> Result<CachedValue>,
    {
        self.cache
            .try_get_with(key, || {
                let value = compute()?;
                let weight = serde_json::to_vec(&value)
                    .map(|b| b.len() as u32)
                    .unwrap_or(u32::MAX);
                Ok(Arc::new(Weighted { value, weight }))
            })
            .map_err(|e: Arc<Error>| e.duplicate())
    }

    /// Drops every cached read of the given repository.
    pub fn invalidate_repo(&self, project: &str, repo: &str) {
        let project = project.to_string();
        let repo = repo.to_string();
        let _ = self
            .cache
            .invalidate_entries_if(move |k, _| k.project == project && k.repo == repo);
    }

}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(repo: &str, rev: i32) -> CacheKey {
        CacheKey {
            project: "foo".to_string(),
            repo: repo.to_string(),
            op: CacheOp::List {
                revision: Revision::from(rev),
                pattern: "/**".to_string(),
            },
        }
    }

    #[test]
    fn computes_once_per_key() {
        let cache = RepositoryCache::new(1024 * 1024, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_compute(key("bar", 1), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(CachedValue::Entries(Vec::new()))
                })
                .unwrap();
            assert!(matches!(v.value, CachedValue::Entries(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = RepositoryCache::new(1024, Duration::from_secs(60));
        let out = cache.get_or_compute(key("bar", 1), || {
            Err(Error::RevisionNotFound(Revision::from(42)))
        });
        assert!(matches!(out, Err(Error::RevisionNotFound(_))));
        // The next lookup recomputes.
        let out = cache.get_or_compute(key("bar", 1), || Ok(CachedValue::Entry(None)));
        assert!(out.is_ok());
    }

    #[test]
    fn invalidation_is_per_repository() {
        let cache = RepositoryCache::new(1024 * 1024, Duration::from_secs(60));
        cache
            .get_or_compute(key("bar", 1), || Ok(CachedValue::Entry(None)))
            .unwrap();
        cache
            .get_or_compute(key("baz", 1), || Ok(CachedValue::Entry(None)))
            .unwrap();
        cache.invalidate_repo("foo", "bar");

        let recomputed = AtomicUsize::new(0);
        cache
            .get_or_compute(key("bar", 1), || {
                recomputed.fetch_add(1, Ordering::SeqCst);
                Ok(CachedValue::Entry(None))
            })
            .unwrap();
        cache
            .get_or_compute(key("baz", 1), || {
                recomputed.fetch_add(10, Ordering::SeqCst);
                Ok(CachedValue::Entry(None))
            })
            .unwrap();
        // Only the invalidated repository misses.
        assert_eq!(recomputed.load(Ordering::SeqCst), 1);
    }
}
