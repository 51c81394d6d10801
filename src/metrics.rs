//! Watch delivery counters, kept behind a metric-sink seam.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::model::Revision;

/// Collaborator that receives gauge updates. Emission (Prometheus, Micrometer
/// and friends) lives outside this crate; a sink adapter implements this.
pub trait MeterRegistry: Send + Sync {
    fn gauge(&self, name: &'static str, tags: &[(&'static str, &str)], value: i64);
}

#[derive(Default)]
struct Gauges {
    /// Latest revision actually delivered to listeners.
    notified: AtomicI64,
    /// Latest revision observed by the underlying watcher, including
    /// observations dropped by transform deduplication.
    watcher: AtomicI64,
}

/// Per (project, repository, path) watch counters. Both gauges are monotone
/// non-decreasing.
#[derive(Default)]
pub struct WatchMetrics {
    gauges: DashMap<(String, String, String), Arc<Gauges>>,
    sink: Option<Arc<dyn MeterRegistry>>,
}

impl WatchMetrics {
    pub fn new() -> WatchMetrics {
        WatchMetrics::default()
    }

    pub fn with_sink(sink: Arc<dyn MeterRegistry>) -> WatchMetrics {
        WatchMetrics {
            gauges: DashMap::new(),
            sink: Some(sink),
        }
    }

    pub fn record_watcher_revision(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        revision: Revision,
    ) {
        let g = self.entry(project, repo, path);
        let v = monotonic_max(&g.watcher, i64::from(revision.value()));
        self.emit("watches.revisions.watcher", project, repo, path, v);
    }

    pub fn record_notified_revision(
        &self,
        project: &str,
        repo: &str,
        path: &str,
        revision: Revision,
    ) {
        let g = self.entry(project, repo, path);
        let v = monotonic_max(&g.notified, i64::from(revision.value()));
        self.emit("watches.revisions.notified", project, repo, path, v);
    }

    pub fn watcher_revision(&self, project: &str, repo: &str, path: &str) -> i64 {
        self.entry(project, repo, path).watcher.load(Ordering::Acquire)
    }

    pub fn notified_revision(&self, project: &str, repo: &str, path: &str) -> i64 {
        self.entry(project, repo, path).notified.load(Ordering::Acquire)
    }

    fn entry(&self, project: &str, repo: &str, path: &str) -> Arc<Gauges> {
        self.gauges
            .entry((project.to_string(), repo.to_string(), path.to_string()))
            .or_default()
            .clone()
    }

    fn emit(&self, name: &'static str, project: &str, repo: &str, path: &str, value: i64) {
        if let Some(sink) = &self.sink {
            sink.gauge(
                name,
                &[("project", project), ("repository", repo), ("path", path)],
                value,
            );
        }
    }
}

fn monotonic_max(cell: &AtomicI64, value: i64) -> i64 {
    cell.fetch_max(value, Ordering::AcqRel).max(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gauges_are_monotone() {
        let m = WatchMetrics::new();
        m.record_watcher_revision("p", "r", "/a.json", Revision::from(3));
        m.record_watcher_revision("p", "r", "/a.json", Revision::from(2));
        assert_eq!(m.watcher_revision("p", "r", "/a.json"), 3);

        m.record_notified_revision("p", "r", "/a.json", Revision::from(2));
        assert_eq!(m.notified_revision("p", "r", "/a.json"), 2);
        assert_eq!(m.notified_revision("p", "r", "/other"), 0);
    }
}
