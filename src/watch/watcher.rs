use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch as watch_channel;
use tracing::{debug, warn};

use super::{value_of, watch_file, watch_repo};
use crate::error::Result;
use crate::metrics::WatchMetrics;
use crate::model::{PathPattern, Query, Revision};
use crate::repository::Repo;

pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(60);
const DELAY_ON_SUCCESS: Duration = Duration::from_secs(1);
const MAX_FAILED_COUNT: usize = 5; // Max base wait time 2 << 5 = 64 secs
const JITTER_RATE: f32 = 0.2;

fn delay_time_for(failed_count: usize) -> Duration {
    let base_time_ms = (2u64 << failed_count) * 1000;
    let jitter = (fastrand::f32() * JITTER_RATE * base_time_ms as f32) as u64;

    Duration::from_millis(base_time_ms + jitter)
}

/// The most recent observation of a watcher.
#[derive(Debug, Clone)]
pub struct Latest<T> {
    pub revision: Revision,
    pub value: T,
}

/// Counter tags for one watcher, updated through [`WatchMetrics`].
pub struct WatcherMetrics {
    metrics: Arc<WatchMetrics>,
    project: String,
    repo: String,
    path: String,
}

impl WatcherMetrics {
    pub fn new(metrics: Arc<WatchMetrics>, project: &str, repo: &str, path: &str) -> Self {
        WatcherMetrics {
            metrics,
            project: project.to_string(),
            repo: repo.to_string(),
            path: path.to_string(),
        }
    }

    fn observed(&self, revision: Revision) {
        self.metrics
            .record_watcher_revision(&self.project, &self.repo, &self.path, revision);
    }

    fn notified(&self, revision: Revision) {
        self.metrics
            .record_notified_revision(&self.project, &self.repo, &self.path, revision);
    }
}

type Listener<T> = Arc<dyn Fn(Revision, &T) + Send + Sync>;

struct Shared<T> {
    latest: RwLock<Option<Latest<T>>>,
    listeners: Mutex<Vec<Listener<T>>>,
    initial: watch_channel::Sender<bool>,
    closed: AtomicBool,
    metrics: Option<WatcherMetrics>,
}

impl<T: Clone + Send + Sync + 'static> Shared<T> {
    fn new(metrics: Option<WatcherMetrics>) -> Shared<T> {
        Shared {
            latest: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            initial: watch_channel::channel(false).0,
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    fn observed(&self, revision: Revision) {
        if let Some(m) = &self.metrics {
            m.observed(revision);
        }
    }

    /// Records the new observation and notifies every listener in
    /// registration order. A panicking listener is isolated: it stays
    /// registered and the remaining listeners still run.
    fn deliver(&self, revision: Revision, value: T) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        *self.latest.write() = Some(Latest {
            revision,
            value: value.clone(),
        });
        self.initial.send_replace(true);

        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(revision, &value)));
            if outcome.is_err() {
                warn!(
                    revision = revision.value(),
                    "watch listener panicked; keeping it registered"
                );
            }
        }
        if let Some(m) = &self.metrics {
            m.notified(revision);
        }
    }
}

/// A long-lived subscription that always exposes the latest value observed
/// for a file query or path pattern.
///
/// The watcher re-issues watch calls on its own task: after a successful
/// round-trip the next call is delayed by about a second to coalesce
/// flurries, and failures back off exponentially with jitter. `close` makes
/// the watcher deaf — the task stops, outstanding long-polls are cancelled,
/// and `latest` keeps returning the last observation.
pub struct Watcher<T> {
    shared: Arc<Shared<T>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> Watcher<T> {
    /// Spawns a watcher around a fetch function that performs one watch
    /// round-trip: given the last delivered revision, it resolves the next
    /// `(revision, value)` observation, or `None` on timeout.
    pub fn spawn<F>(fetch: F, metrics: Option<WatcherMetrics>) -> Watcher<T>
    where
        F: Fn(Option<Revision>) -> BoxFuture<'static, Result<Option<(Revision, T)>>>
            + Send
            + Sync
            + 'static,
    {
        let shared = Arc::new(Shared::new(metrics));
        let task = tokio::spawn(run_loop(shared.clone(), fetch));
        Watcher {
            shared,
            task: Some(task),
        }
    }

    /// The most recent observation, if any arrived yet.
    pub fn latest(&self) -> Option<Latest<T>> {
        self.shared.latest.read().clone()
    }

    /// Waits until the first observation arrives.
    pub async fn await_initial_value(&self) -> Option<Latest<T>> {
        let mut rx = self.shared.initial.subscribe();
        loop {
            if *rx.borrow() {
                return self.latest();
            }
            if rx.changed().await.is_err() {
                return self.latest();
            }
        }
    }

    /// Waits until the first observation arrives, up to `timeout`.
    pub async fn await_initial_value_timeout(&self, timeout: Duration) -> Option<Latest<T>> {
        tokio::time::timeout(timeout, self.await_initial_value())
            .await
            .unwrap_or(None)
    }

    /// Subscribes a listener. It observes the current value right away, when
    /// one exists, and every subsequent distinct value after that.
    pub fn watch<L>(&self, listener: L)
    where
        L: Fn(Revision, &T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let mut listeners = self.shared.listeners.lock();
        if let Some(latest) = self.shared.latest.read().clone() {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener(latest.revision, &latest.value)));
            if outcome.is_err() {
                warn!("watch listener panicked on initial value; keeping it registered");
            }
        }
        listeners.push(listener);
    }

    /// Stops watching. The last observation stays readable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// A derived watcher that applies a pure function to every observation
    /// and emits only when the transformed value differs from the previous
    /// one, by value equality.
    pub fn map<U, F>(&self, transform: F, metrics: Option<WatcherMetrics>) -> Watcher<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let derived = Arc::new(Shared::<U>::new(metrics));
        let target = derived.clone();
        self.watch(move |revision, value| {
            if target.closed.load(Ordering::Acquire) {
                return;
            }
            target.observed(revision);
            let transformed = transform(value);
            let distinct = target
                .latest
                .read()
                .as_ref()
                .map(|l| l.value != transformed)
                .unwrap_or(true);
            if distinct {
                target.deliver(revision, transformed);
            }
        });
        Watcher {
            shared: derived,
            task: None,
        }
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

async fn run_loop<T, F>(shared: Arc<Shared<T>>, fetch: F)
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Option<Revision>) -> BoxFuture<'static, Result<Option<(Revision, T)>>>
        + Send
        + Sync
        + 'static,
{
    let mut last_delivered: Option<Revision> = None;
    let mut failed_count = 0usize;
    let mut success_delay: Option<Duration> = None;

    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(d) = success_delay.take() {
            tokio::time::sleep(d).await;
        }
        match fetch(last_delivered).await {
            Ok(Some((revision, value))) => {
                last_delivered = Some(revision);
                failed_count = 0;
                success_delay = Some(DELAY_ON_SUCCESS);
                shared.observed(revision);
                let target = shared.clone();
                // Listeners run on the blocking pool so a slow one cannot
                // stall the runtime.
                let _ = tokio::task::spawn_blocking(move || target.deliver(revision, value))
                    .await;
            }
            Ok(None) => {
                failed_count = 0;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                debug!("watch request failed: {}", e);
                if failed_count < MAX_FAILED_COUNT {
                    failed_count += 1;
                }
                tokio::time::sleep(delay_time_for(failed_count)).await;
            }
        }
    }
}

/// Watches the projection of a single file. The value is the projected JSON
/// value; text content is observed as a JSON string.
pub fn file_watcher(
    repo: Arc<Repo>,
    query: Query,
    metrics: Option<WatcherMetrics>,
) -> Watcher<Value> {
    Watcher::spawn(
        move |last| {
            let repo = repo.clone();
            let query = query.clone();
            async move {
                match last {
                    None => {
                        let head = repo.head();
                        Ok(repo
                            .get(head, &query)?
                            .map(|entry| (head, value_of(&entry.content))))
                    }
                    Some(last) => Ok(watch_file(&repo, last, &query, DEFAULT_WATCH_TIMEOUT)
                        .await?
                        .map(|(revision, entry)| (revision, value_of(&entry.content)))),
                }
            }
            .boxed()
        },
        metrics,
    )
}

/// Watches a path pattern over a whole repository; the observed value is the
/// matched revision itself.
pub fn repo_watcher(
    repo: Arc<Repo>,
    pattern: PathPattern,
    metrics: Option<WatcherMetrics>,
) -> Watcher<Revision> {
    Watcher::spawn(
        move |last| {
            let repo = repo.clone();
            let pattern = pattern.clone();
            async move {
                match last {
                    None => {
                        let head = repo.head();
                        Ok(Some((head, head)))
                    }
                    Some(last) => Ok(watch_repo(&repo, last, &pattern, DEFAULT_WATCH_TIMEOUT)
                        .await?
                        .map(|revision| (revision, revision))),
                }
            }
            .boxed()
        },
        metrics,
    )
}
