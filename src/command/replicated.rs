use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::executor::{CommandExecutor, ExecutorState, StandaloneCommandExecutor};
use super::{Command, CommandResult, Transform};
use crate::error::{Error, Result};
use crate::replication::{LeaderElector, ReplicationLog, SnapshotSource};

/// Routes every command through the replication log and applies entries in
/// log order against the local state machine.
///
/// Any replica accepts a write: the log assigns the total order, and each
/// replica's apply task consumes entries strictly in sequence. Replay after
/// a restart resumes from the persisted last-applied position; a push that
/// already advanced the head on a previous run surfaces `ChangeConflict`
/// during replay and is treated as a no-op, which is what makes re-applying
/// the tail idempotent.
pub struct ReplicatedCommandExecutor {
    local: Arc<StandaloneCommandExecutor>,
    log: Arc<dyn ReplicationLog>,
    elector: Arc<dyn LeaderElector>,
    snapshot: Option<Arc<dyn SnapshotSource>>,
    pending: Arc<DashMap<u64, oneshot::Sender<Result<CommandResult>>>>,
    unclaimed: Arc<DashMap<u64, Result<CommandResult>>>,
    last_applied: Arc<AtomicU64>,
    position_path: PathBuf,
    state: AtomicU8,
    apply_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ReplicatedCommandExecutor {
    /// `position_dir` is this replica's private directory holding its replay
    /// position.
    pub fn new(
        local: Arc<StandaloneCommandExecutor>,
        log: Arc<dyn ReplicationLog>,
        elector: Arc<dyn LeaderElector>,
        snapshot: Option<Arc<dyn SnapshotSource>>,
        position_dir: &Path,
    ) -> ReplicatedCommandExecutor {
        ReplicatedCommandExecutor {
            local,
            log,
            elector,
            snapshot,
            pending: Arc::new(DashMap::new()),
            unclaimed: Arc::new(DashMap::new()),
            last_applied: Arc::new(AtomicU64::new(0)),
            position_path: position_dir.join("last_applied"),
            state: AtomicU8::new(0),
            apply_task: Mutex::new(None),
        }
    }

    fn load_position(&self) -> Result<u64> {
        match fs::read_to_string(&self.position_path) {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::ReplicationUnavailable("corrupt replay position".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn store_position(path: &Path, seq: u64) {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(path, seq.to_string()) {
            warn!(seq, error = %e, "failed to persist replay position");
        }
    }

    /// Replays everything after the last-applied position, installing a
    /// snapshot first when the log no longer retains that range.
    async fn catch_up(&self) -> Result<()> {
        let mut last = self.load_position()?;
        let horizon = self.log.snapshot_horizon();
        if last < horizon {
            match &self.snapshot {
                Some(source) => {
                    info!(last, horizon, "behind the compaction horizon; installing snapshot");
                    let source = source.clone();
                    let data_dir = self.local.projects().data_dir().to_path_buf();
                    tokio::task::spawn_blocking(move || source.install(&data_dir))
                        .await
                        .map_err(|e| Error::ReplicationUnavailable(e.to_string()))??;
                    last = horizon;
                }
                None => {
                    return Err(Error::ReplicationUnavailable(format!(
                        "replica is at {} but the log starts after {}",
                        last, horizon
                    )))
                }
            }
        }
        let entries = self.log.read_from(last + 1)?;
        let replayed = entries.len();
        for entry in entries {
            match self.local.apply(entry.command).await {
                Ok(_) => {}
                // An entry this replica already applied before it lost its
                // position; the stale base revision makes it a no-op.
                Err(Error::ChangeConflict(_)) => {}
                Err(e) => warn!(seq = entry.seq, error = %e, "replayed command failed"),
            }
            last = entry.seq;
        }
        self.last_applied.store(last, Ordering::Release);
        Self::store_position(&self.position_path, last);
        if replayed > 0 {
            info!(replayed, last, "replay finished");
        }
        Ok(())
    }

    fn normalize_push_base(&self, command: Command) -> Result<Command> {
        match command {
            Command::NormalizingPush {
                timestamp_millis,
                author,
                project_name,
                repo_name,
                base_revision,
                summary,
                detail,
                changes,
            } => {
                let repo = self
                    .local
                    .projects()
                    .project(&project_name)?
                    .repo(&repo_name)?;
                let base_revision = repo.normalize_revision(base_revision)?;
                Ok(Command::NormalizingPush {
                    timestamp_millis,
                    author,
                    project_name,
                    repo_name,
                    base_revision,
                    summary,
                    detail,
                    changes,
                })
            }
            Command::PushAsIs {
                timestamp_millis,
                author,
                project_name,
                repo_name,
                base_revision,
                summary,
                detail,
                changes,
            } => {
                let repo = self
                    .local
                    .projects()
                    .project(&project_name)?
                    .repo(&repo_name)?;
                let base_revision = repo.normalize_revision(base_revision)?;
                Ok(Command::PushAsIs {
                    timestamp_millis,
                    author,
                    project_name,
                    repo_name,
                    base_revision,
                    summary,
                    detail,
                    changes,
                })
            }
            other => Ok(other),
        }
    }

    fn spawn_apply_task(&self) {
        let local = self.local.clone();
        let log = self.log.clone();
        let pending = self.pending.clone();
        let unclaimed = self.unclaimed.clone();
        let last_applied = self.last_applied.clone();
        let position_path = self.position_path.clone();
        let mut rx = self.log.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let from = last_applied.load(Ordering::Acquire) + 1;
                let entries = match log.read_from(from) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(error = %e, "cannot read the replication log");
                        Vec::new()
                    }
                };
                for entry in entries {
                    let seq = entry.seq;
                    debug!(seq, "applying replicated command");
                    let result = local.apply(entry.command).await;
                    last_applied.store(seq, Ordering::Release);
                    Self::store_position(&position_path, seq);
                    match pending.remove(&seq) {
                        Some((_, tx)) => {
                            let _ = tx.send(result);
                        }
                        None => {
                            if let Err(e) = &result {
                                debug!(seq, error = %e, "remote command failed locally");
                            }
                            unclaimed.insert(seq, result);
                            // The submitter may have registered between the
                            // two lookups; settle it from the buffer.
                            if let Some((_, tx)) = pending.remove(&seq) {
                                if let Some((_, result)) = unclaimed.remove(&seq) {
                                    let _ = tx.send(result);
                                }
                            }
                            // Bound the buffer of results nobody collected.
                            if seq > 128 {
                                unclaimed.retain(|k, _| *k + 128 > seq);
                            }
                        }
                    }
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
        *self.apply_task.lock() = Some(task);
    }
}

#[async_trait]
impl CommandExecutor for ReplicatedCommandExecutor {
    async fn execute(&self, command: Command) -> Result<CommandResult> {
        if self.state() != ExecutorState::Started {
            return Err(Error::ReadOnly("executor is not started".to_string()));
        }
        let (command, force) = match command {
            Command::ForcePush { command } => (*command, true),
            other => (other, false),
        };
        if !force && !self.is_writable() {
            return Err(Error::ReadOnly(
                "the server is in read-only mode".to_string(),
            ));
        }
        if let Some((project, repo)) = command.push_target() {
            self.local.quota().try_acquire(project, repo)?;
        }
        // Pushes are logged with an absolute base revision: that is what lets
        // a replayed entry that already advanced the head be recognized as a
        // conflict and skipped.
        let command = self.normalize_push_base(command)?;

        let seq = self
            .log
            .append(&command)
            .map_err(|e| Error::ReplicationUnavailable(e.to_string()))?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        // The apply task may already have finished this entry.
        if let Some((_, result)) = self.unclaimed.remove(&seq) {
            self.pending.remove(&seq);
            return result;
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ReplicationUnavailable(
                "executor stopped before the command was applied".to_string(),
            )),
        }
    }

    async fn execute_transform(&self, transform: Transform) -> Result<CommandResult> {
        if self.state() != ExecutorState::Started {
            return Err(Error::ReadOnly("executor is not started".to_string()));
        }
        // Resolve locally; only the resulting push is replicated.
        let command = self.local.resolve_transform(transform)?;
        self.execute(command).await
    }

    async fn start(&self) -> Result<()> {
        self.catch_up().await?;
        self.spawn_apply_task();
        self.local.start().await?;
        self.state.store(1, Ordering::Release);

        let local = self.local.clone();
        let on_take: Box<dyn Fn() + Send + Sync> = Box::new(move || {
            local.set_writable(true);
        });
        let local = self.local.clone();
        let on_release: Box<dyn Fn() + Send + Sync> = Box::new(move || {
            local.set_writable(false);
        });
        self.elector.campaign(on_take, on_release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.store(2, Ordering::Release);
        self.elector.resign();
        if let Some(task) = self.apply_task.lock().take() {
            task.abort();
        }
        self.local.stop().await?;
        self.state.store(3, Ordering::Release);
        Ok(())
    }

    fn state(&self) -> ExecutorState {
        match self.state.load(Ordering::Acquire) {
            0 => ExecutorState::New,
            1 => ExecutorState::Started,
            2 => ExecutorState::Stopping,
            _ => ExecutorState::Stopped,
        }
    }

    fn is_writable(&self) -> bool {
        self.local.is_writable()
    }

    fn set_writable(&self, writable: bool) {
        self.local.set_writable(writable)
    }
}
