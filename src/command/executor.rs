use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::info;

use super::{format_timestamp, Command, CommandResult, Transform};
use crate::error::{Error, Result};
use crate::model::{Change, PushResult};
use crate::project::ProjectManager;
use crate::quota::WriteQuota;
use crate::session::SessionManager;

/// Executor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    New,
    Started,
    Stopping,
    Stopped,
}

impl ExecutorState {
    fn from_u8(v: u8) -> ExecutorState {
        match v {
            0 => ExecutorState::New,
            1 => ExecutorState::Started,
            2 => ExecutorState::Stopping,
            _ => ExecutorState::Stopped,
        }
    }
}

pub type LeadershipCallback = Box<dyn Fn() + Send + Sync>;

/// The bounded pool that runs mutating repository and project operations.
/// Within one repository writes are serialized by the engine's writer lock;
/// the pool bounds how many distinct repositories mutate at once, so a slow
/// commit on one repository cannot starve the runtime but never reorders
/// another repository's commits.
pub struct RepositoryWorkers {
    semaphore: Arc<Semaphore>,
}

impl RepositoryWorkers {
    pub fn new(size: usize) -> RepositoryWorkers {
        RepositoryWorkers {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Runs a blocking storage operation on a worker slot.
    pub async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ReadOnly("worker pool is shut down".to_string()))?;
        let outcome = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| {
            Error::Storage(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("repository worker failed: {}", e),
            ))
        })?;
        outcome
    }
}

/// Contract shared by the standalone and replicated executors.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Executes a single command, honoring the writability gate unless the
    /// command is wrapped in a force-push.
    async fn execute(&self, command: Command) -> Result<CommandResult>;

    /// Resolves a content transformation into a normalizing push on this
    /// node and executes the push.
    async fn execute_transform(&self, transform: Transform) -> Result<CommandResult>;

    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;

    fn state(&self) -> ExecutorState;
    fn is_writable(&self) -> bool;
    fn set_writable(&self, writable: bool);
}

/// Directly dispatches commands to the project manager and repository
/// engines, without a replication log.
pub struct StandaloneCommandExecutor {
    projects: Arc<ProjectManager>,
    sessions: Arc<SessionManager>,
    quota: Arc<WriteQuota>,
    workers: Arc<RepositoryWorkers>,
    state: AtomicU8,
    writable: AtomicBool,
    on_take_leadership: Mutex<Option<LeadershipCallback>>,
    on_release_leadership: Mutex<Option<LeadershipCallback>>,
    // Key material changes are totally ordered with respect to each other.
    key_serial: tokio::sync::Mutex<()>,
}

impl StandaloneCommandExecutor {
    pub fn new(
        projects: Arc<ProjectManager>,
        sessions: Arc<SessionManager>,
        quota: Arc<WriteQuota>,
        workers: Arc<RepositoryWorkers>,
    ) -> StandaloneCommandExecutor {
        StandaloneCommandExecutor {
            projects,
            sessions,
            quota,
            workers,
            state: AtomicU8::new(0),
            writable: AtomicBool::new(false),
            on_take_leadership: Mutex::new(None),
            on_release_leadership: Mutex::new(None),
            key_serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Installs the leadership lifecycle callbacks invoked by `start` and
    /// `stop`.
    pub fn set_leadership_callbacks(
        &self,
        on_take: LeadershipCallback,
        on_release: LeadershipCallback,
    ) {
        *self.on_take_leadership.lock() = Some(on_take);
        *self.on_release_leadership.lock() = Some(on_release);
    }

    pub(crate) fn projects(&self) -> &Arc<ProjectManager> {
        &self.projects
    }

    pub(crate) fn quota(&self) -> &Arc<WriteQuota> {
        &self.quota
    }

    /// Applies a command to local state. This is the replay path too: no
    /// writability or quota checks happen here, and nothing reads the clock —
    /// the stamped timestamp drives all recorded times.
    pub(crate) async fn apply(&self, command: Command) -> Result<CommandResult> {
        let mut command = command;
        while let Command::ForcePush { command: inner } = command {
            command = *inner;
        }
        match command {
            Command::CreateProject {
                timestamp_millis,
                author,
                project_name,
            } => {
                let projects = self.projects.clone();
                let ts = format_timestamp(timestamp_millis);
                self.workers
                    .run(move || projects.create_project(&project_name, &author, &ts))
                    .await
                    .map(CommandResult::Project)
            }
            Command::RemoveProject {
                timestamp_millis,
                project_name,
                ..
            } => {
                let projects = self.projects.clone();
                let ts = format_timestamp(timestamp_millis);
                self.workers
                    .run(move || projects.remove_project(&project_name, &ts))
                    .await
                    .map(|_| CommandResult::Unit)
            }
            Command::UnremoveProject { project_name, .. } => {
                let projects = self.projects.clone();
                self.workers
                    .run(move || projects.unremove_project(&project_name))
                    .await
                    .map(CommandResult::Project)
            }
            Command::PurgeProject { project_name, .. } => {
                let projects = self.projects.clone();
                self.workers
                    .run(move || projects.mark_project_for_purge(&project_name))
                    .await
                    .map(|_| CommandResult::Unit)
            }
            Command::CreateRepository {
                timestamp_millis,
                author,
                project_name,
                repo_name,
            } => {
                let projects = self.projects.clone();
                let ts = format_timestamp(timestamp_millis);
                self.workers
                    .run(move || {
                        projects
                            .project(&project_name)?
                            .create_repo(&repo_name, &author, &ts)
                    })
                    .await
                    .map(CommandResult::Repository)
            }
            Command::RemoveRepository {
                timestamp_millis,
                project_name,
                repo_name,
                ..
            } => {
                let projects = self.projects.clone();
                let ts = format_timestamp(timestamp_millis);
                self.workers
                    .run(move || projects.project(&project_name)?.remove_repo(&repo_name, &ts))
                    .await
                    .map(|_| CommandResult::Unit)
            }
            Command::UnremoveRepository {
                project_name,
                repo_name,
                ..
            } => {
                let projects = self.projects.clone();
                self.workers
                    .run(move || projects.project(&project_name)?.unremove_repo(&repo_name))
                    .await
                    .map(CommandResult::Repository)
            }
            Command::PurgeRepository {
                project_name,
                repo_name,
                ..
            } => {
                let projects = self.projects.clone();
                self.workers
                    .run(move || {
                        projects
                            .project(&project_name)?
                            .mark_repo_for_purge(&repo_name)
                    })
                    .await
                    .map(|_| CommandResult::Unit)
            }
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
                self.push(
                    timestamp_millis,
                    author,
                    project_name,
                    repo_name,
                    base_revision,
                    summary,
                    detail,
                    changes,
                    true,
                )
                .await
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
                self.push(
                    timestamp_millis,
                    author,
                    project_name,
                    repo_name,
                    base_revision,
                    summary,
                    detail,
                    changes,
                    false,
                )
                .await
            }
            Command::CreateSession { session, .. } => {
                let copy = session.clone();
                self.sessions.create(copy);
                Ok(CommandResult::Session(session))
            }
            Command::RemoveSession { session_id, .. } => {
                self.sessions.remove(&session_id);
                Ok(CommandResult::Unit)
            }
            Command::UpdateServerStatus { writable, .. } => {
                self.set_writable(writable);
                info!(writable, "server status updated");
                Ok(CommandResult::Unit)
            }
            Command::RotateRepositoryKey {
                timestamp_millis,
                project_name,
                repo_name,
                ..
            } => {
                let _serial = self.key_serial.lock().await;
                let projects = self.projects.clone();
                let ts = format_timestamp(timestamp_millis);
                self.workers
                    .run(move || {
                        projects
                            .project(&project_name)?
                            .rotate_repo_key(&repo_name, &ts)
                    })
                    .await
                    .map(|_| CommandResult::Unit)
            }
            Command::ForcePush { .. } => unreachable!("unwrapped above"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn push(
        &self,
        timestamp_millis: i64,
        author: crate::model::Author,
        project_name: String,
        repo_name: String,
        base_revision: crate::model::Revision,
        summary: String,
        detail: Option<crate::model::CommitDetail>,
        changes: Vec<Change>,
        normalizing: bool,
    ) -> Result<CommandResult> {
        let repo = self.projects.project(&project_name)?.repo(&repo_name)?;
        let ts = format_timestamp(timestamp_millis);
        let pushed_at = ts.clone();
        let (revision, _applied) = self
            .workers
            .run(move || {
                repo.commit(
                    base_revision,
                    &ts,
                    &author,
                    &summary,
                    detail,
                    &changes,
                    normalizing,
                )
            })
            .await?;
        Ok(CommandResult::Push(PushResult {
            revision,
            pushed_at: Some(pushed_at),
        }))
    }

    pub(crate) fn resolve_transform(&self, transform: Transform) -> Result<Command> {
        let repo = self
            .projects
            .project(&transform.project_name)?
            .repo(&transform.repo_name)?;
        let current = repo
            .get(transform.base_revision, &transform.query)?
            .map(|entry| crate::watch::value_of(&entry.content));
        let new_value = (transform.transformer)(current)?;
        Ok(Command::NormalizingPush {
            timestamp_millis: transform.timestamp_millis,
            author: transform.author,
            project_name: transform.project_name,
            repo_name: transform.repo_name,
            base_revision: transform.base_revision,
            summary: transform.summary,
            detail: None,
            changes: vec![Change::upsert_json(transform.query.path(), new_value)],
        })
    }

    fn gate(&self, command: Command) -> Result<(Command, bool)> {
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
        Ok((command, force))
    }
}

#[async_trait]
impl CommandExecutor for StandaloneCommandExecutor {
    async fn execute(&self, command: Command) -> Result<CommandResult> {
        let (command, _force) = self.gate(command)?;
        if let Some((project, repo)) = command.push_target() {
            self.quota.try_acquire(project, repo)?;
        }
        self.apply(command).await
    }

    async fn execute_transform(&self, transform: Transform) -> Result<CommandResult> {
        if self.state() != ExecutorState::Started {
            return Err(Error::ReadOnly("executor is not started".to_string()));
        }
        let command = self.resolve_transform(transform)?;
        self.execute(command).await
    }

    async fn start(&self) -> Result<()> {
        self.state.store(1, Ordering::Release);
        self.writable.store(true, Ordering::Release);
        if let Some(cb) = self.on_take_leadership.lock().as_ref() {
            cb();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.store(2, Ordering::Release);
        self.writable.store(false, Ordering::Release);
        if let Some(cb) = self.on_release_leadership.lock().as_ref() {
            cb();
        }
        self.state.store(3, Ordering::Release);
        Ok(())
    }

    fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }
}
