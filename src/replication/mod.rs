//! The replicated write pipeline's backbone: a totally-ordered durable log
//! of serialized commands, a leader-election seam, and the snapshot seam a
//! replica uses when it has fallen behind the log's compaction horizon.
//!
//! The consensus service itself (ZooKeeper in the upstream deployment) is an
//! external collaborator behind [`LeaderElector`]; the implementations here
//! are the file-backed log and an in-process election, which is what a
//! single-process cluster and the test suite use.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::command::Command;
use crate::error::{Error, Result};

/// One appended command with its position in the total order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp_millis: i64,
    pub command: Command,
}

/// Snapshot record written at compaction time. A replica whose replay
/// position precedes `last_included_seq` cannot catch up from the log and
/// must install a snapshot instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub last_included_seq: u64,
    pub last_included_timestamp_millis: i64,
    pub first_retained_seq: u64,
    pub entry_count: u64,
    pub created_at_millis: i64,
}

/// Log retention: an entry survives compaction when it is within the newest
/// `max_log_count` entries OR younger than `min_log_age_millis` — whichever
/// rule retains more.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub max_log_count: u64,
    pub min_log_age_millis: i64,
}

/// Totally-ordered durable command log shared by every replica.
pub trait ReplicationLog: Send + Sync {
    /// Appends a command, assigning the next sequence number.
    fn append(&self, command: &Command) -> Result<u64>;

    /// Entries with `seq >= from`, in order.
    fn read_from(&self, from: u64) -> Result<Vec<LogEntry>>;

    fn first_seq(&self) -> u64;
    fn last_seq(&self) -> u64;

    /// The sequence compacted out of the log, 0 when nothing was compacted.
    /// Replicas at or before this position need a snapshot.
    fn snapshot_horizon(&self) -> u64;

    /// Applies the retention policy, returning the new horizon.
    fn compact(&self, policy: &RetentionPolicy, now_millis: i64) -> Result<u64>;

    /// Observes the last appended sequence number.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

struct LogState {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    snapshot: Option<SnapshotRecord>,
    file: File,
}

/// JSON-lines log under a directory, fsynced on append. All replicas of a
/// single-process cluster share one instance.
pub struct FileReplicationLog {
    dir: PathBuf,
    state: Mutex<LogState>,
    notify: watch::Sender<u64>,
}

impl FileReplicationLog {
    pub fn open(dir: &Path) -> Result<FileReplicationLog> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join("log.jsonl");
        let mut entries = VecDeque::new();
        if log_path.exists() {
            let reader = BufReader::new(File::open(&log_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line)?;
                entries.push_back(entry);
            }
        }
        let snapshot = match fs::read(dir.join("snapshot.json")) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let next_seq = entries
            .back()
            .map(|e: &LogEntry| e.seq + 1)
            .or_else(|| snapshot.as_ref().map(|s: &SnapshotRecord| s.last_included_seq + 1))
            .unwrap_or(1);
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let last = next_seq - 1;
        info!(entries = entries.len(), last_seq = last, "replication log opened");
        Ok(FileReplicationLog {
            dir: dir.to_path_buf(),
            state: Mutex::new(LogState {
                entries,
                next_seq,
                snapshot,
                file,
            }),
            notify: watch::channel(last).0,
        })
    }

    fn rewrite(&self, state: &mut LogState) -> Result<()> {
        let tmp = self.dir.join(".log.tmp");
        {
            let mut f = File::create(&tmp)?;
            for entry in &state.entries {
                serde_json::to_writer(&mut f, entry)?;
                f.write_all(b"\n")?;
            }
            f.sync_all()?;
        }
        let log_path = self.dir.join("log.jsonl");
        fs::rename(&tmp, &log_path)?;
        state.file = OpenOptions::new().append(true).open(&log_path)?;
        Ok(())
    }
}

impl ReplicationLog for FileReplicationLog {
    fn append(&self, command: &Command) -> Result<u64> {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        let entry = LogEntry {
            seq,
            timestamp_millis: command.timestamp_millis(),
            command: command.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        state.file.write_all(&line)?;
        state.file.sync_data()?;
        state.entries.push_back(entry);
        state.next_seq += 1;
        drop(state);
        self.notify.send_replace(seq);
        Ok(seq)
    }

    fn read_from(&self, from: u64) -> Result<Vec<LogEntry>> {
        let state = self.state.lock();
        if let Some(first) = state.entries.front() {
            if from < first.seq && state.snapshot.is_some() {
                return Err(Error::ReplicationUnavailable(format!(
                    "sequence {} was compacted out of the log",
                    from
                )));
            }
        }
        Ok(state
            .entries
            .iter()
            .filter(|e| e.seq >= from)
            .cloned()
            .collect())
    }

    fn first_seq(&self) -> u64 {
        self.state.lock().entries.front().map(|e| e.seq).unwrap_or(0)
    }

    fn last_seq(&self) -> u64 {
        let state = self.state.lock();
        state
            .entries
            .back()
            .map(|e| e.seq)
            .or_else(|| state.snapshot.as_ref().map(|s| s.last_included_seq))
            .unwrap_or(0)
    }

    fn snapshot_horizon(&self) -> u64 {
        self.state
            .lock()
            .snapshot
            .as_ref()
            .map(|s| s.last_included_seq)
            .unwrap_or(0)
    }

    fn compact(&self, policy: &RetentionPolicy, now_millis: i64) -> Result<u64> {
        let mut state = self.state.lock();
        let total = state.entries.len() as u64;
        let mut last_dropped: Option<LogEntry> = None;
        while let Some(front) = state.entries.front() {
            let remaining = state.entries.len() as u64;
            let within_count = remaining <= policy.max_log_count;
            let within_age = now_millis - front.timestamp_millis <= policy.min_log_age_millis;
            // Either rule keeps the entry.
            if within_count || within_age {
                break;
            }
            last_dropped = state.entries.pop_front();
        }
        let dropped = total - state.entries.len() as u64;
        if dropped == 0 {
            return Ok(state.snapshot.as_ref().map(|s| s.last_included_seq).unwrap_or(0));
        }
        let last = last_dropped.expect("dropped at least one entry");
        let record = SnapshotRecord {
            last_included_seq: last.seq,
            last_included_timestamp_millis: last.timestamp_millis,
            first_retained_seq: state.entries.front().map(|e| e.seq).unwrap_or(last.seq + 1),
            entry_count: state.entries.len() as u64,
            created_at_millis: now_millis,
        };
        fs::write(
            self.dir.join("snapshot.json"),
            serde_json::to_vec_pretty(&record)?,
        )?;
        self.rewrite(&mut state)?;
        state.snapshot = Some(record.clone());
        info!(dropped, horizon = record.last_included_seq, "compacted replication log");
        Ok(record.last_included_seq)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

/// Leadership over the replica set. The consensus binding (ZooKeeper et al)
/// implements this; `InProcessElection` is the single-process default.
pub trait LeaderElector: Send + Sync {
    /// Joins the election. `on_take` runs when leadership is acquired,
    /// `on_release` when it is handed over.
    fn campaign(&self, on_take: LeadershipCallback, on_release: LeadershipCallback);

    /// Gives up leadership, handing it to the next campaigner.
    fn resign(&self);

    fn is_leader(&self) -> bool;
}

pub type LeadershipCallback = Box<dyn Fn() + Send + Sync>;

struct Candidate {
    id: u64,
    on_take: LeadershipCallback,
    on_release: LeadershipCallback,
}

#[derive(Default)]
struct ElectionState {
    next_id: u64,
    leader: Option<Candidate>,
    queue: VecDeque<Candidate>,
}

/// Shared in-process election: the first campaigner leads; resignation hands
/// leadership to the longest-waiting candidate.
#[derive(Default)]
pub struct InProcessElection {
    state: Mutex<ElectionState>,
}

impl InProcessElection {
    pub fn new() -> Arc<InProcessElection> {
        Arc::new(InProcessElection::default())
    }

    /// An elector handle for one replica.
    pub fn elector(self: &Arc<Self>) -> InProcessElector {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };
        InProcessElector {
            election: self.clone(),
            id,
        }
    }
}

pub struct InProcessElector {
    election: Arc<InProcessElection>,
    id: u64,
}

impl LeaderElector for InProcessElector {
    fn campaign(&self, on_take: LeadershipCallback, on_release: LeadershipCallback) {
        let candidate = Candidate {
            id: self.id,
            on_take,
            on_release,
        };
        let mut state = self.election.state.lock();
        if state.leader.is_none() {
            (candidate.on_take)();
            state.leader = Some(candidate);
        } else {
            state.queue.push_back(candidate);
        }
    }

    fn resign(&self) {
        let mut state = self.election.state.lock();
        let leading = state.leader.as_ref().map(|c| c.id) == Some(self.id);
        if !leading {
            state.queue.retain(|c| c.id != self.id);
            return;
        }
        let old = state.leader.take().expect("leader checked above");
        (old.on_release)();
        if let Some(next) = state.queue.pop_front() {
            (next.on_take)();
            state.leader = Some(next);
        } else {
            warn!("leadership released with no remaining candidate");
        }
    }

    fn is_leader(&self) -> bool {
        let state = self.election.state.lock();
        state.leader.as_ref().map(|c| c.id) == Some(self.id)
    }
}

/// Source of a full-state snapshot for replicas behind the compaction
/// horizon.
pub trait SnapshotSource: Send + Sync {
    /// Replaces the target data directory with a copy of the snapshot state.
    fn install(&self, target_data_dir: &Path) -> Result<()>;
}

/// Copies another replica's data directory. Suitable when replicas share a
/// host or a mounted snapshot volume.
pub struct DirectorySnapshot {
    pub source: PathBuf,
}

impl SnapshotSource for DirectorySnapshot {
    fn install(&self, target_data_dir: &Path) -> Result<()> {
        if target_data_dir.exists() {
            fs::remove_dir_all(target_data_dir)?;
        }
        copy_dir(&self.source, target_data_dir)?;
        info!(
            source = %self.source.display(),
            target = %target_data_dir.display(),
            "installed snapshot"
        );
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
