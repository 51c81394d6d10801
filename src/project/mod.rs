//! Directory-based registry of projects and their repositories.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Author, Change, EncryptionMarker, EntityStatus, Project, Repository, Revision,
};
use crate::repository::{Repo, RepositoryCache, REPO_DOGMA, REPO_META};

/// The internal project, invisible to non-administrators and closed to
/// mutation through the public surface.
pub const INTERNAL_PROJECT: &str = "dogma";

const REMOVED_MARKER: &str = ".removed";
const PURGING_MARKER: &str = ".purging";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectMetadata {
    creator: Author,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovalMarker {
    removed_at: String,
}

const ENCRYPTION_MARKER: &str = "encryption.json";

struct RepoState {
    repo: Arc<Repo>,
    removed: RwLock<Option<String>>,
    encryption: RwLock<Option<EncryptionMarker>>,
}

pub struct ProjectHandle {
    name: String,
    dir: PathBuf,
    metadata: ProjectMetadata,
    removed: RwLock<Option<String>>,
    repos: DashMap<String, Arc<RepoState>>,
    cache: Arc<RepositoryCache>,
}

/// Directory of projects under the configured data root. Every project owns
/// the two reserved repositories, created with it.
pub struct ProjectManager {
    data_dir: PathBuf,
    cache: Arc<RepositoryCache>,
    projects: DashMap<String, Arc<ProjectHandle>>,
}

impl ProjectManager {
    /// Scans the data directory and opens everything it finds.
    pub fn load(data_dir: &Path, cache: Arc<RepositoryCache>) -> Result<ProjectManager> {
        fs::create_dir_all(data_dir)?;
        let manager = ProjectManager {
            data_dir: data_dir.to_path_buf(),
            cache,
            projects: DashMap::new(),
        };
        for entry in fs::read_dir(data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().join(PURGING_MARKER).exists() {
                // Half-purged leftovers; the purge worker finishes the job.
                continue;
            }
            match manager.open_project(&name) {
                Ok(handle) => {
                    manager.projects.insert(name, Arc::new(handle));
                }
                Err(e) => warn!(project = %name, error = %e, "failed to open project"),
            }
        }
        info!(projects = manager.projects.len(), "project manager loaded");
        Ok(manager)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn open_project(&self, name: &str) -> Result<ProjectHandle> {
        let dir = self.data_dir.join(name);
        let metadata: ProjectMetadata =
            serde_json::from_slice(&fs::read(dir.join("project.json"))?)?;
        let removed = read_removal(&dir)?;
        let handle = ProjectHandle {
            name: name.to_string(),
            dir: dir.clone(),
            metadata,
            removed: RwLock::new(removed),
            repos: DashMap::new(),
            cache: self.cache.clone(),
        };
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let repo_name = entry.file_name().to_string_lossy().to_string();
            if entry.path().join(PURGING_MARKER).exists() {
                continue;
            }
            let repo = Repo::open(&entry.path(), name, &repo_name, Some(self.cache.clone()))?;
            let removed = read_removal(&entry.path())?;
            let encryption = read_encryption(&entry.path())?;
            handle.repos.insert(
                repo_name,
                Arc::new(RepoState {
                    repo,
                    removed: RwLock::new(removed),
                    encryption: RwLock::new(encryption),
                }),
            );
        }
        Ok(handle)
    }

    /// Creates a project with its reserved repositories and seeds the
    /// metadata document.
    pub fn create_project(
        &self,
        name: &str,
        author: &Author,
        timestamp: &str,
    ) -> Result<Project> {
        validate_name(name)?;
        if name == INTERNAL_PROJECT {
            return Err(Error::PermissionDenied(format!(
                "{} is reserved for internal use",
                name
            )));
        }
        if self.projects.contains_key(name) {
            return Err(Error::ProjectExists(name.to_string()));
        }

        let dir = self.data_dir.join(name);
        fs::create_dir_all(&dir)?;
        let metadata = ProjectMetadata {
            creator: author.clone(),
            created_at: timestamp.to_string(),
        };
        fs::write(dir.join("project.json"), serde_json::to_vec_pretty(&metadata)?)?;

        let handle = ProjectHandle {
            name: name.to_string(),
            dir: dir.clone(),
            metadata,
            removed: RwLock::new(None),
            repos: DashMap::new(),
            cache: self.cache.clone(),
        };
        for reserved in &[REPO_DOGMA, REPO_META] {
            handle.create_repo_inner(reserved, author, timestamp)?;
        }
        // Seed the metadata document in the reserved repository.
        let dogma = handle.repo(REPO_DOGMA)?;
        dogma.commit(
            Revision::HEAD,
            timestamp,
            &Author::system(),
            "Initialize metadata",
            None,
            &[Change::upsert_json(
                "/metadata.json",
                serde_json::json!({
                    "name": name,
                    "members": {},
                    "repos": {},
                    "creation": { "user": author.email, "timestamp": timestamp },
                }),
            )],
            true,
        )?;

        let project = handle.to_project();
        self.projects.insert(name.to_string(), Arc::new(handle));
        debug!(project = name, "created project");
        Ok(project)
    }

    /// Active projects, the internal one excluded.
    pub fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .iter()
            .filter(|e| e.key() != INTERNAL_PROJECT && e.value().removed.read().is_none())
            .map(|e| e.value().to_project())
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// Removed projects, restorable or purgeable, with their removal
    /// timestamps.
    pub fn list_removed_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .iter()
            .filter(|e| e.value().removed.read().is_some())
            .map(|e| e.value().to_project())
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    pub fn exists(&self, name: &str) -> bool {
        self.projects
            .get(name)
            .map(|p| p.removed.read().is_none())
            .unwrap_or(false)
    }

    /// An active project. Removed projects are invisible here.
    pub fn project(&self, name: &str) -> Result<Arc<ProjectHandle>> {
        let handle = self
            .projects
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))?;
        if handle.removed.read().is_some() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        Ok(handle)
    }

    pub fn remove_project(&self, name: &str, timestamp: &str) -> Result<()> {
        if name == INTERNAL_PROJECT {
            return Err(Error::PermissionDenied(format!(
                "{} cannot be removed",
                name
            )));
        }
        let handle = self.project(name)?;
        let marker = RemovalMarker {
            removed_at: timestamp.to_string(),
        };
        fs::write(
            handle.dir.join(REMOVED_MARKER),
            serde_json::to_vec(&marker)?,
        )?;
        *handle.removed.write() = Some(timestamp.to_string());
        debug!(project = name, "removed project");
        Ok(())
    }

    pub fn unremove_project(&self, name: &str) -> Result<Project> {
        let handle = self
            .projects
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))?;
        if handle.removed.read().is_none() {
            return Ok(handle.to_project());
        }
        let _ = fs::remove_file(handle.dir.join(REMOVED_MARKER));
        *handle.removed.write() = None;
        Ok(handle.to_project())
    }

    /// Marks a removed project for deletion by the purge worker. Terminal.
    pub fn mark_project_for_purge(&self, name: &str) -> Result<()> {
        let handle = self
            .projects
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))?;
        if handle.removed.read().is_none() {
            return Err(Error::ProjectNotFound(format!(
                "{} is not removed; remove it before purging",
                name
            )));
        }
        fs::write(handle.dir.join(PURGING_MARKER), b"")?;
        self.projects.remove(name);
        Ok(())
    }

    /// One pass of the purge worker: deletes everything marked for purge.
    pub fn run_purge_once(&self) -> Result<usize> {
        let mut purged = 0;
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            if path.join(PURGING_MARKER).exists() {
                fs::remove_dir_all(&path)?;
                purged += 1;
                continue;
            }
            // Repositories marked for purge inside live projects.
            for sub in fs::read_dir(&path)? {
                let sub = sub?;
                if sub.file_type()?.is_dir() && sub.path().join(PURGING_MARKER).exists() {
                    fs::remove_dir_all(sub.path())?;
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!(purged, "purge pass finished");
        }
        Ok(purged)
    }

    /// Spawns the background purge worker.
    pub fn spawn_purge_worker(
        manager: Arc<ProjectManager>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let m = manager.clone();
                let result = tokio::task::spawn_blocking(move || m.run_purge_once()).await;
                match result {
                    Ok(Err(e)) => warn!(error = %e, "purge pass failed"),
                    Err(e) => warn!(error = %e, "purge worker panicked"),
                    _ => {}
                }
            }
        })
    }
}

impl ProjectHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn to_project(&self) -> Project {
        let removed_at = self.removed.read().clone();
        Project {
            name: self.name.clone(),
            creator: self.metadata.creator.clone(),
            status: if removed_at.is_some() {
                EntityStatus::Removed
            } else {
                EntityStatus::Active
            },
            url: Some(format!("/api/v1/projects/{}", self.name)),
            created_at: Some(self.metadata.created_at.clone()),
            removed_at,
        }
    }

    fn create_repo_inner(
        &self,
        name: &str,
        author: &Author,
        timestamp: &str,
    ) -> Result<Repository> {
        validate_name(name)?;
        if self.repos.contains_key(name) {
            return Err(Error::RepositoryExists(format!("{}/{}", self.name, name)));
        }
        let dir = self.dir.join(name);
        let repo = Repo::create(&dir, &self.name, name, author, timestamp, Some(self.cache.clone()))?;
        let state = Arc::new(RepoState {
            repo,
            removed: RwLock::new(None),
            encryption: RwLock::new(None),
        });
        let info = state.to_repository();
        self.repos.insert(name.to_string(), state);
        Ok(info)
    }

    /// Creates a repository. The reserved names are refused; they already
    /// exist from project creation.
    pub fn create_repo(
        &self,
        name: &str,
        author: &Author,
        timestamp: &str,
    ) -> Result<Repository> {
        if name == REPO_DOGMA || name == REPO_META {
            return Err(Error::RepositoryExists(format!("{}/{}", self.name, name)));
        }
        self.create_repo_inner(name, author, timestamp)
    }

    /// An active repository's engine handle.
    pub fn repo(&self, name: &str) -> Result<Arc<Repo>> {
        let state = self
            .repos
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::RepositoryNotFound(format!("{}/{}", self.name, name)))?;
        if state.removed.read().is_some() {
            return Err(Error::RepositoryNotFound(format!(
                "{}/{}",
                self.name, name
            )));
        }
        Ok(state.repo.clone())
    }

    pub fn repo_exists(&self, name: &str) -> bool {
        self.repo(name).is_ok()
    }

    pub fn list_repos(&self) -> Vec<Repository> {
        let mut repos: Vec<Repository> = self
            .repos
            .iter()
            .filter(|e| e.value().removed.read().is_none())
            .map(|e| e.value().to_repository())
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos
    }

    /// Removed repositories with their removal timestamps.
    pub fn list_removed_repos(&self) -> Vec<Repository> {
        let mut repos: Vec<Repository> = self
            .repos
            .iter()
            .filter(|e| e.value().removed.read().is_some())
            .map(|e| e.value().to_repository())
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        repos
    }

    pub fn remove_repo(&self, name: &str, timestamp: &str) -> Result<()> {
        if name == REPO_DOGMA || name == REPO_META {
            return Err(Error::PermissionDenied(format!(
                "{} cannot be removed",
                name
            )));
        }
        let state = self
            .repos
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::RepositoryNotFound(format!("{}/{}", self.name, name)))?;
        if state.removed.read().is_some() {
            return Err(Error::RepositoryNotFound(format!(
                "{}/{}",
                self.name, name
            )));
        }
        let marker = RemovalMarker {
            removed_at: timestamp.to_string(),
        };
        fs::write(
            self.dir.join(name).join(REMOVED_MARKER),
            serde_json::to_vec(&marker)?,
        )?;
        *state.removed.write() = Some(timestamp.to_string());
        Ok(())
    }

    pub fn unremove_repo(&self, name: &str) -> Result<Repository> {
        let state = self
            .repos
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::RepositoryNotFound(format!("{}/{}", self.name, name)))?;
        if state.removed.read().is_some() {
            let _ = fs::remove_file(self.dir.join(name).join(REMOVED_MARKER));
            *state.removed.write() = None;
        }
        Ok(state.to_repository())
    }

    /// Rotates the repository's encryption key marker. The key id is derived
    /// from the rotation command so replicas converge on the same marker.
    pub fn rotate_repo_key(&self, name: &str, timestamp: &str) -> Result<()> {
        let state = self
            .repos
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::RepositoryNotFound(format!("{}/{}", self.name, name)))?;
        if state.removed.read().is_some() {
            return Err(Error::RepositoryNotFound(format!(
                "{}/{}",
                self.name, name
            )));
        }
        let key_id = {
            use sha1::{Digest, Sha1};
            let mut hasher = Sha1::new();
            hasher.update(self.name.as_bytes());
            hasher.update(b"/");
            hasher.update(name.as_bytes());
            hasher.update(b"@");
            hasher.update(timestamp.as_bytes());
            hex::encode(hasher.finalize())
        };
        let marker = EncryptionMarker {
            key_id,
            rotated_at: timestamp.to_string(),
        };
        fs::write(
            self.dir.join(name).join(ENCRYPTION_MARKER),
            serde_json::to_vec_pretty(&marker)?,
        )?;
        *state.encryption.write() = Some(marker);
        Ok(())
    }

    /// Marks a removed repository for deletion by the purge worker.
    pub fn mark_repo_for_purge(&self, name: &str) -> Result<()> {
        let state = self
            .repos
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::RepositoryNotFound(format!("{}/{}", self.name, name)))?;
        if state.removed.read().is_none() {
            return Err(Error::RepositoryNotFound(format!(
                "{}/{} is not removed; remove it before purging",
                self.name, name
            )));
        }
        fs::write(self.dir.join(name).join(PURGING_MARKER), b"")?;
        self.repos.remove(name);
        Ok(())
    }
}

impl RepoState {
    fn to_repository(&self) -> Repository {
        let removed_at = self.removed.read().clone();
        Repository {
            name: self.repo.name().to_string(),
            creator: self.repo.creator().clone(),
            head_revision: self.repo.head(),
            status: if removed_at.is_some() {
                EntityStatus::Removed
            } else {
                EntityStatus::Active
            },
            url: Some(format!(
                "/api/v1/projects/{}/repos/{}",
                self.repo.project_name(),
                self.repo.name()
            )),
            created_at: Some(self.repo.created_at().to_string()),
            removed_at,
            encryption: self.encryption.read().clone(),
        }
    }
}

fn read_removal(dir: &Path) -> Result<Option<String>> {
    match fs::read(dir.join(REMOVED_MARKER)) {
        Ok(bytes) => {
            let marker: RemovalMarker = serde_json::from_slice(&bytes)?;
            Ok(Some(marker.removed_at))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_encryption(dir: &Path) -> Result<Option<EncryptionMarker>> {
    match fs::read(dir.join(ENCRYPTION_MARKER)) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Project and repository names: `[A-Za-z0-9][-+_.0-9A-Za-z]*`.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_' | '.'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid name: {}", name)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const TS: &str = "2024-01-01T00:00:00Z";

    fn manager() -> (TempDir, ProjectManager) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(RepositoryCache::new(1 << 20, Duration::from_secs(60)));
        let m = ProjectManager::load(dir.path(), cache).unwrap();
        (dir, m)
    }

    #[test]
    fn create_project_with_reserved_repos() {
        let (_d, m) = manager();
        let p = m.create_project("foo", &Author::new("minux", "minux@m.x"), TS).unwrap();
        assert_eq!(p.name, "foo");

        let handle = m.project("foo").unwrap();
        let names: Vec<String> = handle.list_repos().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["dogma", "meta"]);

        // The metadata document is seeded.
        let dogma = handle.repo(REPO_DOGMA).unwrap();
        assert!(dogma.exists(Revision::HEAD, "/metadata.json").unwrap());
    }

    #[test]
    fn duplicate_and_reserved_names() {
        let (_d, m) = manager();
        let author = Author::new("minux", "minux@m.x");
        m.create_project("foo", &author, TS).unwrap();
        assert!(matches!(
            m.create_project("foo", &author, TS),
            Err(Error::ProjectExists(_))
        ));
        assert!(matches!(
            m.create_project(INTERNAL_PROJECT, &author, TS),
            Err(Error::PermissionDenied(_))
        ));
        assert!(m.create_project("0bad name", &author, TS).is_err());

        let handle = m.project("foo").unwrap();
        assert!(matches!(
            handle.create_repo(REPO_META, &author, TS),
            Err(Error::RepositoryExists(_))
        ));
        assert!(matches!(
            handle.remove_repo(REPO_DOGMA, TS),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn remove_unremove_purge_lifecycle() {
        let (_d, m) = manager();
        let author = Author::new("minux", "minux@m.x");
        m.create_project("foo", &author, TS).unwrap();

        m.remove_project("foo", TS).unwrap();
        assert!(m.list_projects().is_empty());
        let removed = m.list_removed_projects();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "foo");
        assert_eq!(removed[0].status, EntityStatus::Removed);
        assert_eq!(removed[0].removed_at.as_deref(), Some(TS));
        assert_eq!(removed[0].creator, author);
        assert!(matches!(m.project("foo"), Err(Error::ProjectNotFound(_))));

        let restored = m.unremove_project("foo").unwrap();
        assert_eq!(restored.status, EntityStatus::Active);
        assert_eq!(restored.removed_at, None);
        assert_eq!(m.list_projects().len(), 1);

        m.remove_project("foo", TS).unwrap();
        m.mark_project_for_purge("foo").unwrap();
        assert_eq!(m.run_purge_once().unwrap(), 1);
        assert!(m.list_removed_projects().is_empty());
    }

    #[test]
    fn survives_reload() {
        let dir = TempDir::new().unwrap();
        let author = Author::new("minux", "minux@m.x");
        {
            let cache = Arc::new(RepositoryCache::new(1 << 20, Duration::from_secs(60)));
            let m = ProjectManager::load(dir.path(), cache).unwrap();
            m.create_project("foo", &author, TS).unwrap();
            let handle = m.project("foo").unwrap();
            handle.create_repo("bar", &author, TS).unwrap();
            handle.create_repo("secure", &author, TS).unwrap();
            handle.rotate_repo_key("secure", TS).unwrap();
            handle.remove_repo("bar", TS).unwrap();
        }
        let cache = Arc::new(RepositoryCache::new(1 << 20, Duration::from_secs(60)));
        let m = ProjectManager::load(dir.path(), cache).unwrap();
        let handle = m.project("foo").unwrap();

        let removed = handle.list_removed_repos();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "bar");
        assert_eq!(removed[0].status, EntityStatus::Removed);
        assert_eq!(removed[0].removed_at.as_deref(), Some(TS));
        assert!(handle.repo_exists(REPO_META));

        // The encryption marker survives the reload and the key id is
        // derived from the rotation command, not from local randomness.
        let secure = handle
            .list_repos()
            .into_iter()
            .find(|r| r.name == "secure")
            .unwrap();
        let marker = secure.encryption.expect("rotated repository is marked");
        assert_eq!(marker.rotated_at, TS);
        handle.rotate_repo_key("secure", TS).unwrap();
        let again = handle
            .list_repos()
            .into_iter()
            .find(|r| r.name == "secure")
            .unwrap();
        assert_eq!(again.encryption.unwrap().key_id, marker.key_id);
    }
}
