use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::object::{CommitObject, ObjectId, ObjectKind, TreeObject};
use crate::error::{Error, Result};
use crate::model::Revision;

/// Content-addressed store of blob, tree and commit objects for a single
/// repository, with one mutable head ref and a revision tag space.
///
/// Layout under the repository directory:
///
/// ```text
/// objects/<xx>/<38 hex chars>   immutable objects
/// refs/head                     hex id of the head commit
/// tags/<xx>/<rest>              revision number -> commit id
/// ```
///
/// Object reads are side-effect free and safe for concurrent callers.
/// `update_ref` is a compare-and-set; writers are expected to be serialized
/// per repository by the engine above this layer.
pub struct ObjectStore {
    root: PathBuf,
    ref_lock: Mutex<()>,
}

impl ObjectStore {
    /// Opens the store rooted at `root`, creating the directory skeleton when
    /// absent.
    pub fn open(root: &Path) -> Result<ObjectStore> {
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs"))?;
        fs::create_dir_all(root.join("tags"))?;
        Ok(ObjectStore {
            root: root.to_path_buf(),
            ref_lock: Mutex::new(()),
        })
    }

    pub fn put_blob(&self, bytes: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::compute(ObjectKind::Blob, bytes);
        self.write_object(&id, bytes)?;
        Ok(id)
    }

    pub fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        Ok(fs::read(self.object_path(id))?)
    }

    pub fn put_tree(&self, tree: &TreeObject) -> Result<ObjectId> {
        let payload = serde_json::to_vec(tree)?;
        let id = ObjectId::compute(ObjectKind::Tree, &payload);
        self.write_object(&id, &payload)?;
        Ok(id)
    }

    pub fn read_tree(&self, id: &ObjectId) -> Result<TreeObject> {
        let bytes = fs::read(self.object_path(id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn put_commit(&self, commit: &CommitObject) -> Result<ObjectId> {
        let payload = serde_json::to_vec(commit)?;
        let id = ObjectId::compute(ObjectKind::Commit, &payload);
        self.write_object(&id, &payload)?;
        Ok(id)
    }

    pub fn read_commit(&self, id: &ObjectId) -> Result<CommitObject> {
        let bytes = fs::read(self.object_path(id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn read_ref(&self) -> Result<Option<ObjectId>> {
        match fs::read_to_string(self.root.join("refs").join("head")) {
            Ok(s) => Ok(Some(s.trim().parse()?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-set of the head ref. `expected` must match the current
    /// value (`None` for an unborn head) or the call fails without touching
    /// the ref.
    pub fn update_ref(&self, expected: Option<ObjectId>, new: ObjectId) -> Result<()> {
        let _guard = self.ref_lock.lock();
        let current = self.read_ref()?;
        if current != expected {
            return Err(Error::ChangeConflict(format!(
                "head ref moved: expected {:?}, found {:?}",
                expected, current
            )));
        }
        atomic_write(&self.root.join("refs").join("head"), new.to_hex().as_bytes())?;
        Ok(())
    }

    /// Tags a revision number with a commit id. Tags are immutable aliases;
    /// re-tagging an existing revision with a different id is a conflict.
    pub fn tag_revision(&self, revision: Revision, id: ObjectId) -> Result<()> {
        let path = self.tag_path(revision);
        if let Some(existing) = read_id_if_present(&path)? {
            if existing != id {
                return Err(Error::ChangeConflict(format!(
                    "revision {} already tagged", revision
                )));
            }
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&path, id.to_hex().as_bytes())?;
        Ok(())
    }

    pub fn lookup_revision(&self, revision: Revision) -> Result<Option<ObjectId>> {
        read_id_if_present(&self.tag_path(revision))
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let (dir, rest) = id.shard();
        self.root.join("objects").join(dir).join(rest)
    }

    fn tag_path(&self, revision: Revision) -> PathBuf {
        // Zero-padded hex so that the first byte pair shards the directory.
        let name = format!("{:08x}", revision.value() as u32);
        self.root
            .join("tags")
            .join(&name[..2])
            .join(&name[2..])
    }

    fn write_object(&self, id: &ObjectId, payload: &[u8]) -> Result<()> {
        let path = self.object_path(id);
        if path.exists() {
            // Content-addressed: an existing object is byte-identical.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&path, payload)?;
        Ok(())
    }
}

fn read_id_if_present(path: &Path) -> Result<Option<ObjectId>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().parse()?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes via a temp file in the same directory and renames over the target,
/// so readers never observe a partial file.
fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
