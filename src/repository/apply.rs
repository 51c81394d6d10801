use std::collections::BTreeMap;
use std::io;

use crate::error::{Error, Result};
use crate::model::{validate_file_path, Change, ChangeContent, EntryContent, EntryType};
use crate::storage::{ObjectId, ObjectStore, TreeEntry, TreeEntryKind, TreeObject};

/// A flattened view of the tree at one revision: absolute file path to file
/// node. Directories are implicit in the paths.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub files: BTreeMap<String, FileNode>,
}

#[derive(Debug, Clone)]
pub struct FileNode {
    pub kind: EntryType,
    pub source: FileSource,
}

#[derive(Debug, Clone)]
pub enum FileSource {
    /// Already stored; only re-read when content is needed.
    Stored(ObjectId),
    /// Produced by an in-flight change set, not yet written.
    Inline(Vec<u8>),
}

impl Snapshot {
    /// Loads the flattened file list of the tree rooted at `tree_id`.
    pub fn load(store: &ObjectStore, tree_id: &ObjectId) -> Result<Snapshot> {
        let mut files = BTreeMap::new();
        collect(store, tree_id, "", &mut files)?;
        Ok(Snapshot { files })
    }

    /// Decoded content of the file at `path`, or `None` when absent.
    pub fn content(&self, store: &ObjectStore, path: &str) -> Result<Option<EntryContent>> {
        let node = match self.files.get(path) {
            Some(n) => n,
            None => return Ok(None),
        };
        let bytes = match &node.source {
            FileSource::Stored(id) => store.read_blob(id)?,
            FileSource::Inline(bytes) => bytes.clone(),
        };
        decode_content(node.kind, &bytes).map(Some)
    }

    /// Every directory path implied by the files, root excluded.
    pub fn directories(&self) -> Vec<String> {
        let mut dirs = std::collections::BTreeSet::new();
        for path in self.files.keys() {
            let mut idx = 0;
            while let Some(pos) = path[idx + 1..].find('/') {
                idx += 1 + pos;
                dirs.insert(path[..idx].to_string());
            }
        }
        dirs.into_iter().collect()
    }
}

fn collect(
    store: &ObjectStore,
    tree_id: &ObjectId,
    prefix: &str,
    out: &mut BTreeMap<String, FileNode>,
) -> Result<()> {
    let tree = store.read_tree(tree_id)?;
    for (name, entry) in &tree.entries {
        let path = format!("{}/{}", prefix, name);
        match entry.kind {
            TreeEntryKind::Tree => collect(store, &entry.id, &path, out)?,
            kind => {
                out.insert(
                    path,
                    FileNode {
                        kind: kind.entry_type(),
                        source: FileSource::Stored(entry.id),
                    },
                );
            }
        }
    }
    Ok(())
}

pub fn decode_content(kind: EntryType, bytes: &[u8]) -> Result<EntryContent> {
    match kind {
        EntryType::Json => Ok(EntryContent::Json(serde_json::from_slice(bytes)?)),
        EntryType::Text => Ok(EntryContent::Text(utf8(bytes)?)),
        EntryType::Yaml => Ok(EntryContent::Yaml(utf8(bytes)?)),
        EntryType::Directory => Err(Error::Storage(io::Error::new(
            io::ErrorKind::InvalidData,
            "directory stored as a blob",
        ))),
    }
}

pub fn encode_content(content: &EntryContent) -> Result<Vec<u8>> {
    match content {
        // serde_json's map keeps keys sorted, so this is the canonical form.
        EntryContent::Json(v) => Ok(serde_json::to_vec(v)?),
        EntryContent::Text(s) | EntryContent::Yaml(s) => Ok(s.as_bytes().to_vec()),
        EntryContent::Directory => Err(Error::Storage(io::Error::new(
            io::ErrorKind::InvalidData,
            "cannot encode a directory",
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| {
        Error::Storage(io::Error::new(
            io::ErrorKind::InvalidData,
            "stored blob is not valid UTF-8",
        ))
    })
}

/// Applies a change set to `base` in listing order; later changes observe the
/// effect of earlier ones. Returns the resulting snapshot and the changes
/// that actually altered state; redundant changes are dropped. The caller
/// rejects the commit when nothing survives.
pub fn apply_changes(
    store: &ObjectStore,
    base: &Snapshot,
    changes: &[Change],
    normalizing: bool,
) -> Result<(Snapshot, Vec<Change>)> {
    let mut working = base.clone();
    let mut applied = Vec::new();

    for change in changes {
        validate_file_path(&change.path)?;
        match &change.content {
            ChangeContent::UpsertJson(value) => {
                check_upsert_target(&working, &change.path)?;
                let redundant = match working.content(store, &change.path)? {
                    Some(EntryContent::Json(old)) => old == *value,
                    _ => false,
                };
                if redundant {
                    continue;
                }
                put(
                    &mut working,
                    &change.path,
                    EntryType::Json,
                    encode_content(&EntryContent::Json(value.clone()))?,
                );
                applied.push(change.clone());
            }
            ChangeContent::UpsertText(text) => {
                check_upsert_target(&working, &change.path)?;
                let text = if normalizing {
                    canonical_text(text)
                } else {
                    text.clone()
                };
                let redundant = match working.content(store, &change.path)? {
                    Some(EntryContent::Text(old)) => old == text,
                    _ => false,
                };
                if redundant {
                    continue;
                }
                put(
                    &mut working,
                    &change.path,
                    EntryType::Text,
                    text.clone().into_bytes(),
                );
                applied.push(Change {
                    path: change.path.clone(),
                    content: ChangeContent::UpsertText(text),
                });
            }
            ChangeContent::UpsertYaml(doc) => {
                check_upsert_target(&working, &change.path)?;
                let parsed: serde_yaml::Value = serde_yaml::from_str(doc)?;
                let doc = if normalizing {
                    serde_yaml::to_string(&parsed)?
                } else {
                    doc.clone()
                };
                let redundant = match working.content(store, &change.path)? {
                    Some(EntryContent::Yaml(old)) => old == doc,
                    _ => false,
                };
                if redundant {
                    continue;
                }
                put(
                    &mut working,
                    &change.path,
                    EntryType::Yaml,
                    doc.clone().into_bytes(),
                );
                applied.push(Change {
                    path: change.path.clone(),
                    content: ChangeContent::UpsertYaml(doc),
                });
            }
            ChangeContent::Remove => {
                if !remove(&mut working, &change.path) {
                    return Err(Error::ChangeConflict(format!(
                        "cannot remove non-existent entry: {}",
                        change.path
                    )));
                }
                applied.push(change.clone());
            }
            ChangeContent::Rename(new_path) => {
                validate_file_path(new_path)?;
                if change.path == *new_path {
                    continue;
                }
                if exists(&working, new_path) {
                    return Err(Error::ChangeConflict(format!(
                        "rename target already exists: {}",
                        new_path
                    )));
                }
                if !rename(&mut working, &change.path, new_path) {
                    return Err(Error::ChangeConflict(format!(
                        "cannot rename non-existent entry: {}",
                        change.path
                    )));
                }
                applied.push(change.clone());
            }
            ChangeContent::ApplyJsonPatch(patch_value) => {
                let old = match working.content(store, &change.path)? {
                    Some(EntryContent::Json(v)) => v,
                    Some(_) => {
                        return Err(Error::ChangeConflict(format!(
                            "cannot apply a JSON patch to a non-JSON entry: {}",
                            change.path
                        )))
                    }
                    None => {
                        return Err(Error::ChangeConflict(format!(
                            "cannot apply a JSON patch to non-existent entry: {}",
                            change.path
                        )))
                    }
                };
                let patch: json_patch::Patch = serde_json::from_value(patch_value.clone())
                    .map_err(|e| Error::ChangeConflict(format!("malformed JSON patch: {}", e)))?;
                let mut new = old.clone();
                json_patch::patch(&mut new, &patch).map_err(|e| {
                    Error::ChangeConflict(format!(
                        "failed to apply JSON patch to {}: {}",
                        change.path, e
                    ))
                })?;
                if new == old {
                    continue;
                }
                put(
                    &mut working,
                    &change.path,
                    EntryType::Json,
                    encode_content(&EntryContent::Json(new))?,
                );
                applied.push(change.clone());
            }
            ChangeContent::ApplyTextPatch(patch_text) => {
                let (kind, old) = match working.content(store, &change.path)? {
                    Some(EntryContent::Text(s)) => (EntryType::Text, s),
                    Some(EntryContent::Yaml(s)) => (EntryType::Yaml, s),
                    Some(_) => {
                        return Err(Error::ChangeConflict(format!(
                            "cannot apply a text patch to a non-text entry: {}",
                            change.path
                        )))
                    }
                    None => {
                        return Err(Error::ChangeConflict(format!(
                            "cannot apply a text patch to non-existent entry: {}",
                            change.path
                        )))
                    }
                };
                let patch = diffy::Patch::from_str(patch_text).map_err(|e| {
                    Error::ChangeConflict(format!("malformed text patch: {}", e))
                })?;
                let new = diffy::apply(&old, &patch).map_err(|e| {
                    Error::ChangeConflict(format!(
                        "failed to apply text patch to {}: {}",
                        change.path, e
                    ))
                })?;
                if new == old {
                    continue;
                }
                if kind == EntryType::Yaml {
                    let _: serde_yaml::Value = serde_yaml::from_str(&new)?;
                }
                put(&mut working, &change.path, kind, new.into_bytes());
                applied.push(change.clone());
            }
        }
    }

    Ok((working, applied))
}

/// Writes inline blobs and rebuilds the nested tree objects bottom-up,
/// returning the new root tree id.
pub fn write_tree(store: &ObjectStore, snapshot: &Snapshot) -> Result<ObjectId> {
    enum Node {
        Dir(BTreeMap<String, Node>),
        File(EntryType, ObjectId),
    }

    let mut root: BTreeMap<String, Node> = BTreeMap::new();
    for (path, node) in &snapshot.files {
        let id = match &node.source {
            FileSource::Stored(id) => *id,
            FileSource::Inline(bytes) => store.put_blob(bytes)?,
        };
        let segments: Vec<&str> = path.split('/').skip(1).collect();
        let mut cursor = &mut root;
        for segment in &segments[..segments.len() - 1] {
            let child = cursor
                .entry(segment.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            cursor = match child {
                Node::Dir(map) => map,
                Node::File(..) => {
                    return Err(Error::ChangeConflict(format!(
                        "{} is both a file and a directory",
                        path
                    )))
                }
            };
        }
        cursor.insert(
            segments[segments.len() - 1].to_string(),
            Node::File(node.kind, id),
        );
    }

    fn write(store: &ObjectStore, map: &BTreeMap<String, Node>) -> Result<ObjectId> {
        let mut tree = TreeObject::default();
        for (name, node) in map {
            let entry = match node {
                Node::Dir(children) => TreeEntry {
                    kind: TreeEntryKind::Tree,
                    id: write(store, children)?,
                },
                Node::File(kind, id) => TreeEntry {
                    kind: TreeEntryKind::of(*kind),
                    id: *id,
                },
            };
            tree.entries.insert(name.clone(), entry);
        }
        store.put_tree(&tree)
    }

    write(store, &root)
}

fn canonical_text(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

fn exists(snapshot: &Snapshot, path: &str) -> bool {
    if snapshot.files.contains_key(path) {
        return true;
    }
    let prefix = format!("{}/", path);
    snapshot.files.keys().any(|k| k.starts_with(&prefix))
}

fn check_upsert_target(snapshot: &Snapshot, path: &str) -> Result<()> {
    let prefix = format!("{}/", path);
    if snapshot.files.keys().any(|k| k.starts_with(&prefix)) {
        return Err(Error::ChangeConflict(format!(
            "cannot replace a directory with a file: {}",
            path
        )));
    }
    // A parent segment must not be an existing file.
    let mut idx = 0;
    while let Some(pos) = path[idx + 1..].find('/') {
        idx += 1 + pos;
        if snapshot.files.contains_key(&path[..idx]) {
            return Err(Error::ChangeConflict(format!(
                "{} exists as a file, not a directory",
                &path[..idx]
            )));
        }
    }
    Ok(())
}

fn put(snapshot: &mut Snapshot, path: &str, kind: EntryType, bytes: Vec<u8>) {
    snapshot.files.insert(
        path.to_string(),
        FileNode {
            kind,
            source: FileSource::Inline(bytes),
        },
    );
}

/// Removes a file, or a whole directory when `path` names one. Returns
/// whether anything was removed.
fn remove(snapshot: &mut Snapshot, path: &str) -> bool {
    if snapshot.files.remove(path).is_some() {
        return true;
    }
    let prefix = format!("{}/", path);
    let doomed: Vec<String> = snapshot
        .files
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .cloned()
        .collect();
    for k in &doomed {
        snapshot.files.remove(k);
    }
    !doomed.is_empty()
}

fn rename(snapshot: &mut Snapshot, from: &str, to: &str) -> bool {
    if let Some(node) = snapshot.files.remove(from) {
        snapshot.files.insert(to.to_string(), node);
        return true;
    }
    let prefix = format!("{}/", from);
    let moved: Vec<String> = snapshot
        .files
        .keys()
        .filter(|k| k.starts_with(&prefix))
        .cloned()
        .collect();
    for k in &moved {
        let node = snapshot.files.remove(k).expect("key just listed");
        let new_key = format!("{}{}", to, &k[from.len()..]);
        snapshot.files.insert(new_key, node);
    }
    !moved.is_empty()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Change;
    use serde_json::json;
    use tempfile::TempDir;

    fn empty(store: &ObjectStore) -> Snapshot {
        let _ = store;
        Snapshot::default()
    }

    fn store() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_then_read_back() {
        let (_d, store) = store();
        let base = empty(&store);
        let changes = vec![Change::upsert_json("/a.json", json!({"a": 1}))];
        let (snap, applied) = apply_changes(&store, &base, &changes, true).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            snap.content(&store, "/a.json").unwrap(),
            Some(EntryContent::Json(json!({"a": 1})))
        );
    }

    #[test]
    fn identical_upsert_is_redundant() {
        let (_d, store) = store();
        let base = empty(&store);
        let changes = vec![Change::upsert_json("/a.json", json!([1, 2]))];
        let (snap, _) = apply_changes(&store, &base, &changes, true).unwrap();
        let (_, applied) = apply_changes(&store, &snap, &changes, true).unwrap();
        assert!(applied.is_empty());
    }

    #[test]
    fn later_changes_see_earlier_ones() {
        let (_d, store) = store();
        let base = empty(&store);
        let changes = vec![
            Change::upsert_json("/a.json", json!({"a": 1})),
            Change::apply_json_patch(
                "/a.json",
                json!([{"op": "replace", "path": "/a", "value": 2}]),
            ),
        ];
        let (snap, applied) = apply_changes(&store, &base, &changes, true).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(
            snap.content(&store, "/a.json").unwrap(),
            Some(EntryContent::Json(json!({"a": 2})))
        );
    }

    #[test]
    fn remove_missing_conflicts() {
        let (_d, store) = store();
        let base = empty(&store);
        let out = apply_changes(&store, &base, &[Change::remove("/nope.json")], true);
        assert!(matches!(out, Err(Error::ChangeConflict(_))));
    }

    #[test]
    fn rename_moves_content() {
        let (_d, store) = store();
        let base = empty(&store);
        let (snap, _) = apply_changes(
            &store,
            &base,
            &[Change::upsert_text("/a.txt", "hi\n")],
            true,
        )
        .unwrap();
        let (snap, applied) =
            apply_changes(&store, &snap, &[Change::rename("/a.txt", "/b.txt")], true).unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(snap.content(&store, "/a.txt").unwrap(), None);
        assert_eq!(
            snap.content(&store, "/b.txt").unwrap(),
            Some(EntryContent::Text("hi\n".to_string()))
        );
    }

    #[test]
    fn text_patch_round_trip() {
        let (_d, store) = store();
        let base = empty(&store);
        let (snap, _) = apply_changes(
            &store,
            &base,
            &[Change::upsert_text("/a.txt", "one\ntwo\n")],
            true,
        )
        .unwrap();
        let patch = diffy::create_patch("one\ntwo\n", "one\nthree\n").to_string();
        let (snap, applied) = apply_changes(
            &store,
            &snap,
            &[Change::apply_text_patch("/a.txt", &patch)],
            true,
        )
        .unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(
            snap.content(&store, "/a.txt").unwrap(),
            Some(EntryContent::Text("one\nthree\n".to_string()))
        );
    }

    #[test]
    fn upsert_over_directory_conflicts() {
        let (_d, store) = store();
        let base = empty(&store);
        let (snap, _) = apply_changes(
            &store,
            &base,
            &[Change::upsert_text("/dir/a.txt", "x\n")],
            true,
        )
        .unwrap();
        let out = apply_changes(&store, &snap, &[Change::upsert_text("/dir", "x\n")], true);
        assert!(matches!(out, Err(Error::ChangeConflict(_))));
    }

    #[test]
    fn tree_write_and_reload() {
        let (_d, store) = store();
        let base = empty(&store);
        let (snap, _) = apply_changes(
            &store,
            &base,
            &[
                Change::upsert_json("/a.json", json!(1)),
                Change::upsert_text("/sub/dir/b.txt", "b\n"),
            ],
            true,
        )
        .unwrap();
        let root = write_tree(&store, &snap).unwrap();
        let reloaded = Snapshot::load(&store, &root).unwrap();
        assert_eq!(
            reloaded.files.keys().collect::<Vec<_>>(),
            vec!["/a.json", "/sub/dir/b.txt"]
        );
        assert_eq!(reloaded.directories(), vec!["/sub", "/sub/dir"]);
    }
}
