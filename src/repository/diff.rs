use super::apply::{FileNode, FileSource};
use super::apply::Snapshot;
use crate::error::{Error, Result};
use crate::model::{Change, ChangeContent, EntryContent, PathPattern};
use crate::storage::ObjectStore;

/// Per-path difference between two snapshots, restricted to the pattern.
///
/// JSON entries produce a minimal RFC 6902 patch and text entries a unified
/// diff; everything else (YAML, kind changes, additions, removals) is an
/// upsert or a remove. Applying the result to `from` yields `to`.
pub fn tree_diff(
    store: &ObjectStore,
    from: &Snapshot,
    to: &Snapshot,
    pattern: &PathPattern,
) -> Result<Vec<Change>> {
    let mut changes = Vec::new();
    let paths: std::collections::BTreeSet<&String> =
        from.files.keys().chain(to.files.keys()).collect();

    for path in paths {
        if !pattern.matches(path) {
            continue;
        }
        let old_node = from.files.get(path.as_str());
        let new_node = to.files.get(path.as_str());
        match (old_node, new_node) {
            (None, None) => {}
            (Some(_), None) => changes.push(Change::remove(path)),
            (None, Some(_)) => {
                let content = to
                    .content(store, path)?
                    .expect("node just listed");
                changes.push(upsert_of(path, content));
            }
            (Some(old), Some(new)) => {
                if same_id(old, new) {
                    continue;
                }
                let old_content = from.content(store, path)?.expect("node just listed");
                let new_content = to.content(store, path)?.expect("node just listed");
                if let Some(change) = entry_diff(path, &old_content, &new_content) {
                    changes.push(change);
                }
            }
        }
    }
    Ok(changes)
}

/// Difference of a single entry between two contents, `None` when equal.
pub fn entry_diff(path: &str, old: &EntryContent, new: &EntryContent) -> Option<Change> {
    if old == new {
        return None;
    }
    match (old, new) {
        (EntryContent::Json(a), EntryContent::Json(b)) => {
            let patch = json_patch::diff(a, b);
            if patch.0.is_empty() {
                return None;
            }
            let value = serde_json::to_value(&patch).expect("a patch serializes");
            Some(Change::apply_json_patch(path, value))
        }
        (EntryContent::Text(a), EntryContent::Text(b)) => {
            if a == b {
                return None;
            }
            let patch = diffy::create_patch(a, b).to_string();
            Some(Change::apply_text_patch(path, &patch))
        }
        (_, new) => Some(upsert_of(path, new.clone())),
    }
}

/// Cheap equality check: true when both nodes are the same stored object,
/// letting callers skip loading and diffing their content.
fn same_id(old: &FileNode, new: &FileNode) -> bool {
    match (&old.source, &new.source) {
        (FileSource::Stored(a), FileSource::Stored(b)) => old.kind == new.kind && a == b,
        _ => false,
    }
}

fn upsert_of(path: &str, content: EntryContent) -> Change {
    let content = match content {
        EntryContent::Json(v) => ChangeContent::UpsertJson(v),
        EntryContent::Text(s) => ChangeContent::UpsertText(s),
        EntryContent::Yaml(s) => ChangeContent::UpsertYaml(s),
        EntryContent::Directory => unreachable!("snapshots hold no directory nodes"),
    };
    Change {
        path: path.to_string(),
        content,
    }
}

/// Projected single-file diff used by the compare-with-query operation.
pub fn query_diff(
    path: &str,
    old: Option<&EntryContent>,
    new: Option<&EntryContent>,
) -> Result<Change> {
    match (old, new) {
        (None, None) => Err(Error::EntryNotFound {
            revision: crate::model::Revision::HEAD,
            path: path.to_string(),
        }),
        (Some(_), None) => Ok(Change::remove(path)),
        (None, Some(new)) => Ok(upsert_of(path, new.clone())),
        (Some(old), Some(new)) => {
            Ok(entry_diff(path, old, new).unwrap_or_else(|| upsert_of(path, new.clone())))
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::apply::{apply_changes, Snapshot};
    use super::*;
    use crate::model::Change;
    use serde_json::json;
    use tempfile::TempDir;

    fn snapshots() -> (TempDir, ObjectStore, Snapshot, Snapshot) {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path()).unwrap();
        let base = Snapshot::default();
        let (a, _) = apply_changes(
            &store,
            &base,
            &[
                Change::upsert_json("/a.json", json!({"x": 1})),
                Change::upsert_text("/b.txt", "one\n"),
                Change::upsert_text("/gone.txt", "bye\n"),
            ],
            true,
        )
        .unwrap();
        let (b, _) = apply_changes(
            &store,
            &a,
            &[
                Change::upsert_json("/a.json", json!({"x": 2})),
                Change::upsert_text("/b.txt", "two\n"),
                Change::remove("/gone.txt"),
                Change::upsert_json("/new.json", json!(true)),
            ],
            true,
        )
        .unwrap();
        (dir, store, a, b)
    }

    #[test]
    fn diff_produces_minimal_changes() {
        let (_d, store, a, b) = snapshots();
        let changes = tree_diff(&store, &a, &b, &PathPattern::all()).unwrap();
        let by_path: std::collections::HashMap<_, _> =
            changes.iter().map(|c| (c.path.as_str(), c)).collect();

        match &by_path["/a.json"].content {
            ChangeContent::ApplyJsonPatch(p) => {
                assert_eq!(
                    p,
                    &json!([{"op": "replace", "path": "/x", "value": 2}])
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            by_path["/b.txt"].content,
            ChangeContent::ApplyTextPatch(_)
        ));
        assert!(matches!(by_path["/gone.txt"].content, ChangeContent::Remove));
        assert!(matches!(
            by_path["/new.json"].content,
            ChangeContent::UpsertJson(_)
        ));
    }

    #[test]
    fn diff_composes_back() {
        let (_d, store, a, b) = snapshots();
        let changes = tree_diff(&store, &a, &b, &PathPattern::all()).unwrap();
        let (rebuilt, _) = apply_changes(&store, &a, &changes, false).unwrap();
        for path in b.files.keys() {
            assert_eq!(
                rebuilt.content(&store, path).unwrap(),
                b.content(&store, path).unwrap(),
                "path {}",
                path
            );
        }
        assert_eq!(rebuilt.files.len(), b.files.len());
    }

    #[test]
    fn diff_respects_pattern() {
        let (_d, store, a, b) = snapshots();
        let pattern = PathPattern::new("/*.json").unwrap();
        let changes = tree_diff(&store, &a, &b, &pattern).unwrap();
        assert!(changes.iter().all(|c| c.path.ends_with(".json")));
    }
}
