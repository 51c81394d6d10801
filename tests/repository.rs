use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use centraldogma_server::model::{
    Author, Change, ChangeContent, EntryContent, EntryType, PathPattern, Query, Revision,
};
use centraldogma_server::repository::Repo;
use centraldogma_server::Error;

const TS: &str = "2024-01-01T00:00:00.000Z";

fn author() -> Author {
    Author::new("minux", "minux@m.x")
}

fn new_repo() -> (TempDir, Arc<Repo>) {
    let dir = TempDir::new().unwrap();
    let repo = Repo::create(&dir.path().join("bar"), "foo", "bar", &author(), TS, None).unwrap();
    (dir, repo)
}

fn push(repo: &Repo, summary: &str, changes: Vec<Change>) -> Revision {
    let (revision, _) = repo
        .commit(Revision::HEAD, TS, &author(), summary, None, &changes, true)
        .unwrap();
    revision
}

#[test]
fn commit_advances_head_by_one() {
    let (_dir, repo) = new_repo();
    assert_eq!(repo.head(), Revision::INIT);

    for i in 2..=5 {
        let revision = push(
            &repo,
            "Add a file",
            vec![Change::upsert_json("/a.json", json!({ "i": i }))],
        );
        assert_eq!(revision, Revision::from(i));
        assert_eq!(repo.head(), Revision::from(i));
        assert_eq!(
            repo.normalize_revision(Revision::HEAD).unwrap(),
            Revision::from(i)
        );
    }
}

#[test]
fn fully_redundant_push_is_rejected() {
    let (_dir, repo) = new_repo();
    push(
        &repo,
        "Add a file",
        vec![Change::upsert_json("/a.json", json!([1, 2]))],
    );
    let head = repo.head();

    let out = repo.commit(
        Revision::HEAD,
        TS,
        &author(),
        "No-op",
        None,
        &[Change::upsert_json("/a.json", json!([1, 2]))],
        true,
    );
    assert!(matches!(out, Err(Error::RedundantChange)));
    assert_eq!(repo.head(), head, "head is unchanged after a rejected push");
}

#[test]
fn partially_redundant_push_keeps_the_effective_changes() {
    let (_dir, repo) = new_repo();
    push(
        &repo,
        "Add a file",
        vec![Change::upsert_json("/a.json", json!([1, 2]))],
    );
    let (revision, applied) = repo
        .commit(
            Revision::HEAD,
            TS,
            &author(),
            "One effective change",
            None,
            &[
                Change::upsert_json("/a.json", json!([1, 2])),
                Change::upsert_json("/b.json", json!([3])),
            ],
            true,
        )
        .unwrap();
    assert_eq!(revision, Revision::from(3));
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].path, "/b.json");
}

#[test]
fn stale_base_conflicts_only_on_touched_paths() {
    let (_dir, repo) = new_repo();
    push(&repo, "a", vec![Change::upsert_json("/a.json", json!(1))]);
    let base = repo.head();
    push(&repo, "b", vec![Change::upsert_json("/b.json", json!(2))]);

    // Distinct paths rebase cleanly onto the newer head.
    let (revision, _) = repo
        .commit(
            base,
            TS,
            &author(),
            "c",
            None,
            &[Change::upsert_json("/c.json", json!(3))],
            true,
        )
        .unwrap();
    assert_eq!(revision, Revision::from(4));

    // Touching a path an interleaved commit touched is a conflict.
    let out = repo.commit(
        base,
        TS,
        &author(),
        "conflict",
        None,
        &[Change::upsert_json("/b.json", json!(9))],
        true,
    );
    assert!(matches!(out, Err(Error::ChangeConflict(_))));
}

#[test]
fn get_reads_any_revision() {
    let (_dir, repo) = new_repo();
    push(&repo, "v1", vec![Change::upsert_json("/a.json", json!({"v": 1}))]);
    push(&repo, "v2", vec![Change::upsert_json("/a.json", json!({"v": 2}))]);

    let query = Query::of_json("/a.json").unwrap();
    let old = repo.get(Revision::from(2), &query).unwrap().unwrap();
    assert_eq!(old.content, EntryContent::Json(json!({"v": 1})));
    let new = repo.get(Revision::HEAD, &query).unwrap().unwrap();
    assert_eq!(new.content, EntryContent::Json(json!({"v": 2})));

    // The file does not exist at the initial revision.
    assert!(repo.get(Revision::INIT, &query).unwrap().is_none());
    // Nonexistent path resolves to None, not an error.
    let missing = Query::of_json("/missing.json").unwrap();
    assert!(repo.get(Revision::HEAD, &missing).unwrap().is_none());
}

#[test]
fn json_path_query_and_kind_mismatch() {
    let (_dir, repo) = new_repo();
    push(
        &repo,
        "files",
        vec![
            Change::upsert_json("/a.json", json!({"a": {"b": 42}})),
            // A text file that merely looks like JSON by name.
            Change::upsert_text("/t.json", "hello\n"),
        ],
    );
    let query = Query::of_json_path("/a.json", vec!["$.a.b".to_string()]).unwrap();
    let entry = repo.get(Revision::HEAD, &query).unwrap().unwrap();
    assert_eq!(entry.content, EntryContent::Json(json!(42)));

    let mismatched = Query::of_json_path("/t.json", vec!["$.a".to_string()]).unwrap();
    let out = repo.get(Revision::HEAD, &mismatched);
    assert!(matches!(out, Err(Error::QueryExecution(_))));
}

#[test]
fn list_is_ordered_and_includes_directories() {
    let (_dir, repo) = new_repo();
    push(
        &repo,
        "tree",
        vec![
            Change::upsert_json("/z.json", json!(1)),
            Change::upsert_text("/sub/b.txt", "b\n"),
            Change::upsert_text("/sub/a.txt", "a\n"),
        ],
    );
    let entries = repo.list(Revision::HEAD, &PathPattern::all()).unwrap();
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/sub", "/sub/a.txt", "/sub/b.txt", "/z.json"]);
    assert_eq!(entries[0].entry_type(), EntryType::Directory);
    assert_eq!(entries[0].content, EntryContent::Directory);

    let only_txt = repo
        .list(Revision::HEAD, &PathPattern::new("/sub/*.txt").unwrap())
        .unwrap();
    assert_eq!(only_txt.len(), 2);
}

#[test]
fn history_filters_by_pattern_newest_first() {
    let (_dir, repo) = new_repo();
    for i in 0..10 {
        let path = if i % 2 == 0 { "/even.json" } else { "/odd.json" };
        push(&repo, &i.to_string(), vec![Change::upsert_json(path, json!(i))]);
    }
    assert_eq!(repo.head(), Revision::from(11));

    let pattern = PathPattern::new("/even.json").unwrap();
    let commits = repo
        .history(Revision::HEAD, Revision::INIT, &pattern, 0)
        .unwrap();
    let summaries: Vec<&str> = commits
        .iter()
        .map(|c| c.commit_message.summary.as_str())
        .collect();
    assert_eq!(summaries, vec!["8", "6", "4", "2", "0"]);

    let bounded = repo
        .history(Revision::HEAD, Revision::INIT, &pattern, 3)
        .unwrap();
    let summaries: Vec<&str> = bounded
        .iter()
        .map(|c| c.commit_message.summary.as_str())
        .collect();
    assert_eq!(summaries, vec!["8", "6", "4"]);

    // Oldest-first when walking forward.
    let forward = repo
        .history(Revision::INIT, Revision::HEAD, &pattern, 0)
        .unwrap();
    assert_eq!(forward[0].commit_message.summary, "0");
}

#[test]
fn diff_round_trips_between_revisions() {
    let (_dir, repo) = new_repo();
    push(
        &repo,
        "v1",
        vec![
            Change::upsert_json("/a.json", json!({"x": 1})),
            Change::upsert_text("/b.txt", "one\n"),
        ],
    );
    let from = repo.head();
    push(
        &repo,
        "v2",
        vec![
            Change::apply_json_patch(
                "/a.json",
                json!([{"op": "replace", "path": "/x", "value": 2}]),
            ),
            Change::remove("/b.txt"),
            Change::upsert_yaml("/c.yml", "c: 1\n"),
        ],
    );
    let to = repo.head();

    let changes = repo.diff(from, to, &PathPattern::all()).unwrap();
    let by_path: std::collections::HashMap<&str, &Change> =
        changes.iter().map(|c| (c.path.as_str(), c)).collect();
    assert!(matches!(
        by_path["/a.json"].content,
        ChangeContent::ApplyJsonPatch(_)
    ));
    assert!(matches!(by_path["/b.txt"].content, ChangeContent::Remove));
    assert!(matches!(
        by_path["/c.yml"].content,
        ChangeContent::UpsertYaml(_)
    ));

    // The reverse diff undoes the forward diff.
    let reverse = repo.diff(to, from, &PathPattern::all()).unwrap();
    let by_path: std::collections::HashMap<&str, &Change> =
        reverse.iter().map(|c| (c.path.as_str(), c)).collect();
    assert!(matches!(
        by_path["/b.txt"].content,
        ChangeContent::UpsertText(_)
    ));
    assert!(matches!(by_path["/c.yml"].content, ChangeContent::Remove));
}

#[test]
fn preview_diff_drops_redundant_changes() {
    let (_dir, repo) = new_repo();
    push(&repo, "a", vec![Change::upsert_json("/a.json", json!(1))]);
    let preview = repo
        .preview_diff(
            Revision::HEAD,
            &[
                Change::upsert_json("/a.json", json!(1)),
                Change::upsert_json("/b.json", json!(2)),
            ],
        )
        .unwrap();
    assert_eq!(preview.len(), 1);
    assert_eq!(preview[0].path, "/b.json");
    // Preview does not move the head.
    assert_eq!(repo.head(), Revision::from(2));
}

#[test]
fn normalizing_push_canonicalizes_json() {
    let (_dir, repo) = new_repo();
    push(
        &repo,
        "unordered",
        vec![Change::upsert_json("/a.json", json!({"b": 1, "a": 2}))],
    );
    let entry = repo
        .get(Revision::HEAD, &Query::of_text("/a.json").unwrap())
        .unwrap()
        .unwrap();
    // Keys are sorted in the canonical form.
    assert_eq!(entry.content, EntryContent::Text("{\"a\":2,\"b\":1}".to_string()));
}

#[test]
fn rename_shows_up_in_history_for_both_paths() {
    let (_dir, repo) = new_repo();
    push(&repo, "add", vec![Change::upsert_text("/old.txt", "x\n")]);
    push(&repo, "rename", vec![Change::rename("/old.txt", "/new.txt")]);

    for pattern in &["/old.txt", "/new.txt"] {
        let commits = repo
            .history(
                Revision::HEAD,
                Revision::INIT,
                &PathPattern::new(pattern).unwrap(),
                0,
            )
            .unwrap();
        assert!(
            commits.iter().any(|c| c.commit_message.summary == "rename"),
            "rename commit missing for {}",
            pattern
        );
    }
}

#[test]
fn merged_query_layers_sources_in_order() {
    use centraldogma_server::model::MergeSource;

    let (_dir, repo) = new_repo();
    push(
        &repo,
        "configs",
        vec![
            Change::upsert_json("/base.json", json!({"a": 1, "nested": {"x": 1}})),
            Change::upsert_json("/override.json", json!({"a": 2, "nested": {"y": 2}})),
        ],
    );

    let merged = repo
        .merge_query(
            Revision::HEAD,
            &[
                MergeSource::required("/base.json"),
                MergeSource::required("/override.json"),
                MergeSource::optional("/absent.json"),
            ],
            &[],
        )
        .unwrap();
    assert_eq!(merged.content, json!({"a": 2, "nested": {"x": 1, "y": 2}}));
    assert_eq!(merged.paths, vec!["/base.json", "/override.json"]);

    // A required source must exist.
    let out = repo.merge_query(
        Revision::HEAD,
        &[MergeSource::required("/absent.json")],
        &[],
    );
    assert!(matches!(out, Err(Error::EntryNotFound { .. })));

    // Expressions project the merged document.
    let merged = repo
        .merge_query(
            Revision::HEAD,
            &[
                MergeSource::required("/base.json"),
                MergeSource::required("/override.json"),
            ],
            &["$.nested.x".to_string()],
        )
        .unwrap();
    assert_eq!(merged.content, json!(1));
}

#[test]
fn reopen_preserves_history() {
    let dir = TempDir::new().unwrap();
    let repo_dir = dir.path().join("bar");
    {
        let repo = Repo::create(&repo_dir, "foo", "bar", &author(), TS, None).unwrap();
        repo.commit(
            Revision::HEAD,
            TS,
            &author(),
            "add",
            None,
            &[Change::upsert_json("/a.json", json!(1))],
            true,
        )
        .unwrap();
    }
    let repo = Repo::open(&repo_dir, "foo", "bar", None).unwrap();
    assert_eq!(repo.head(), Revision::from(2));
    let entry = repo
        .get(Revision::HEAD, &Query::of_json("/a.json").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(entry.content, EntryContent::Json(json!(1)));
}
