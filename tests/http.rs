use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use centraldogma_server::command::{
    CommandExecutor, RepositoryWorkers, StandaloneCommandExecutor,
};
use centraldogma_server::project::ProjectManager;
use centraldogma_server::quota::WriteQuota;
use centraldogma_server::repository::RepositoryCache;
use centraldogma_server::server::{router, AppState};
use centraldogma_server::session::SessionManager;

async fn app() -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(RepositoryCache::new(1 << 20, Duration::from_secs(60)));
    let projects = Arc::new(ProjectManager::load(dir.path(), cache).unwrap());
    let executor = Arc::new(StandaloneCommandExecutor::new(
        projects.clone(),
        Arc::new(SessionManager::new()),
        Arc::new(WriteQuota::disabled()),
        Arc::new(RepositoryWorkers::new(4)),
    ));
    executor.start().await.unwrap();
    let state = Arc::new(AppState { executor, projects });
    (dir, router(state))
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", "Bearer anonymous");
    match body {
        Some(v) => builder
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn project_repo_push_read_round_trip() {
    let (_dir, app) = app().await;

    let resp = app
        .clone()
        .oneshot(request("POST", "/api/v1/projects", Some(json!({"name": "foo"}))))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let project = body_json(resp).await;
    assert_eq!(project["name"], "foo");
    assert_eq!(project["creator"]["name"], "anonymous");

    let resp = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos",
            Some(json!({"name": "bar"})),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let repo = body_json(resp).await;
    assert_eq!(repo["name"], "bar");
    assert_eq!(repo["headRevision"], 1);

    let push = json!({
        "commitMessage": {"summary": "Add a.json"},
        "changes": [
            {"path": "/a.json", "type": "UPSERT_JSON", "content": {"a": "b"}},
            {"path": "/sub/b.txt", "type": "UPSERT_TEXT", "content": "hello\n"}
        ]
    });
    let resp = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos/bar/contents?revision=head",
            Some(push),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let result = body_json(resp).await;
    assert_eq!(result["revision"], 2);

    let resp = app
        .clone()
        .oneshot(request(
            "GET",
            "/api/v1/projects/foo/repos/bar/contents/a.json?jsonpath=$.a",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let entry = body_json(resp).await;
    assert_eq!(entry["type"], "JSON");
    assert_eq!(entry["content"], "b");
    assert_eq!(entry["revision"], 2);

    let resp = app
        .clone()
        .oneshot(request("GET", "/api/v1/projects/foo/repos/bar/list", None))
        .await
        .unwrap();
    let listing = body_json(resp).await;
    assert_eq!(
        listing,
        json!([
            {"path": "/a.json", "type": "JSON"},
            {"path": "/sub", "type": "DIRECTORY"},
            {"path": "/sub/b.txt", "type": "TEXT"}
        ])
    );

    let resp = app
        .clone()
        .oneshot(request(
            "GET",
            "/api/v1/projects/foo/repos/bar/revision/-1",
            None,
        ))
        .await
        .unwrap();
    let normalized = body_json(resp).await;
    assert_eq!(normalized["revision"], 1);

    let resp = app
        .clone()
        .oneshot(request(
            "GET",
            "/api/v1/projects/foo/repos/bar/commits/head?path=/a.json&to=1",
            None,
        ))
        .await
        .unwrap();
    let commits = body_json(resp).await;
    assert_eq!(commits[0]["commitMessage"]["summary"], "Add a.json");

    let resp = app
        .clone()
        .oneshot(request(
            "GET",
            "/api/v1/projects/foo/repos/bar/compare?from=1&to=2&pathPattern=/**",
            None,
        ))
        .await
        .unwrap();
    let changes = body_json(resp).await;
    assert_eq!(changes.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn error_envelope_carries_the_exception_name() {
    let (_dir, app) = app().await;

    let resp = app
        .clone()
        .oneshot(request("GET", "/api/v1/projects/nope/repos", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let envelope = body_json(resp).await;
    assert_eq!(
        envelope["exception"],
        "com.linecorp.centraldogma.common.ProjectNotFoundException"
    );
    assert!(envelope["message"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn redundant_push_is_a_conflict() {
    let (_dir, app) = app().await;
    app.clone()
        .oneshot(request("POST", "/api/v1/projects", Some(json!({"name": "foo"}))))
        .await
        .unwrap();
    app.clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos",
            Some(json!({"name": "bar"})),
        ))
        .await
        .unwrap();

    let push = json!({
        "commitMessage": {"summary": "Add"},
        "changes": [{"path": "/a.json", "type": "UPSERT_JSON", "content": [1, 2, 3]}]
    });
    let resp = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos/bar/contents",
            Some(push.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos/bar/contents",
            Some(push),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let envelope = body_json(resp).await;
    assert_eq!(
        envelope["exception"],
        "com.linecorp.centraldogma.common.RedundantChangeException"
    );
}

#[tokio::test]
async fn watch_times_out_with_304() {
    let (_dir, app) = app().await;
    app.clone()
        .oneshot(request("POST", "/api/v1/projects", Some(json!({"name": "foo"}))))
        .await
        .unwrap();
    app.clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos",
            Some(json!({"name": "bar"})),
        ))
        .await
        .unwrap();

    let req = Request::builder()
        .method("GET")
        .uri("/api/v1/projects/foo/repos/bar/contents/a.json")
        .header("authorization", "Bearer anonymous")
        .header("if-none-match", "0")
        .header("prefer", "wait=1")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn removed_repo_listing_keeps_the_full_document() {
    let (_dir, app) = app().await;
    app.clone()
        .oneshot(request("POST", "/api/v1/projects", Some(json!({"name": "foo"}))))
        .await
        .unwrap();
    app.clone()
        .oneshot(request(
            "POST",
            "/api/v1/projects/foo/repos",
            Some(json!({"name": "bar"})),
        ))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(request("DELETE", "/api/v1/projects/foo/repos/bar", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = app
        .clone()
        .oneshot(request(
            "GET",
            "/api/v1/projects/foo/repos?status=removed",
            None,
        ))
        .await
        .unwrap();
    let removed = body_json(resp).await;
    let removed = removed.as_array().unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0]["name"], "bar");
    assert_eq!(removed[0]["status"], "removed");
    assert_eq!(removed[0]["headRevision"], 1);
    assert_eq!(removed[0]["creator"]["name"], "anonymous");
    assert!(removed[0]["removedAt"].is_string());

    // Active listings stay active-only and never carry a removal timestamp.
    let resp = app
        .clone()
        .oneshot(request("GET", "/api/v1/projects/foo/repos", None))
        .await
        .unwrap();
    let active = body_json(resp).await;
    let active = active.as_array().unwrap();
    assert!(active.iter().all(|r| r["name"] != "bar"));
    assert!(active
        .iter()
        .all(|r| r["status"] == "active" && r.get("removedAt").is_none()));
}

#[tokio::test]
async fn remove_and_unremove_project() {
    let (_dir, app) = app().await;
    app.clone()
        .oneshot(request("POST", "/api/v1/projects", Some(json!({"name": "foo"}))))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(request("DELETE", "/api/v1/projects/foo", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // The removed listing keeps the full project document, not just a name.
    let resp = app
        .clone()
        .oneshot(request("GET", "/api/v1/projects?status=removed", None))
        .await
        .unwrap();
    let removed = body_json(resp).await;
    let removed = removed.as_array().unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0]["name"], "foo");
    assert_eq!(removed[0]["status"], "removed");
    assert_eq!(removed[0]["creator"]["name"], "anonymous");
    assert_eq!(removed[0]["url"], "/api/v1/projects/foo");
    assert!(removed[0]["createdAt"].is_string());
    assert!(removed[0]["removedAt"].is_string());

    let patch = json!([{"op": "replace", "path": "/status", "value": "active"}]);
    let resp = app
        .clone()
        .oneshot(request("PATCH", "/api/v1/projects/foo", Some(patch)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let project = body_json(resp).await;
    assert_eq!(project["name"], "foo");
    assert_eq!(project["status"], "active");
    assert!(project.get("removedAt").is_none());

    let resp = app
        .clone()
        .oneshot(request("GET", "/api/v1/projects", None))
        .await
        .unwrap();
    let projects = body_json(resp).await;
    assert_eq!(projects.as_array().unwrap().len(), 1);
    assert_eq!(projects[0]["status"], "active");
}
