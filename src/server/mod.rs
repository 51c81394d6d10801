//! Thin HTTP translation of the public API. Handlers parse the request,
//! call into the engine or the command executor, and map errors onto the
//! `{exception, message}` envelope; no domain logic lives here.

mod admin;
mod content;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::command::CommandExecutor;
use crate::error::Error;
use crate::model::Author;
use crate::project::ProjectManager;

pub struct AppState {
    pub executor: Arc<dyn CommandExecutor>,
    pub projects: Arc<ProjectManager>,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/api/v1/projects",
            get(admin::list_projects).post(admin::create_project),
        )
        .route(
            "/api/v1/projects/:project",
            axum::routing::delete(admin::remove_project).patch(admin::unremove_project),
        )
        .route(
            "/api/v1/projects/:project/removed",
            axum::routing::delete(admin::purge_project),
        )
        .route(
            "/api/v1/projects/:project/repos",
            get(admin::list_repos).post(admin::create_repo),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo",
            axum::routing::delete(admin::remove_repo).patch(admin::unremove_repo),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/removed",
            axum::routing::delete(admin::purge_repo),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/revision/:revision",
            get(content::normalize_revision),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/list",
            get(content::list_root),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/list/*path",
            get(content::list),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/contents",
            get(content::get_all).post(content::push),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/contents/*path",
            get(content::get_or_watch),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/commits/:from",
            get(content::history),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/compare",
            get(content::compare),
        )
        .route(
            "/api/v1/projects/:project/repos/:repo/merge",
            get(content::merge),
        )
        .route("/monitor/l7check", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// The author a request acts as. Authentication itself is a collaborator;
/// the bearer token's subject is passed through as the principal.
pub(crate) fn request_author(headers: &HeaderMap) -> Author {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty() && *t != "anonymous");
    match token {
        Some(token) => Author::new(token, &format!("{}@localhost.localdomain", token)),
        None => Author::unknown(),
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::ProjectExists(_)
            | Error::RepositoryExists(_)
            | Error::ChangeConflict(_)
            | Error::RedundantChange => StatusCode::CONFLICT,
            Error::ProjectNotFound(_)
            | Error::RepositoryNotFound(_)
            | Error::EntryNotFound { .. }
            | Error::RevisionNotFound(_) => StatusCode::NOT_FOUND,
            Error::QueryExecution(_)
            | Error::InvalidInput(_)
            | Error::Json(_)
            | Error::Yaml(_) => StatusCode::BAD_REQUEST,
            Error::ReadOnly(_) | Error::ReplicationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "exception": self.exception_name(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
