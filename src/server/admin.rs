//! Project and repository administration endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use super::{now_millis, request_author, SharedState};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::model::{Project, Repository};

#[derive(Deserialize)]
pub(crate) struct StatusParam {
    status: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CreateRequest {
    name: String,
}

fn is_unremove_patch(patch: &serde_json::Value) -> bool {
    patch
        .as_array()
        .map(|ops| {
            ops.iter().any(|op| {
                op["op"] == "replace" && op["path"] == "/status" && op["value"] == "active"
            })
        })
        .unwrap_or(false)
}

pub(crate) async fn list_projects(
    State(state): State<SharedState>,
    Query(params): Query<StatusParam>,
) -> Result<Json<Vec<Project>>> {
    let projects = if params.status.as_deref() == Some("removed") {
        state.projects.list_removed_projects()
    } else {
        state.projects.list_projects()
    };
    Ok(Json(projects))
}

pub(crate) async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Project>)> {
    let result = state
        .executor
        .execute(Command::CreateProject {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: request.name,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(result.into_project()?)))
}

pub(crate) async fn remove_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> Result<StatusCode> {
    state
        .executor
        .execute(Command::RemoveProject {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn unremove_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<Project>> {
    if !is_unremove_patch(&patch) {
        return Err(Error::InvalidInput(
            "only [{\"op\":\"replace\",\"path\":\"/status\",\"value\":\"active\"}] is supported"
                .to_string(),
        ));
    }
    let result = state
        .executor
        .execute(Command::UnremoveProject {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
        })
        .await?;
    Ok(Json(result.into_project()?))
}

pub(crate) async fn purge_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project): Path<String>,
) -> Result<StatusCode> {
    state
        .executor
        .execute(Command::PurgeProject {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn list_repos(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    Query(params): Query<StatusParam>,
) -> Result<Json<Vec<Repository>>> {
    let handle = state.projects.project(&project)?;
    let repos = if params.status.as_deref() == Some("removed") {
        handle.list_removed_repos()
    } else {
        handle.list_repos()
    };
    Ok(Json(repos))
}

pub(crate) async fn create_repo(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project): Path<String>,
    Json(request): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Repository>)> {
    let result = state
        .executor
        .execute(Command::CreateRepository {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
            repo_name: request.name,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(result.into_repository()?)))
}

pub(crate) async fn remove_repo(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project, repo)): Path<(String, String)>,
) -> Result<StatusCode> {
    state
        .executor
        .execute(Command::RemoveRepository {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
            repo_name: repo,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn unremove_repo(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project, repo)): Path<(String, String)>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<Repository>> {
    if !is_unremove_patch(&patch) {
        return Err(Error::InvalidInput(
            "only [{\"op\":\"replace\",\"path\":\"/status\",\"value\":\"active\"}] is supported"
                .to_string(),
        ));
    }
    let result = state
        .executor
        .execute(Command::UnremoveRepository {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
            repo_name: repo,
        })
        .await?;
    Ok(Json(result.into_repository()?))
}

pub(crate) async fn purge_repo(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project, repo)): Path<(String, String)>,
) -> Result<StatusCode> {
    state
        .executor
        .execute(Command::PurgeRepository {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
            repo_name: repo,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
