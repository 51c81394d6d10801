//! Content endpoints: tree listing, file reads and queries, pushes,
//! history, diffs and the long-poll watch protocol.

use std::time::Duration;

use axum::extract::{Path, Query as QueryParams, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::{now_millis, request_author, SharedState};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::model::{
    Change, CommitMessage, ListEntry, PathPattern, Query, Revision, WatchFileResult,
    WatchRepoResult,
};
use crate::watch;

const DEFAULT_WATCH_SECONDS: u64 = 60;
const MAX_WATCH_SECONDS: u64 = 120;
const DEFAULT_MAX_COMMITS: usize = 100;

type Params = Vec<(String, String)>;

fn param<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn revision_param(params: &Params, name: &str) -> Result<Revision> {
    match param(params, name) {
        Some(v) => v.parse(),
        None => Ok(Revision::HEAD),
    }
}

fn jsonpath_params(params: &Params) -> Vec<String> {
    params
        .iter()
        .filter(|(k, _)| k == "jsonpath")
        .map(|(_, v)| v.clone())
        .collect()
}

fn query_of(path: &str, params: &Params) -> Result<Query> {
    let exprs = jsonpath_params(params);
    let query = if exprs.is_empty() {
        Query::identity(path)
    } else {
        Query::of_json_path(path, exprs)
    };
    query.ok_or_else(|| Error::QueryExecution(format!("cannot query {}", path)))
}

fn is_pattern(path: &str) -> bool {
    path.contains('*') || path.contains(',')
}

fn pattern_of(path: &str) -> Result<PathPattern> {
    if path.is_empty() {
        PathPattern::new("/**")
    } else {
        PathPattern::new(path)
    }
}

pub(crate) async fn normalize_revision(
    State(state): State<SharedState>,
    Path((project, repo, revision)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>> {
    let repo = state.projects.project(&project)?.repo(&repo)?;
    let revision: Revision = revision.parse()?;
    let normalized = repo.normalize_revision(revision)?;
    Ok(Json(serde_json::json!({ "revision": normalized })))
}

pub(crate) async fn list_root(
    state: State<SharedState>,
    path: Path<(String, String)>,
    params: QueryParams<Params>,
) -> Result<Json<Vec<ListEntry>>> {
    let Path((project, repo)) = path;
    list_inner(state, project, repo, String::new(), params.0).await
}

pub(crate) async fn list(
    state: State<SharedState>,
    Path((project, repo, path)): Path<(String, String, String)>,
    params: QueryParams<Params>,
) -> Result<Json<Vec<ListEntry>>> {
    list_inner(state, project, repo, format!("/{}", path), params.0).await
}

async fn list_inner(
    State(state): State<SharedState>,
    project: String,
    repo: String,
    path: String,
    params: Params,
) -> Result<Json<Vec<ListEntry>>> {
    let repo = state.projects.project(&project)?.repo(&repo)?;
    let revision = revision_param(&params, "revision")?;
    let pattern = pattern_of(&path)?;
    let entries = repo.list(revision, &pattern)?;
    let listing = entries
        .into_iter()
        .map(|e| ListEntry {
            r#type: e.entry_type(),
            path: e.path,
        })
        .collect();
    Ok(Json(listing))
}

pub(crate) async fn get_all(
    State(state): State<SharedState>,
    Path((project, repo)): Path<(String, String)>,
    QueryParams(params): QueryParams<Params>,
) -> Result<Json<serde_json::Value>> {
    let repo = state.projects.project(&project)?.repo(&repo)?;
    let revision = revision_param(&params, "revision")?;
    let entries = repo.list(revision, &PathPattern::all())?;
    Ok(Json(serde_json::to_value(entries)?))
}

/// `GET /contents/*path` serves plain reads, pattern reads and the
/// long-poll watch protocol, selected by the `if-none-match` header.
pub(crate) async fn get_or_watch(
    State(state): State<SharedState>,
    Path((project, repo_name, path)): Path<(String, String, String)>,
    QueryParams(params): QueryParams<Params>,
    headers: HeaderMap,
) -> Result<Response> {
    let repo = state.projects.project(&project)?.repo(&repo_name)?;
    let path = format!("/{}", path);

    if let Some(last_known) = watch_revision(&headers)? {
        let timeout = watch_timeout(&headers);
        if is_pattern(&path) {
            let pattern = pattern_of(&path)?;
            return match watch::watch_repo(&repo, last_known, &pattern, timeout).await? {
                Some(revision) => Ok(Json(WatchRepoResult { revision }).into_response()),
                None => Ok(StatusCode::NOT_MODIFIED.into_response()),
            };
        }
        let query = query_of(&path, &params)?;
        return match watch::watch_file(&repo, last_known, &query, timeout).await? {
            Some((revision, entry)) => {
                Ok(Json(WatchFileResult { revision, entry }).into_response())
            }
            None => Ok(StatusCode::NOT_MODIFIED.into_response()),
        };
    }

    let revision = revision_param(&params, "revision")?;
    if is_pattern(&path) {
        let entries = repo.list(revision, &pattern_of(&path)?)?;
        return Ok(Json(entries).into_response());
    }
    let query = query_of(&path, &params)?;
    let entry = repo.get_strict(revision, &query)?;
    Ok(Json(entry).into_response())
}

fn watch_revision(headers: &HeaderMap) -> Result<Option<Revision>> {
    match headers.get("if-none-match") {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| Error::InvalidInput("invalid if-none-match".to_string()))?
                .trim_matches('"');
            Ok(Some(raw.parse()?))
        }
        None => Ok(None),
    }
}

fn watch_timeout(headers: &HeaderMap) -> Duration {
    let seconds = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.split(',')
                .map(str::trim)
                .find_map(|part| part.strip_prefix("wait="))
        })
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_WATCH_SECONDS);
    Duration::from_secs(seconds.min(MAX_WATCH_SECONDS))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PushRequest {
    commit_message: CommitMessage,
    changes: Vec<Change>,
}

pub(crate) async fn push(
    State(state): State<SharedState>,
    Path((project, repo)): Path<(String, String)>,
    QueryParams(params): QueryParams<Params>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<crate::model::PushResult>> {
    if request.commit_message.summary.is_empty() {
        return Err(Error::InvalidInput(
            "summary of commitMessage cannot be empty".to_string(),
        ));
    }
    let base_revision = revision_param(&params, "revision")?;
    let result = state
        .executor
        .execute(Command::NormalizingPush {
            timestamp_millis: now_millis(),
            author: request_author(&headers),
            project_name: project,
            repo_name: repo,
            base_revision,
            summary: request.commit_message.summary,
            detail: request.commit_message.detail,
            changes: request.changes,
        })
        .await?;
    Ok(Json(result.into_push()?))
}

pub(crate) async fn history(
    State(state): State<SharedState>,
    Path((project, repo, from)): Path<(String, String, String)>,
    QueryParams(params): QueryParams<Params>,
) -> Result<Json<Vec<crate::model::Commit>>> {
    let repo = state.projects.project(&project)?.repo(&repo)?;
    let from: Revision = from.parse()?;
    let to = match param(&params, "to") {
        Some(v) => v.parse()?,
        None => Revision::INIT,
    };
    let pattern = pattern_of(param(&params, "path").unwrap_or(""))?;
    let max_commits = match param(&params, "maxCommits") {
        Some(v) => v
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid maxCommits: {}", v)))?,
        None => DEFAULT_MAX_COMMITS,
    };
    let commits = repo.history(from, to, &pattern, max_commits)?;
    Ok(Json(commits))
}

pub(crate) async fn merge(
    State(state): State<SharedState>,
    Path((project, repo)): Path<(String, String)>,
    QueryParams(params): QueryParams<Params>,
) -> Result<Json<crate::model::MergedEntry>> {
    let repo = state.projects.project(&project)?.repo(&repo)?;
    let revision = revision_param(&params, "revision")?;
    let mut sources = Vec::new();
    for (key, value) in &params {
        match key.as_str() {
            "path" => sources.push(crate::model::MergeSource::required(value)),
            "optional_path" => sources.push(crate::model::MergeSource::optional(value)),
            _ => {}
        }
    }
    if sources.is_empty() {
        return Err(Error::InvalidInput("at least one path is required".to_string()));
    }
    let merged = repo.merge_query(revision, &sources, &jsonpath_params(&params))?;
    Ok(Json(merged))
}

pub(crate) async fn compare(
    State(state): State<SharedState>,
    Path((project, repo)): Path<(String, String)>,
    QueryParams(params): QueryParams<Params>,
) -> Result<Json<serde_json::Value>> {
    let repo = state.projects.project(&project)?.repo(&repo)?;
    let from = match param(&params, "from") {
        Some(v) => v.parse()?,
        None => Revision::INIT,
    };
    let to = revision_param(&params, "to")?;

    if let Some(path) = param(&params, "path") {
        let query = query_of(path, &params)?;
        let change = repo.diff_file(from, to, &query)?;
        return Ok(Json(serde_json::to_value(change)?));
    }
    let pattern = pattern_of(param(&params, "pathPattern").unwrap_or(""))?;
    let changes = repo.diff(from, to, &pattern)?;
    Ok(Json(serde_json::to_value(changes)?))
}
