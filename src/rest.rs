//! REST surface (§6): context generation, repository CRUD and sync, search,
//! and inbound sync webhooks.
//!
//! Grounded on `web3infra-foundation-git-internal/examples/http_server.rs`'s
//! `Router`/`State`/typed-`Response` shape and its path-validation discipline
//! (`resolve_repo_path` rejecting traversal before the name ever reaches the
//! filesystem), applied here to repository names instead of git-dir paths.

use crate::context_generator::{ContextQuery, Strategy};
use crate::document::Repository;
use crate::error::ServiceError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({"error": {"kind": self.kind(), "message": self.redacted_message()}}));
        (status, body).into_response()
    }
}

/// Rejects repository names that could escape the configured workspace root
/// or collide with an unexpected path segment, before any lookup happens.
fn validate_repository_name(name: &str) -> Result<(), ServiceError> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ServiceError::Security(format!("invalid repository name '{name}'")));
    }
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/context/generate", post(generate_context))
        .route("/api/context/generate-formatted", post(generate_context_formatted))
        .route("/api/repos/status", get(repos_status))
        .route("/api/repos/sync", post(repos_sync))
        .route("/api/repos/add", post(repos_add))
        .route("/api/repos/{name}", put(repos_update))
        .route("/api/repos/{name}", delete(repos_delete))
        .route("/api/search", get(search))
        .route("/api/search/metadata", get(search_metadata))
        .route("/api/search/stats", get(search_stats))
        .route("/api/webhooks/github/{name}", post(webhook_github))
        .route("/api/webhooks/gitlab/{name}", post(webhook_gitlab))
        .route("/api/webhooks/generic/{name}", post(webhook_generic))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ContextGenerateBody {
    task: String,
    language: Option<String>,
    framework: Option<String>,
    context: Option<String>,
    max_results: Option<usize>,
    repositories: Option<Vec<String>>,
    categories: Option<Vec<String>>,
    #[serde(default)]
    strategy: Option<String>,
}

fn to_query(body: ContextGenerateBody) -> ContextQuery {
    let strategy = match body.strategy.as_deref() {
        Some("semantic") => Strategy::Semantic,
        Some("keyword") => Strategy::Keyword,
        _ => Strategy::Hybrid,
    };
    ContextQuery {
        task: body.task,
        language: body.language,
        framework: body.framework,
        context: body.context,
        max_results: body.max_results,
        repositories: body.repositories,
        categories: body.categories,
        strategy,
    }
}

async fn generate_context(State(state): State<Arc<AppState>>, Json(body): Json<ContextGenerateBody>) -> Response {
    if body.task.trim().is_empty() {
        return ServiceError::Validation("'task' is required".to_string()).into_response();
    }
    let query = to_query(body);
    match state.context_generator.generate(&query).await {
        Ok(result) => Json(json!({"content": result.content, "chunks": result.chunks, "metadata": result.metadata})).into_response(),
        Err(e) => ServiceError::from(e).into_response(),
    }
}

async fn generate_context_formatted(State(state): State<Arc<AppState>>, Json(body): Json<ContextGenerateBody>) -> Response {
    if body.task.trim().is_empty() {
        return ServiceError::Validation("'task' is required".to_string()).into_response();
    }
    let query = to_query(body);
    match state.context_generator.generate(&query).await {
        Ok(result) => ([(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")], result.content).into_response(),
        Err(e) => ServiceError::from(e).into_response(),
    }
}

async fn repos_status(State(state): State<Arc<AppState>>) -> Response {
    let statuses = state.git_sync.all_statuses();
    let rendered: HashMap<String, String> = statuses.into_iter().map(|(k, v)| (k, format!("{v:?}"))).collect();
    Json(rendered).into_response()
}

#[derive(Debug, Deserialize)]
struct RepoSyncBody {
    repository: Option<String>,
}

async fn repos_sync(State(state): State<Arc<AppState>>, Json(body): Json<RepoSyncBody>) -> Response {
    let repo = match state.resolve_repository(body.repository.as_deref()).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };
    let cfg = state.config.read().await.clone();
    match crate::ingest::ingest_repository(&repo, &state.git_sync, state.index.as_ref(), state.embedder.as_ref(), &cfg.chunking).await {
        Ok(outcome) => Json(json!({
            "repository": outcome.repository,
            "changedFiles": outcome.changed_files.len(),
            "commit": outcome.commit,
            "fullWalk": outcome.full_walk,
        }))
        .into_response(),
        Err(e) => ServiceError::from(e).into_response(),
    }
}

async fn repos_add(State(state): State<Arc<AppState>>, Json(repo): Json<Repository>) -> Response {
    if let Err(e) = validate_repository_name(&repo.name) {
        return e.into_response();
    }
    let mut config = state.config.write().await;
    if config.find_repository(&repo.name).is_some() {
        return ServiceError::Validation(format!("repository '{}' already exists", repo.name)).into_response();
    }
    config.repositories.push(repo.clone());
    if let Err(e) = config.save(&state.config_path) {
        return ServiceError::from(e).into_response();
    }
    drop(config);
    state.scheduler.schedule(repo.clone()).await;
    info!(repository = %repo.name, "repository added");
    (StatusCode::OK, Json(json!({"repository": repo.name}))).into_response()
}

async fn repos_update(State(state): State<Arc<AppState>>, Path(name): Path<String>, Json(patch): Json<Value>) -> Response {
    if let Err(e) = validate_repository_name(&name) {
        return e.into_response();
    }
    let mut config = state.config.write().await;
    let Some(pos) = config.repositories.iter().position(|r| r.name == name) else {
        return ServiceError::NotFound(format!("repository '{name}' is not configured")).into_response();
    };
    let existing = serde_json::to_value(&config.repositories[pos]).unwrap_or(Value::Null);
    let merged = crate::config::deep_merge(&existing, &patch);
    let updated: Repository = match serde_json::from_value(merged) {
        Ok(r) => r,
        Err(e) => return ServiceError::Validation(e.to_string()).into_response(),
    };
    config.repositories[pos] = updated.clone();
    if let Err(e) = config.save(&state.config_path) {
        return ServiceError::from(e).into_response();
    }
    drop(config);
    state.scheduler.schedule(updated).await;
    (StatusCode::OK, Json(json!({"repository": name}))).into_response()
}

async fn repos_delete(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if let Err(e) = validate_repository_name(&name) {
        return e.into_response();
    }
    let mut config = state.config.write().await;
    let before = config.repositories.len();
    config.repositories.retain(|r| r.name != name);
    if config.repositories.len() == before {
        return ServiceError::NotFound(format!("repository '{name}' is not configured")).into_response();
    }
    if let Err(e) = config.save(&state.config_path) {
        return ServiceError::from(e).into_response();
    }
    drop(config);
    state.scheduler.stop(&name).await;
    if let Err(e) = state.git_sync.delete_repository(&name).await {
        return ServiceError::from(e).into_response();
    }
    match state.index.delete_by_repository(&name).await {
        Ok(removed) => {
            info!(repository = %name, removed, "repository deleted");
            (StatusCode::OK, Json(json!({"repository": name, "chunksRemoved": removed}))).into_response()
        }
        Err(e) => ServiceError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    category: Option<String>,
    repository: Option<String>,
    #[serde(rename = "type")]
    _type: Option<String>,
    limit: Option<usize>,
}

async fn search(State(state): State<Arc<AppState>>, Query(params): Query<SearchParams>) -> Response {
    if params.q.trim().is_empty() {
        return ServiceError::Validation("'q' is required".to_string()).into_response();
    }
    let query = ContextQuery {
        task: params.q,
        repositories: params.repository.map(|r| vec![r]),
        categories: params.category.map(|c| vec![c]),
        max_results: params.limit,
        strategy: Strategy::Hybrid,
        ..Default::default()
    };
    match state.context_generator.generate(&query).await {
        Ok(result) => Json(json!({"strategy": result.metadata.strategy, "results": result.chunks})).into_response(),
        Err(e) => ServiceError::from(e).into_response(),
    }
}

async fn search_metadata(State(state): State<Arc<AppState>>) -> Response {
    match state.index.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => ServiceError::from(e).into_response(),
    }
}

async fn search_stats(State(state): State<Arc<AppState>>) -> Response {
    search_metadata(State(state)).await
}

/// Best-effort `repository.clone_url` extraction, tolerant of both the
/// GitHub and GitLab push payload shapes.
fn webhook_clone_url(payload: &Value) -> Option<&str> {
    payload
        .get("repository")
        .and_then(|r| r.get("clone_url").or_else(|| r.get("git_http_url")).or_else(|| r.get("http_url")))
        .and_then(Value::as_str)
}

async fn dispatch_webhook_sync(state: Arc<AppState>, name: String, payload: Value) -> Response {
    let config = state.config.read().await;
    let Some(repo) = config.find_repository(&name).cloned() else {
        return ServiceError::NotFound(format!("repository '{name}' is not configured")).into_response();
    };
    drop(config);

    if let Some(clone_url) = webhook_clone_url(&payload) {
        if clone_url != repo.clone_url {
            warn!(repository = %name, "webhook payload clone_url does not match configured repository; syncing anyway");
        }
    }

    tokio::spawn(async move {
        let cfg = state.config.read().await.clone();
        if let Err(e) = crate::ingest::ingest_repository(&repo, &state.git_sync, state.index.as_ref(), state.embedder.as_ref(), &cfg.chunking).await {
            warn!(repository = %repo.name, error = %e, "webhook-triggered sync failed");
        }
    });

    (StatusCode::OK, Json(json!({"scheduled": true}))).into_response()
}

fn check_bearer(headers: &axum::http::HeaderMap, expected_env: &str) -> Result<(), ServiceError> {
    let Ok(expected) = std::env::var(expected_env) else {
        return Ok(()); // no secret configured: accept (local/dev convenience)
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()))
        .or_else(|| headers.get("x-gitlab-token").and_then(|v| v.to_str().ok()));
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ServiceError::Auth("webhook credential missing or invalid".to_string())),
    }
}

async fn webhook_github(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if let Err(e) = validate_repository_name(&name) {
        return e.into_response();
    }
    if let Err(e) = check_bearer(&headers, "GITHUB_WEBHOOK_SECRET") {
        return e.into_response();
    }
    dispatch_webhook_sync(state, name, payload).await
}

async fn webhook_gitlab(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if let Err(e) = validate_repository_name(&name) {
        return e.into_response();
    }
    if let Err(e) = check_bearer(&headers, "GITLAB_WEBHOOK_TOKEN") {
        return e.into_response();
    }
    dispatch_webhook_sync(state, name, payload).await
}

async fn webhook_generic(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if let Err(e) = validate_repository_name(&name) {
        return e.into_response();
    }
    if let Err(e) = check_bearer(&headers, "WEBHOOK_AUTH") {
        return e.into_response();
    }
    dispatch_webhook_sync(state, name, payload).await
}
