use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mimir_core::RemoteItem;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::{AppState, WEBHOOK_PATH};
use crate::config::ConfigUpdate;
use crate::sync::codec::canonical_name;
use crate::sync::local_watcher::list_regular_files;
use crate::sync::state::rfc3339;
use crate::sync::{
    DownloadOutcome, ErrorKind, PassResult, SyncError, SyncStatus, WebhookEvent,
};
use crate::tunnel::TunnelState;

const DEFAULT_LOG_LINES: usize = 50;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(webhook))
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/stats", get(stats))
        .route("/api/files", get(files))
        .route("/api/sync", post(sync_now))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/tunnel/start", post(tunnel_start))
        .route("/api/tunnel/stop", post(tunnel_stop))
        .route("/api/tunnel/status", get(tunnel_status))
        .route("/api/dead-letters", get(dead_letters))
        .route("/api/dead-letters/{id}/retry", post(retry_dead_letter))
        .route("/api/logs", get(read_logs).delete(clear_logs))
        .route("/api/folder", get(folder))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    let status = match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({ "status": "error", "kind": kind, "message": message.into() });
    (status, Json(body)).into_response()
}

async fn webhook(State(state): State<Arc<AppState>>, Json(event): Json<WebhookEvent>) -> Response {
    let response = state.services().ingester.handle(&event).await;
    (response.http_status(), Json(response)).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "uptimeSecs": state.uptime().as_secs() }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    sync: SyncStatus,
    webhook_registration: SyncStatus,
    tunnel: TunnelState,
    pass_running: bool,
    dead_letters: usize,
    folder_id: String,
    download_directory: PathBuf,
    uptime_secs: u64,
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let services = state.services();
    Json(StatusBody {
        sync: state.sync_state.snapshot(),
        webhook_registration: state.registration.snapshot(),
        tunnel: state.tunnel.state(),
        pass_running: services.reconciler.is_running(),
        dead_letters: services.pipeline.dead_letters().list().len(),
        folder_id: services.pipeline.folder_id().to_string(),
        download_directory: services.pipeline.download_dir().to_path_buf(),
        uptime_secs: state.uptime().as_secs(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    uptime: String,
    uptime_secs: u64,
    local_files: usize,
    storage_bytes: u64,
    storage_used: String,
    remote_items: Option<usize>,
}

fn megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let services = state.services();
    let pipeline = &services.pipeline;
    // A directory that cannot be read counts as empty here.
    let local = list_regular_files(pipeline.download_dir())
        .await
        .unwrap_or_default();
    let storage_bytes = local.iter().map(|file| file.byte_size).sum();
    let remote_items = match pipeline
        .client()
        .list_folder_contents(pipeline.folder_id())
        .await
    {
        Ok(items) => Some(items.len()),
        Err(err) => {
            warn!(error = %err, "folder listing for stats failed");
            None
        }
    };
    let uptime_secs = state.uptime().as_secs();
    Json(StatsBody {
        uptime: format!("{}h {}m", uptime_secs / 3600, uptime_secs % 3600 / 60),
        uptime_secs,
        local_files: local.len(),
        storage_bytes,
        storage_used: megabytes(storage_bytes),
        remote_items,
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    name: String,
    byte_size: u64,
    size: String,
    modified: Option<String>,
    title: String,
    item_type: String,
    item_id: Option<String>,
    thumbnail: Option<String>,
}

async fn files(State(state): State<Arc<AppState>>) -> Response {
    let services = state.services();
    let pipeline = &services.pipeline;
    let local = match list_regular_files(pipeline.download_dir()).await {
        Ok(local) => local,
        Err(err) => return error_response(ErrorKind::Filesystem, err.to_string()),
    };
    // Without a listing the files are still returned, just unmatched.
    let remote = pipeline
        .client()
        .list_folder_contents(pipeline.folder_id())
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "folder listing for file view failed");
            Vec::new()
        });
    let by_id: HashMap<&str, &RemoteItem> =
        remote.iter().map(|item| (item.id.as_str(), item)).collect();
    let mut by_name: HashMap<String, &RemoteItem> = HashMap::new();
    for item in &remote {
        for title in [item.display_title(), item.original_file_name.as_deref()]
            .into_iter()
            .flatten()
        {
            by_name.entry(canonical_name(title)).or_insert(item);
        }
    }

    let mut entries: Vec<FileEntry> = local
        .into_iter()
        .map(|file| {
            let item = pipeline
                .names()
                .get(&file.name)
                .and_then(|claim| claim.item_id)
                .and_then(|id| by_id.get(id.as_str()).copied())
                .or_else(|| by_name.get(&file.name).copied());
            FileEntry {
                title: item
                    .and_then(RemoteItem::display_title)
                    .unwrap_or(file.name.as_str())
                    .to_string(),
                item_type: item
                    .and_then(|item| item.item_type.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
                item_id: item.map(|item| item.id.clone()),
                thumbnail: item.and_then(RemoteItem::preview_url).map(str::to_string),
                size: megabytes(file.byte_size),
                byte_size: file.byte_size,
                modified: file.modified.and_then(rfc3339),
                name: file.name,
            }
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Json(json!({ "files": entries })).into_response()
}

async fn sync_now(State(state): State<Arc<AppState>>) -> Response {
    info!("on-demand pass requested");
    match state.services().reconciler.run_pass().await {
        Ok(PassResult::Completed(report)) => {
            Json(json!({ "status": "completed", "report": report })).into_response()
        }
        Ok(PassResult::Coalesced) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "coalesced", "message": "A pass is already running" })),
        )
            .into_response(),
        Err(err) => error_response(err.kind(), err.to_string()),
    }
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.current().redacted())
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Response {
    match state.config.update(update) {
        Ok(next) => {
            info!(path = %state.config.path().display(), "configuration updated");
            Json(next.redacted()).into_response()
        }
        Err(err) => {
            warn!(error = %err, "configuration update rejected");
            error_response(err.kind(), err.to_string())
        }
    }
}

async fn tunnel_start(State(state): State<Arc<AppState>>) -> Response {
    match state.tunnel.start() {
        Ok(tunnel) => Json(json!({ "status": "started", "tunnel": tunnel })).into_response(),
        Err(err) => error_response(ErrorKind::Filesystem, err.to_string()),
    }
}

async fn tunnel_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.tunnel.stop();
    Json(json!({ "stopped": stopped, "tunnel": state.tunnel.state() }))
}

async fn tunnel_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.tunnel.state())
}

async fn dead_letters(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.services().pipeline.dead_letters().list())
}

async fn retry_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    info!(item_id = %id, "manual retry requested");
    match state.services().pipeline.retry_item(&id).await {
        Ok(outcome @ DownloadOutcome::Failed { .. }) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(outcome)).into_response()
        }
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            let err = SyncError::from(err);
            error_response(err.kind(), err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    lines: Option<usize>,
}

async fn read_logs(State(state): State<Arc<AppState>>, Query(query): Query<LogQuery>) -> Response {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    match state.logs.tail(lines).await {
        Ok(lines) => Json(json!({ "lines": lines })).into_response(),
        Err(err) => error_response(ErrorKind::Filesystem, err.to_string()),
    }
}

async fn clear_logs(State(state): State<Arc<AppState>>) -> Response {
    match state.logs.clear().await {
        Ok(()) => Json(json!({ "status": "cleared" })).into_response(),
        Err(err) => error_response(ErrorKind::Filesystem, err.to_string()),
    }
}

async fn folder(State(state): State<Arc<AppState>>) -> Response {
    let services = state.services();
    match services
        .pipeline
        .client()
        .fetch_folder(services.pipeline.folder_id())
        .await
    {
        Ok(meta) => Json(meta).into_response(),
        Err(err) => {
            let err = SyncError::from(err);
            error_response(err.kind(), err.to_string())
        }
    }
}
