//! Health, daemon status and the UI page

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};

use super::timestamp;
use crate::backend::router::AppState;
use crate::util::{format_size, format_speed};

const FALLBACK_PAGE: &str = r#"
<h1>Dataset Harvester</h1>
<p>Error: index.html file not found.</p>
<p>API is available at the following endpoints:</p>
<ul>
    <li>GET /downloads - List downloads</li>
    <li>POST /downloads - Add download</li>
    <li>GET /status - Check status</li>
    <li>GET /files - Browse files</li>
</ul>
"#;

pub async fn index(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.config.server.ui_path).await {
        Ok(contents) => Html(contents).into_response(),
        Err(e) => {
            tracing::debug!(path = %state.config.server.ui_path.display(), "UI page unavailable: {}", e);
            (StatusCode::NOT_FOUND, Html(FALLBACK_PAGE)).into_response()
        }
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": timestamp() }))
}

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub status: &'static str,
    pub active_downloads: u64,
    pub waiting_downloads: u64,
    pub stopped_downloads: u64,
    pub aria2_version: String,
    pub download_speed: String,
    pub upload_speed: String,
    pub download_dir: String,
    pub max_concurrent: u32,
    pub total_files: usize,
    pub total_size: String,
}

fn disconnected(error: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "disconnected", "error": error.into() })),
    )
        .into_response()
}

pub async fn status(State(state): State<AppState>) -> Response {
    let Some(gateway) = state.gateway.as_ref() else {
        return disconnected("Client not initialized");
    };

    let stats = match gateway.global_stats().await {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!("Error getting status: {}", e);
            return disconnected("Failed to query aria2c daemon");
        }
    };
    let version = gateway.version().await;
    let storage = state.catalog.summary().await;

    Json(DaemonStatus {
        status: "connected",
        active_downloads: stats.num_active,
        waiting_downloads: stats.num_waiting,
        stopped_downloads: stats.num_stopped,
        aria2_version: version,
        download_speed: format_speed(stats.download_speed),
        upload_speed: format_speed(stats.upload_speed),
        download_dir: state.catalog.root().display().to_string(),
        max_concurrent: state.config.daemon.max_concurrent_downloads,
        total_files: storage.total_files,
        total_size: format_size(storage.total_size),
    })
    .into_response()
}
