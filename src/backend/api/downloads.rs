//! Download queue endpoints, backed by the daemon gateway

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use serde_json::{Value, json};

use super::{gateway, json_object, string_field, timestamp};
use crate::backend::error::{ApiError, ApiResult};
use crate::backend::router::AppState;
use crate::daemon::{DownloadSummary, GatewayError, ValidationError};

#[derive(Serialize)]
pub struct DownloadList {
    pub downloads: Vec<DownloadSummary>,
    pub count: usize,
    pub timestamp: i64,
}

pub async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<DownloadList>> {
    let gateway = gateway(&state)?;
    let records = gateway.list_downloads().await.map_err(|e| {
        tracing::error!("Error getting downloads: {}", e);
        ApiError::internal("Failed to retrieve downloads")
    })?;

    let downloads: Vec<DownloadSummary> = records.iter().map(DownloadSummary::from).collect();
    Ok(Json(DownloadList {
        count: downloads.len(),
        downloads,
        timestamp: timestamp(),
    }))
}

pub async fn add_download(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let gateway = gateway(&state)?;
    let body = json_object(&body);
    let url = string_field(&body, "url")
        .ok_or_else(|| ApiError::bad_request(ValidationError::MissingUrl.to_string()))?;
    let dir = string_field(&body, "dir");

    match gateway.add_download(url, dir).await {
        Ok(record) => Ok((
            StatusCode::CREATED,
            Json(json!({
                "message": "Download added successfully",
                "download": DownloadSummary::from(&record),
            })),
        )),
        Err(GatewayError::Validation(e)) => Err(ApiError::bad_request(e.to_string())),
        Err(GatewayError::AccessDenied(_)) => Err(ApiError::access_denied()),
        Err(e) => {
            tracing::error!("Error adding download: {}", e);
            Err(ApiError::internal("Failed to add download"))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Pause,
    Resume,
    Remove,
}

impl Control {
    fn verb(self) -> &'static str {
        match self {
            Control::Pause => "pause",
            Control::Resume => "resume",
            Control::Remove => "remove",
        }
    }

    fn past(self) -> &'static str {
        match self {
            Control::Pause => "paused",
            Control::Resume => "resumed",
            Control::Remove => "removed",
        }
    }
}

async fn control(state: &AppState, gid: &str, action: Control) -> ApiResult<Json<Value>> {
    let gateway = gateway(state)?;
    let result = match action {
        Control::Pause => gateway.pause(gid).await,
        Control::Resume => gateway.resume(gid).await,
        Control::Remove => gateway.remove(gid).await,
    };

    match result {
        Ok(()) => {
            tracing::info!(%gid, "Download {}", action.past());
            Ok(Json(json!({
                "message": format!("Download {} successfully", action.past())
            })))
        }
        Err(GatewayError::NotFound(_)) => Err(ApiError::not_found("Download not found")),
        Err(e) => {
            tracing::error!(%gid, "Error during {}: {}", action.verb(), e);
            Err(ApiError::internal(format!(
                "Failed to {} download",
                action.verb()
            )))
        }
    }
}

pub async fn pause_download(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> ApiResult<Json<Value>> {
    control(&state, &gid, Control::Pause).await
}

pub async fn resume_download(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> ApiResult<Json<Value>> {
    control(&state, &gid, Control::Resume).await
}

pub async fn remove_download(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> ApiResult<Json<Value>> {
    control(&state, &gid, Control::Remove).await
}
