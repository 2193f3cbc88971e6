//! File manager endpoints. Every client supplied path goes through the
//! catalog's guard before it touches the disk.

use std::path::PathBuf;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::header,
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

use super::{json_object, string_field};
use crate::backend::error::{ApiError, ApiResult};
use crate::backend::router::AppState;
use crate::files::archive::{self, ArchiveError, is_archive};
use crate::files::{FsError, Listing};

/// Maps a catalog error, logging whatever isn't the client's fault
fn fs_error(err: FsError, not_found: &str, failure: &str) -> ApiError {
    match err {
        FsError::Security(_) => ApiError::access_denied(),
        FsError::NotFound => ApiError::not_found(not_found),
        FsError::Io(e) => {
            tracing::error!("{}: {}", failure, e);
            ApiError::internal(failure)
        }
    }
}

fn required_file_path(body: &Bytes) -> ApiResult<(String, Option<String>)> {
    let body = json_object(body);
    let file_path = string_field(&body, "file_path")
        .ok_or_else(|| ApiError::bad_request("file_path is required"))?;
    let extract_to = string_field(&body, "extract_to").map(str::to_string);
    Ok((file_path.to_string(), extract_to))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Listing>> {
    state
        .catalog
        .list(query.path.as_deref())
        .await
        .map(Json)
        .map_err(|e| fs_error(e, "Path not found", "Failed to list files"))
}

pub async fn extract_file(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let (file_path, extract_to) = required_file_path(&body)?;
    let source = state
        .catalog
        .existing(&file_path)
        .await
        .map_err(|e| fs_error(e, "File not found", "Failed to extract file"))?;

    let is_file = tokio::fs::metadata(&source)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file || !is_archive(&source) {
        return Err(ApiError::bad_request("File is not a supported archive"));
    }

    let destination: Option<PathBuf> = match extract_to.as_deref() {
        Some(target) if !target.trim().is_empty() => Some(
            state
                .catalog
                .guard()
                .resolve(Some(target))
                .map_err(|_| ApiError::access_denied())?,
        ),
        _ => None,
    };

    match archive::extract(&source, destination.as_deref()).await {
        Ok(extract_path) => {
            tracing::info!(
                "Extracted {} to {}",
                source.display(),
                extract_path.display()
            );
            Ok(Json(json!({
                "message": "File extracted successfully",
                "extract_path": extract_path,
            })))
        }
        Err(e @ (ArchiveError::NotAnArchive | ArchiveError::UnsupportedFormat(_))) => {
            tracing::warn!(path = %source.display(), "{}", e);
            Err(ApiError::bad_request("Unsupported archive format"))
        }
        Err(e) => {
            tracing::error!(path = %source.display(), "Error extracting file: {}", e);
            Err(ApiError::internal("Failed to extract file"))
        }
    }
}

pub async fn delete_file(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let (file_path, _) = required_file_path(&body)?;
    state
        .catalog
        .delete(&file_path)
        .await
        .map_err(|e| fs_error(e, "File not found", "Failed to delete file"))?;
    Ok(Json(json!({ "message": "File deleted successfully" })))
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(relative): Path<String>,
) -> ApiResult<Response> {
    let (path, file) = state
        .catalog
        .open_for_download(&relative)
        .await
        .map_err(|e| fs_error(e, "File not found", "Failed to download file"))?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().replace('"', "\\\""))
        .unwrap_or_else(|| "download".to_string());
    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(body)
        .map_err(|e| {
            tracing::error!("Error building download response: {}", e);
            ApiError::internal("Failed to download file")
        })
}
