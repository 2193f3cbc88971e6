//! HTTP handlers, grouped by resource.

use axum::body::Bytes;
use serde_json::{Map, Value};

use super::error::{ApiError, ApiResult};
use super::router::AppState;
use crate::daemon::DownloadGateway;

pub mod downloads;
pub mod files;
pub mod status;

/// Request bodies are parsed leniently: anything that isn't a JSON object
/// counts as an empty one, so that missing fields are reported by name.
fn json_object(body: &Bytes) -> Map<String, Value> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(fields)) => fields,
        _ => Map::new(),
    }
}

fn string_field<'a>(body: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

fn gateway(state: &AppState) -> ApiResult<&DownloadGateway> {
    state.gateway.as_ref().ok_or_else(ApiError::not_connected)
}

fn timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
