//! Data structures for downloads reported by the daemon
//!
//! aria2 reports every numeric field as a decimal string; the parsers here
//! turn those into typed records, defaulting absent fields to zero.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::util::{format_eta, format_size, format_speed};

/// Status of a download, as named by the daemon
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Currently transferring
    Active,
    /// Queued behind other downloads
    #[default]
    Waiting,
    /// Paused by a client
    Paused,
    /// Finished successfully
    Complete,
    /// Stopped on an error, or the record itself was unreadable
    Error,
    /// Removed by a client
    Removed,
}

impl DownloadStatus {
    /// Downloads the daemon still holds in its queue. Anything else only
    /// lingers as a result record.
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Active | Self::Waiting | Self::Paused)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

impl FromStr for DownloadStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            "removed" => Ok(Self::Removed),
            other => Err(RecordError::UnknownStatus(other.to_string())),
        }
    }
}

/// Reasons a single daemon record could not be read
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not an object")]
    NotAnObject,
    #[error("record has no gid")]
    MissingGid,
    #[error("field {field} is not a number: {value}")]
    BadNumber { field: &'static str, value: String },
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
}

/// Reads an aria2 numeric field. Absent fields are zero.
fn number(obj: &Map<String, Value>, field: &'static str) -> Result<u64, RecordError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::String(s)) if s.is_empty() => Ok(0),
        Some(Value::String(s)) => s.parse().map_err(|_| RecordError::BadNumber {
            field,
            value: s.clone(),
        }),
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| RecordError::BadNumber {
            field,
            value: n.to_string(),
        }),
        Some(other) => Err(RecordError::BadNumber {
            field,
            value: other.to_string(),
        }),
    }
}

/// One download as known to the daemon at the time of the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    pub gid: String,
    pub name: String,
    pub status: DownloadStatus,
    pub total_length: u64,
    pub completed_length: u64,
    /// Bytes per second
    pub download_speed: u64,
}

impl DownloadRecord {
    /// Progress as a percentage rounded to one decimal, 0 for unknown sizes
    pub fn progress(&self) -> f64 {
        if self.total_length == 0 {
            return 0.0;
        }
        let percent = self.completed_length as f64 / self.total_length as f64 * 100.0;
        (percent * 10.0).round() / 10.0
    }

    /// Stand-in for a record that could not be read, so that one bad entry
    /// does not sink a whole listing
    pub fn placeholder(gid: Option<&str>) -> Self {
        Self {
            gid: gid.unwrap_or("unknown").to_string(),
            name: "Error".to_string(),
            status: DownloadStatus::Error,
            total_length: 0,
            completed_length: 0,
            download_speed: 0,
        }
    }

    /// Parses an aria2 status struct (`aria2.tellStatus` and friends)
    pub fn from_rpc(value: &Value) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;
        let gid = obj
            .get("gid")
            .and_then(Value::as_str)
            .ok_or(RecordError::MissingGid)?;
        let status = match obj.get("status").and_then(Value::as_str) {
            Some(status) => status.parse()?,
            None => DownloadStatus::Error,
        };

        Ok(Self {
            gid: gid.to_string(),
            name: display_name(obj),
            status,
            total_length: number(obj, "totalLength")?,
            completed_length: number(obj, "completedLength")?,
            download_speed: number(obj, "downloadSpeed")?,
        })
    }

    /// Like [`DownloadRecord::from_rpc`], but never fails
    pub fn from_rpc_lossy(value: &Value) -> Self {
        Self::from_rpc(value).unwrap_or_else(|e| {
            let gid = value.get("gid").and_then(Value::as_str);
            tracing::error!(?gid, error = %e, "Error converting download record");
            Self::placeholder(gid)
        })
    }
}

/// Torrent name, else the first file's name, else the last segment of the
/// first URI
fn display_name(obj: &Map<String, Value>) -> String {
    let torrent_name = obj
        .get("bittorrent")
        .and_then(|bt| bt.get("info"))
        .and_then(|info| info.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty());
    if let Some(name) = torrent_name {
        return name.to_string();
    }

    let first_file = obj
        .get("files")
        .and_then(Value::as_array)
        .and_then(|files| files.first());

    let file_name = first_file
        .and_then(|file| file.get("path"))
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .and_then(|path| Path::new(path).file_name())
        .map(|name| name.to_string_lossy().into_owned());
    if let Some(name) = file_name {
        return name;
    }

    first_file
        .and_then(|file| file.get("uris"))
        .and_then(Value::as_array)
        .and_then(|uris| uris.first())
        .and_then(|uri| uri.get("uri"))
        .and_then(Value::as_str)
        .and_then(name_from_url)
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Last non-empty path segment of a URL, without query string
pub fn name_from_url(url: &str) -> Option<String> {
    let url = url.split(['?', '#']).next().unwrap_or(url);
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .map(str::to_string)
}

/// Client-facing shape of a download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub gid: String,
    pub name: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub download_speed: String,
    pub total_length: u64,
    pub completed_length: u64,
    pub total_size: String,
    pub completed_size: String,
    pub eta: String,
}

impl From<&DownloadRecord> for DownloadSummary {
    fn from(record: &DownloadRecord) -> Self {
        let remaining = record
            .total_length
            .saturating_sub(record.completed_length);
        Self {
            gid: record.gid.clone(),
            name: record.name.clone(),
            status: record.status,
            progress: record.progress(),
            download_speed: format_speed(record.download_speed),
            total_length: record.total_length,
            completed_length: record.completed_length,
            total_size: format_size(record.total_length),
            completed_size: format_size(record.completed_length),
            eta: format_eta(remaining, record.download_speed),
        }
    }
}

/// Daemon-wide counters from `aria2.getGlobalStat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub num_active: u64,
    pub num_waiting: u64,
    pub num_stopped: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
}

impl GlobalStats {
    pub fn from_rpc(value: &Value) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;
        Ok(Self {
            num_active: number(obj, "numActive")?,
            num_waiting: number(obj, "numWaiting")?,
            num_stopped: number(obj, "numStopped")?,
            download_speed: number(obj, "downloadSpeed")?,
            upload_speed: number(obj, "uploadSpeed")?,
        })
    }
}
