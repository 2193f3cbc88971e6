//! Typed client for the daemon's control protocol
//!
//! Everything here is a thin mapping from aria2 calls to [`DownloadRecord`]s.
//! Nothing is cached: each operation reflects what the daemon says at the
//! time of the call.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{DownloadRecord, DownloadStatus, GlobalStats, name_from_url};
use super::rpc::{RpcError, RpcTransport};
use crate::files::{PathGuard, SecurityError};

/// Accepted URL prefixes for new downloads
pub const VALID_SCHEMES: [&str; 4] = ["http://", "https://", "ftp://", "magnet:"];

/// Page size for `tellWaiting` / `tellStopped`
const LIST_PAGE: u64 = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("URL is required")]
    MissingUrl,

    #[error("URL cannot be empty")]
    EmptyUrl,

    #[error("Invalid URL format. Must start with http://, https://, ftp://, or magnet:")]
    BadScheme,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    AccessDenied(#[from] SecurityError),

    #[error("Download not found: {0}")]
    NotFound(String),

    /// The daemon answered, but refused the operation
    #[error("Daemon rejected {operation} for {gid}")]
    OperationFailed { operation: &'static str, gid: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Unexpected daemon reply: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Daemon unreachable after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// How hard [`DownloadGateway::connect`] tries before giving up
#[derive(Debug, Clone, Copy)]
pub struct ConnectPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

pub fn validate_url(url: &str) -> std::result::Result<(), ValidationError> {
    if url.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }
    if !VALID_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(ValidationError::BadScheme);
    }
    Ok(())
}

/// Loose truthiness of an RPC reply; aria2 answers the gid or `"OK"` on success
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Version-compatibility shim for the global statistics call.
///
/// Candidates are tried in order and the first success wins: the current
/// method name, the plural spelling some builds exposed, then the same call
/// wrapped in `system.multicall`. Only "no such method" moves on to the next
/// candidate; any other failure is returned as is.
async fn fetch_global_stat(rpc: &dyn RpcTransport) -> std::result::Result<Value, RpcError> {
    let candidates: [(&str, Vec<Value>); 3] = [
        ("aria2.getGlobalStat", vec![]),
        ("aria2.getGlobalStats", vec![]),
        (
            "system.multicall",
            vec![json!([{ "methodName": "aria2.getGlobalStat", "params": [] }])],
        ),
    ];

    let mut last = None;
    for (method, params) in candidates {
        match rpc.call(method, params).await {
            Ok(value) if method == "system.multicall" => return unwrap_multicall(value),
            Ok(value) => return Ok(value),
            Err(e) if e.is_method_not_found() => {
                debug!(method, "Stat method unavailable, trying next candidate");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| RpcError::Decode("no stat method available".into())))
}

/// First result of a `system.multicall` reply: `[[result], {faultCode, ..}, ...]`
fn unwrap_multicall(value: Value) -> std::result::Result<Value, RpcError> {
    let first = value
        .as_array()
        .and_then(|results| results.first())
        .ok_or_else(|| RpcError::Decode("empty multicall reply".into()))?;
    if let Some(code) = first.get("faultCode") {
        return Err(RpcError::Remote {
            code: code.as_i64().unwrap_or_default(),
            message: first
                .get("faultString")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    first
        .as_array()
        .and_then(|inner| inner.first())
        .cloned()
        .ok_or_else(|| RpcError::Decode("multicall result is not wrapped".into()))
}

/// Daemon version, or `unknown` when the daemon won't say
async fn fetch_version(rpc: &dyn RpcTransport) -> String {
    match rpc.call("aria2.getVersion", vec![]).await {
        Ok(reply) => reply
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        Err(e) => {
            debug!(error = %e, "Version query failed");
            "unknown".to_string()
        }
    }
}

fn records(reply: Value, method: &str) -> Result<Vec<DownloadRecord>> {
    match reply {
        Value::Array(items) => Ok(items.iter().map(DownloadRecord::from_rpc_lossy).collect()),
        other => Err(GatewayError::Malformed(format!(
            "{method} returned {other} instead of a list"
        ))),
    }
}

/// Connected client over an [`RpcTransport`]
#[derive(Clone)]
pub struct DownloadGateway {
    rpc: Arc<dyn RpcTransport>,
    guard: PathGuard,
}

impl DownloadGateway {
    /// Wraps a transport without probing it
    pub fn new(rpc: Arc<dyn RpcTransport>, guard: PathGuard) -> Self {
        Self { rpc, guard }
    }

    /// Probes the daemon until it answers, up to `policy.attempts` times.
    ///
    /// The daemon needs a variable amount of time to come up after it is
    /// spawned, hence the retries.
    pub async fn connect(
        rpc: Arc<dyn RpcTransport>,
        guard: PathGuard,
        policy: ConnectPolicy,
    ) -> std::result::Result<Self, ConnectError> {
        let mut last = String::from("no connection attempts made");
        for attempt in 1..=policy.attempts {
            match fetch_global_stat(rpc.as_ref()).await {
                Ok(_) => {
                    let version = fetch_version(rpc.as_ref()).await;
                    info!(%version, "Connected to aria2c daemon");
                    return Ok(Self::new(rpc, guard));
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} failed: {}",
                        attempt, policy.attempts, e
                    );
                    last = e.to_string();
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.backoff).await;
                    }
                }
            }
        }
        tracing::error!(
            "Failed to connect to aria2c daemon after {} attempts",
            policy.attempts
        );
        Err(ConnectError::Unreachable {
            attempts: policy.attempts,
            last,
        })
    }

    /// Every download the daemon knows about: active, waiting and stopped
    pub async fn list_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let page = json!(LIST_PAGE);
        let mut all = records(self.rpc.call("aria2.tellActive", vec![]).await?, "tellActive")?;
        all.extend(records(
            self.rpc
                .call("aria2.tellWaiting", vec![json!(0), page.clone()])
                .await?,
            "tellWaiting",
        )?);
        all.extend(records(
            self.rpc
                .call("aria2.tellStopped", vec![json!(0), page])
                .await?,
            "tellStopped",
        )?);
        debug!(count = all.len(), "Listed downloads");
        Ok(all)
    }

    /// Queues `url`, optionally into `dir` (relative to the download root)
    #[tracing::instrument(skip(self))]
    pub async fn add_download(&self, url: &str, dir: Option<&str>) -> Result<DownloadRecord> {
        let url = url.trim();
        validate_url(url)?;

        let mut options = Map::new();
        let dir = dir.map(|d| d.trim().trim_matches('/')).filter(|d| !d.is_empty());
        if let Some(dir) = dir {
            let target = self.guard.resolve(Some(dir))?;
            tokio::fs::create_dir_all(&target).await?;
            options.insert("dir".into(), json!(target.to_string_lossy()));
        }

        let reply = self
            .rpc
            .call("aria2.addUri", vec![json!([url]), Value::Object(options)])
            .await?;
        let gid = reply
            .as_str()
            .ok_or_else(|| GatewayError::Malformed(format!("addUri returned {reply}")))?
            .to_string();
        info!(%gid, "Added download: {}", url);

        match self.rpc.call("aria2.tellStatus", vec![json!(gid)]).await {
            Ok(status) => Ok(DownloadRecord::from_rpc_lossy(&status)),
            Err(e) => {
                warn!(%gid, error = %e, "Could not read back new download");
                Ok(DownloadRecord {
                    name: name_from_url(url).unwrap_or_else(|| "Unknown".to_string()),
                    status: DownloadStatus::Waiting,
                    total_length: 0,
                    completed_length: 0,
                    download_speed: 0,
                    gid,
                })
            }
        }
    }

    /// Looks a download up by scanning the listing; the daemon offers no
    /// lookup that distinguishes "unknown gid" from other faults.
    pub async fn find(&self, gid: &str) -> Result<DownloadRecord> {
        self.list_downloads()
            .await?
            .into_iter()
            .find(|record| record.gid == gid)
            .ok_or_else(|| GatewayError::NotFound(gid.to_string()))
    }

    async fn control(&self, operation: &'static str, method: &str, gid: &str) -> Result<()> {
        let reply = self.rpc.call(method, vec![json!(gid)]).await?;
        if !truthy(&reply) {
            return Err(GatewayError::OperationFailed {
                operation,
                gid: gid.to_string(),
            });
        }
        info!(%gid, "Download {operation} done");
        Ok(())
    }

    pub async fn pause(&self, gid: &str) -> Result<()> {
        let record = self.find(gid).await?;
        self.control("pause", "aria2.pause", &record.gid).await
    }

    pub async fn resume(&self, gid: &str) -> Result<()> {
        let record = self.find(gid).await?;
        self.control("resume", "aria2.unpause", &record.gid).await
    }

    /// Force-removes a queued download, or clears the result of a stopped one
    pub async fn remove(&self, gid: &str) -> Result<()> {
        let record = self.find(gid).await?;
        let method = if record.status.is_queued() {
            "aria2.forceRemove"
        } else {
            "aria2.removeDownloadResult"
        };
        self.control("remove", method, &record.gid).await
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let reply = fetch_global_stat(self.rpc.as_ref()).await?;
        GlobalStats::from_rpc(&reply).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    pub async fn version(&self) -> String {
        fetch_version(self.rpc.as_ref()).await
    }
}
