//! In-memory stand-in for aria2c, answering the subset of calls the gateway makes

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use super::rpc::{RpcError, RpcTransport};

#[derive(Default)]
pub struct FakeDaemon {
    downloads: Mutex<Vec<Value>>,
    calls: Mutex<Vec<(String, Vec<Value>)>>,
    missing: Mutex<HashSet<String>>,
    refused: Mutex<HashSet<String>>,
    failing_probes: AtomicUsize,
    down: AtomicBool,
    next_gid: AtomicU64,
}

impl FakeDaemon {
    /// Status struct the way aria2 reports it
    pub fn download(gid: &str, status: &str, uri: &str) -> Value {
        json!({
            "gid": gid,
            "status": status,
            "totalLength": "1000",
            "completedLength": "250",
            "downloadSpeed": "100",
            "files": [{ "path": "", "uris": [{ "uri": uri }] }]
        })
    }

    pub fn push_download(&self, download: Value) {
        self.downloads.lock().unwrap().push(download);
    }

    /// Makes `method` answer "No such method"
    pub fn remove_method(&self, method: &str) {
        self.missing.lock().unwrap().insert(method.to_string());
    }

    /// Makes `method` answer `null`
    pub fn refuse(&self, method: &str) {
        self.refused.lock().unwrap().insert(method.to_string());
    }

    pub fn fail_next_probes(&self, count: usize) {
        self.failing_probes.store(count, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == method)
            .count()
    }

    pub fn last_call(&self, method: &str) -> Option<(String, Vec<Value>)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _)| name == method)
            .cloned()
    }

    fn with_status(&self, statuses: &[&str]) -> Value {
        let downloads = self.downloads.lock().unwrap();
        Value::Array(
            downloads
                .iter()
                .filter(|d| statuses.contains(&d["status"].as_str().unwrap_or_default()))
                .cloned()
                .collect(),
        )
    }

    fn stats(&self) -> Value {
        let count = |statuses: &[&str]| {
            self.with_status(statuses)
                .as_array()
                .map_or(0, Vec::len)
                .to_string()
        };
        json!({
            "numActive": count(&["active"]),
            "numWaiting": count(&["waiting", "paused"]),
            "numStopped": count(&["complete", "error", "removed"]),
            "downloadSpeed": "0",
            "uploadSpeed": "0"
        })
    }

    fn set_status(&self, gid: &str, status: &str) -> Result<Value, RpcError> {
        let mut downloads = self.downloads.lock().unwrap();
        let download = downloads
            .iter_mut()
            .find(|d| d["gid"] == gid)
            .ok_or_else(|| not_found(gid))?;
        download["status"] = json!(status);
        Ok(json!(gid))
    }

    fn forget(&self, gid: &str) -> Result<Value, RpcError> {
        let mut downloads = self.downloads.lock().unwrap();
        let before = downloads.len();
        downloads.retain(|d| d["gid"] != gid);
        if downloads.len() == before {
            return Err(not_found(gid));
        }
        Ok(json!("OK"))
    }
}

fn not_found(gid: &str) -> RpcError {
    RpcError::Remote {
        code: 1,
        message: format!("GID {gid} is not found"),
    }
}

fn param_str(params: &[Value], index: usize) -> String {
    params
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl RpcTransport for FakeDaemon {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        if self.down.load(Ordering::SeqCst) {
            return Err(RpcError::Decode("connection refused".into()));
        }
        if self.missing.lock().unwrap().contains(method) {
            return Err(RpcError::Remote {
                code: 1,
                message: format!("No such method: {method}"),
            });
        }
        if self.refused.lock().unwrap().contains(method) {
            return Ok(Value::Null);
        }

        match method {
            "aria2.getGlobalStat" | "aria2.getGlobalStats" => {
                let pending = self.failing_probes.load(Ordering::SeqCst);
                if pending > 0 {
                    self.failing_probes.store(pending - 1, Ordering::SeqCst);
                    return Err(RpcError::Decode("daemon still starting".into()));
                }
                Ok(self.stats())
            }
            "system.multicall" => Ok(json!([[self.stats()]])),
            "aria2.getVersion" => Ok(json!({ "version": "1.37.0", "enabledFeatures": [] })),
            "aria2.tellActive" => Ok(self.with_status(&["active"])),
            "aria2.tellWaiting" => Ok(self.with_status(&["waiting", "paused"])),
            "aria2.tellStopped" => Ok(self.with_status(&["complete", "error", "removed"])),
            "aria2.tellStatus" => {
                let gid = param_str(&params, 0);
                let downloads = self.downloads.lock().unwrap();
                downloads
                    .iter()
                    .find(|d| d["gid"] == gid.as_str())
                    .cloned()
                    .ok_or_else(|| not_found(&gid))
            }
            "aria2.addUri" => {
                let uri = params
                    .first()
                    .and_then(|uris| uris.get(0))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let gid = format!("{:016x}", self.next_gid.fetch_add(1, Ordering::SeqCst) + 1);
                self.push_download(json!({
                    "gid": gid,
                    "status": "waiting",
                    "totalLength": "0",
                    "completedLength": "0",
                    "downloadSpeed": "0",
                    "files": [{ "path": "", "uris": [{ "uri": uri }] }]
                }));
                Ok(json!(gid))
            }
            "aria2.pause" => self.set_status(&param_str(&params, 0), "paused"),
            "aria2.unpause" => self.set_status(&param_str(&params, 0), "waiting"),
            "aria2.forceRemove" => self.set_status(&param_str(&params, 0), "removed"),
            "aria2.removeDownloadResult" => self.forget(&param_str(&params, 0)),
            _ => Err(RpcError::Remote {
                code: 1,
                message: format!("No such method: {method}"),
            }),
        }
    }
}
