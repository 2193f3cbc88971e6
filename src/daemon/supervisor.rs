//! Lifecycle of the external aria2c process

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::rpc::RpcEndpoint;
use crate::config::DaemonConfig;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to start aria2c: {0}")]
    SpawnFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result of terminating stray daemon instances
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    AlreadyAbsent,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    pub state: DaemonState,
    pub endpoint: RpcEndpoint,
}

/// Longest process name the kernel keeps (Linux `comm`)
const PROCESS_NAME_LEN: usize = 15;

/// Name the daemon runs under: the binary's file name, cut to what the
/// kernel reports.
fn process_name(bin: &str) -> String {
    let name = Path::new(bin)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| bin.to_string());
    name.chars().take(PROCESS_NAME_LEN).collect()
}

/// `pkill -x <name>`: exit 0 when something matched, 1 when nothing did.
///
/// Only the process name is matched, never the command line, so the server
/// and shells that merely mention the binary are left alone.
fn pkill(name: &str) -> KillOutcome {
    let own_name = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| process_name(&n.to_string_lossy())));
    if own_name.as_deref() == Some(name) {
        return KillOutcome::Failed(format!("refusing to kill {name}, it names this process"));
    }

    match std::process::Command::new("pkill")
        .args(["-x", name])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => match output.status.code() {
            Some(0) => KillOutcome::Killed,
            Some(1) => KillOutcome::AlreadyAbsent,
            _ => KillOutcome::Failed(format!(
                "pkill exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        },
        Err(e) => KillOutcome::Failed(e.to_string()),
    }
}

fn log_kill(outcome: &KillOutcome) {
    match outcome {
        KillOutcome::Killed => info!("Terminated existing aria2c processes"),
        KillOutcome::AlreadyAbsent => info!("No aria2c process running"),
        KillOutcome::Failed(reason) => warn!("Could not terminate aria2c: {}", reason),
    }
}

/// Starts and stops the daemon. One per process.
pub struct DaemonSupervisor {
    config: DaemonConfig,
    download_dir: PathBuf,
    handle: Mutex<DaemonHandle>,
    stopped: AtomicBool,
}

impl DaemonSupervisor {
    pub fn new(config: DaemonConfig, download_dir: impl AsRef<Path>) -> Self {
        let endpoint = RpcEndpoint {
            host: config.rpc_host.clone(),
            port: config.rpc_port,
            secret: config.rpc_secret.clone(),
        };
        Self {
            config,
            download_dir: download_dir.as_ref().to_path_buf(),
            handle: Mutex::new(DaemonHandle {
                state: DaemonState::Stopped,
                endpoint,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: DaemonState) {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    /// Command line handed to aria2c
    pub fn args(&self) -> Vec<String> {
        let dir = self.download_dir.display();
        let mut args = vec![
            "--enable-rpc".to_string(),
            "--rpc-listen-all".to_string(),
            "--rpc-allow-origin-all".to_string(),
            format!("--rpc-listen-port={}", self.config.rpc_port),
            format!("--rpc-secret={}", self.config.rpc_secret),
            format!("--dir={dir}"),
            format!(
                "--max-concurrent-downloads={}",
                self.config.max_concurrent_downloads
            ),
            "--max-connection-per-server=4".to_string(),
            "--min-split-size=1M".to_string(),
            "--split=4".to_string(),
            "--continue=true".to_string(),
            "--file-allocation=none".to_string(),
            "--check-integrity=true".to_string(),
            "--daemon=true".to_string(),
            "--log-level=info".to_string(),
            format!("--log={}", self.download_dir.join("aria2.log").display()),
        ];
        if let Some(limit) = self.config.speed_limit() {
            args.push(format!("--max-overall-download-limit={limit}"));
        }
        args
    }

    /// Terminates any aria2c left over from a previous run. Never fatal.
    pub async fn kill_stray(&self) -> KillOutcome {
        let name = process_name(&self.config.aria2_bin);
        let outcome = tokio::task::spawn_blocking(move || pkill(&name))
            .await
            .unwrap_or_else(|e| KillOutcome::Failed(e.to_string()));
        log_kill(&outcome);
        outcome
    }

    /// Launches the daemon and waits for it to settle.
    ///
    /// aria2c forks into the background with `--daemon=true`; the exit
    /// status awaited here is that of the parent, which reports whether the
    /// daemon came up.
    pub async fn start(&self) -> Result<DaemonHandle, DaemonError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        self.kill_stray().await;

        info!(bin = %self.config.aria2_bin, "Starting aria2c daemon");
        let output = Command::new(&self.config.aria2_bin)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to start aria2c: {}", e);
                DaemonError::SpawnFailed(format!("{}: {}", self.config.aria2_bin, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(status = %output.status, "Failed to start aria2c: {}", stderr);
            return Err(DaemonError::SpawnFailed(format!(
                "{} exited with {}: {}",
                self.config.aria2_bin, output.status, stderr
            )));
        }

        tokio::time::sleep(self.config.settle_delay()).await;
        self.set_state(DaemonState::Running);
        info!("aria2c daemon started successfully");
        Ok(self.handle())
    }

    /// Best-effort termination, performed at most once per supervisor.
    ///
    /// Synchronous so it can run from a panic hook or a `Drop`. Returns
    /// whether this call did the work.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Stopping aria2c daemon");
        log_kill(&pkill(&process_name(&self.config.aria2_bin)));
        self.set_state(DaemonState::Stopped);
        true
    }
}

/// Stops the daemon when dropped
pub struct StopGuard(pub std::sync::Arc<DaemonSupervisor>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.stop();
    }
}
