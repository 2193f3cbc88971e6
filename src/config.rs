//! Config module for harvester

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct ServerConfig {
    #[clap(long, env = "HARVEST_HOST", default_value = "0.0.0.0:5000")]
    pub host: String,

    /// Root directory for downloads; every file operation is confined to it
    #[clap(long, env = "HARVEST_DOWNLOAD_DIR", default_value = "/var/downloads")]
    pub download_dir: PathBuf,

    /// Directory for the application log file, in addition to stdout
    #[clap(long, env = "HARVEST_LOG_DIR", default_value = "/var/log/dataset-harvester")]
    pub log_dir: PathBuf,

    /// HTML page served on `/`
    #[clap(
        long,
        env = "HARVEST_UI_PATH",
        default_value = "/opt/dataset-harvester/index.html"
    )]
    pub ui_path: PathBuf,

    /// Maximum number of requests handled at once
    #[clap(long, env = "HARVEST_MAX_IN_FLIGHT", default_value_t = 64)]
    pub max_in_flight: usize,

    /// Abort startup when the daemon cannot be started or reached
    #[clap(long, env = "HARVEST_REQUIRE_DAEMON", default_value_t = true, action = clap::ArgAction::Set)]
    pub require_daemon: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonConfig {
    /// aria2c binary, looked up in PATH unless absolute
    #[clap(long, env = "HARVEST_ARIA2_BIN", default_value = "aria2c")]
    pub aria2_bin: String,

    #[clap(long, env = "HARVEST_RPC_HOST", default_value = "localhost")]
    pub rpc_host: String,

    #[clap(long, env = "HARVEST_RPC_PORT", default_value_t = 6800)]
    pub rpc_port: u16,

    #[clap(long, env = "HARVEST_RPC_SECRET", default_value = "harvester2024")]
    pub rpc_secret: String,

    /// Upper bound for a single RPC round trip
    #[clap(long, env = "HARVEST_RPC_TIMEOUT_SECS", default_value_t = 10)]
    pub rpc_timeout_secs: u64,

    #[clap(long, env = "HARVEST_MAX_CONCURRENT_DOWNLOADS", default_value_t = 10)]
    pub max_concurrent_downloads: u32,

    /// Overall download limit passed to aria2c (`0` = unlimited), e.g. `5M`
    #[clap(long, env = "HARVEST_MAX_DOWNLOAD_SPEED", default_value = "0")]
    pub max_download_speed: String,

    /// Time given to the daemon to come up after it forks
    #[clap(long, env = "HARVEST_SETTLE_SECS", default_value_t = 3)]
    pub settle_secs: u64,

    #[clap(long, env = "HARVEST_CONNECT_ATTEMPTS", default_value_t = 5)]
    pub connect_attempts: u32,

    #[clap(long, env = "HARVEST_CONNECT_BACKOFF_SECS", default_value_t = 2)]
    pub connect_backoff_secs: u64,
}

impl DaemonConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_secs(self.connect_backoff_secs)
    }

    /// Speed limit to pass on, if any
    pub fn speed_limit(&self) -> Option<&str> {
        let limit = self.max_download_speed.trim();
        (!limit.is_empty() && limit != "0").then_some(limit)
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "harvester", version, about)]
pub struct Config {
    #[clap(flatten)]
    pub server: ServerConfig,

    #[clap(flatten)]
    pub daemon: DaemonConfig,
}

pub fn config() -> Config {
    Config::parse()
}
