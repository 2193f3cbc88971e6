//! The aria2c daemon: process supervision and the typed RPC client over it.

#[cfg(test)]
pub mod fake;
pub mod gateway;
pub mod models;
pub mod rpc;
pub mod supervisor;

pub use gateway::{ConnectPolicy, DownloadGateway, GatewayError, ValidationError};
pub use models::DownloadSummary;
pub use rpc::JsonRpcClient;
pub use supervisor::{DaemonSupervisor, StopGuard};
