//! JSON-RPC transport to the aria2c daemon
//!
//! The gateway only sees [`RpcTransport`]; [`JsonRpcClient`] is the HTTP
//! implementation used in production and tests swap in an in-memory fake.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Decode(String),

    #[error("Invalid RPC endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

impl RpcError {
    /// Whether the daemon answered that it has no such method
    pub fn is_method_not_found(&self) -> bool {
        match self {
            // aria2 answers -32601 for unknown methods, older builds use 1
            RpcError::Remote { code, message } => {
                *code == -32601 || message.contains("No such method")
            }
            _ => false,
        }
    }
}

/// Where the daemon listens for RPC and the secret it expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
    pub secret: String,
}

impl RpcEndpoint {
    pub fn url(&self) -> Result<Url, RpcError> {
        Ok(Url::parse(&format!("http://{}:{}/jsonrpc", self.host, self.port))?)
    }
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Invokes `method` with `params`, returning the `result` member
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;
}

#[derive(Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

pub struct JsonRpcClient {
    client: Client,
    url: Url,
    token: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Every request made through this client is bounded by `timeout`
    pub fn new(endpoint: &RpcEndpoint, timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: endpoint.url()?,
            token: format!("token:{}", endpoint.secret),
            next_id: AtomicU64::new(1),
        })
    }

    /// Prepends the secret token. `system.multicall` takes none itself, so
    /// each call it wraps gets one instead.
    fn authenticate(&self, method: &str, mut params: Vec<Value>) -> Vec<Value> {
        if method == "system.multicall" {
            if let Some(Value::Array(calls)) = params.first_mut() {
                for call in calls.iter_mut() {
                    if let Some(Value::Array(inner)) = call.get_mut("params") {
                        inner.insert(0, Value::String(self.token.clone()));
                    }
                }
            }
            params
        } else if method.starts_with("system.") {
            params
        } else {
            params.insert(0, Value::String(self.token.clone()));
            params
        }
    }
}

#[async_trait]
impl RpcTransport for JsonRpcClient {
    #[tracing::instrument(level = "trace", skip(self, params))]
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": self.authenticate(method, params),
        });

        let response = self.client.post(self.url.clone()).json(&body).send().await?;
        let status = response.status();
        let reply: RpcReply = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(format!("{status}: {e}")))?;

        if let Some(fault) = reply.error {
            tracing::debug!(method, code = fault.code, message = %fault.message, "RPC fault");
            return Err(RpcError::Remote {
                code: fault.code,
                message: fault.message,
            });
        }
        reply
            .result
            .ok_or_else(|| RpcError::Decode("reply carries neither result nor error".into()))
    }
}
