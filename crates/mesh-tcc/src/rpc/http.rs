//! HTTP implementation of the RPC contract
//!
//! HTTP targets are posted to directly. Topic targets are posted to the mesh
//! gateway, which routes on the coordinates carried in `x-mesh-*` headers.
//! Transient failures are retried with exponential backoff up to the count
//! the caller asked for; timeouts and 4xx answers are never retried. The
//! request timeout covers every attempt together.

use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use super::{CallTarget, RpcClient, RpcError, RpcRequest, RpcResponse};
use crate::config::TxnConfig;

pub const MESH_ORG: &str = "x-mesh-org";
pub const MESH_WORKSPACE: &str = "x-mesh-workspace";
pub const MESH_ENV: &str = "x-mesh-env";
pub const MESH_UNIT: &str = "x-mesh-unit";
pub const MESH_NODE_ID: &str = "x-mesh-node-id";
pub const MESH_INSTANCE_ID: &str = "x-mesh-instance-id";
pub const MESH_TOPIC: &str = "x-mesh-topic";

/// Configuration for the HTTP RPC client
#[derive(Debug, Clone)]
pub struct HttpRpcConfig {
    /// Gateway for topic-addressed calls
    pub mesh_gateway_url: String,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for HttpRpcConfig {
    fn default() -> Self {
        Self {
            mesh_gateway_url: "http://localhost:18080".to_string(),
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&TxnConfig> for HttpRpcConfig {
    fn from(config: &TxnConfig) -> Self {
        Self {
            mesh_gateway_url: config.mesh_gateway_url.clone(),
            ..Default::default()
        }
    }
}

/// reqwest-backed [`RpcClient`]
pub struct HttpRpcClient {
    client: Client,
    config: HttpRpcConfig,
}

impl HttpRpcClient {
    pub fn new(config: HttpRpcConfig) -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });

        Self { client, config }
    }

    /// URL a target resolves to.
    pub fn url_for(&self, target: &CallTarget) -> String {
        match target {
            CallTarget::Http { url } => url.clone(),
            CallTarget::Topic { topic, .. } => format!(
                "{}/v1/topics/{}",
                self.config.mesh_gateway_url.trim_end_matches('/'),
                topic
            ),
        }
    }

    async fn send_once(&self, request: &RpcRequest, timeout: Duration) -> Result<RpcResponse, RpcError> {
        let mut builder = self
            .client
            .post(self.url_for(&request.target))
            .timeout(timeout)
            .header("Content-Type", request.codec.content_type())
            .body(request.body.clone());

        if let CallTarget::Topic { route, topic } = &request.target {
            builder = builder
                .header(MESH_ORG, &route.org)
                .header(MESH_WORKSPACE, &route.workspace)
                .header(MESH_ENV, &route.env)
                .header(MESH_UNIT, &route.unit)
                .header(MESH_NODE_ID, &route.node_id)
                .header(MESH_INSTANCE_ID, &route.instance_id)
                .header(MESH_TOPIC, topic);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        if status.is_success() {
            Ok(RpcResponse {
                status: status.as_u16(),
                headers,
                body,
            })
        } else {
            Err(RpcError::Status {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

impl Default for HttpRpcClient {
    fn default() -> Self {
        Self::new(HttpRpcConfig::default())
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn sync_call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let started = Instant::now();
        let mut last_error = None;
        let mut backoff_ms = self.config.initial_backoff_ms;

        // request.timeout bounds the whole call, retries and backoff included
        for attempt in 0..=request.max_retries {
            if attempt > 0 {
                let left = request.timeout.saturating_sub(started.elapsed());
                let pause = Duration::from_millis(backoff_ms).min(left);
                tracing::debug!(attempt = attempt, backoff_ms = pause.as_millis() as u64, "Retrying RPC call");
                sleep(pause).await;
                backoff_ms = (backoff_ms as f64 * self.config.backoff_multiplier) as u64;
                backoff_ms = backoff_ms.min(self.config.max_backoff_ms);
            }

            let left = request.timeout.saturating_sub(started.elapsed());
            if left.is_zero() {
                last_error = Some(RpcError::Timeout(format!(
                    "call timeout of {}ms spent after {} attempt(s)",
                    request.timeout.as_millis(),
                    attempt
                )));
                break;
            }

            match self.send_once(&request, left).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(attempt = attempt, error = %e, "RPC call failed");
                    let permanent = e.is_permanent();
                    last_error = Some(e);
                    if permanent {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::Network("no attempt made".to_string())))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RpcError {
    if err.is_timeout() {
        RpcError::Timeout(err.to_string())
    } else if err.is_decode() {
        RpcError::Decode(err.to_string())
    } else {
        RpcError::Network(err.to_string())
    }
}
