//! Synchronous call contract of the RPC layer
//!
//! The transaction engine only ever needs one thing from the transport:
//! send a request to an HTTP URL or a mesh topic and wait for the answer
//! within a timeout. [`RpcClient`] is that seam; [`HttpRpcClient`] is the
//! default implementation.

pub mod http;

pub use http::{HttpRpcClient, HttpRpcConfig};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Mesh coordinates of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshRoute {
    pub org: String,
    pub workspace: String,
    pub env: String,
    pub unit: String,
    pub node_id: String,
    pub instance_id: String,
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Http { url: String },
    Topic { route: MeshRoute, topic: String },
}

/// Body encoding of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// Opaque bytes, sent as-is.
    Text,
    #[default]
    Json,
}

impl Codec {
    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Text => "text/plain; charset=utf-8",
            Codec::Json => "application/json",
        }
    }
}

/// One synchronous call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub target: CallTarget,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub codec: Codec,
}

impl RpcRequest {
    pub fn new(target: CallTarget, body: Vec<u8>) -> Self {
        Self {
            target,
            body,
            headers: HashMap::new(),
            timeout: Duration::from_secs(10),
            max_retries: 0,
            codec: Codec::Json,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Response metadata and body.
#[derive(Debug, Clone, Default)]
pub struct RpcResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RpcResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_slice(&self.body).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// Transport failures
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Response decode error: {0}")]
    Decode(String),
}

impl RpcError {
    /// Errors a retry cannot fix.
    pub fn is_permanent(&self) -> bool {
        match self {
            RpcError::Timeout(_) | RpcError::Decode(_) => true,
            RpcError::Status { status, .. } => (400..500).contains(status),
            RpcError::Network(_) => false,
        }
    }
}

/// Synchronous call over the RPC layer.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn sync_call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;
}
