//! HTTP endpoint the coordinator calls for Confirm and Cancel.
//!
//! Serves the confirm and cancel paths advertised in this deployment's
//! participant address. Each request body is the same length-prefixed
//! envelope used for Begin/Join: a `txnCallbackRequest` header naming the
//! branch, followed by the Try parameters.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use mesh_span::headers::{decode_snapshot, extract};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::config::ConfigHandle;
use crate::envelope;
use crate::error::{Result, TxnError};
use crate::invoker::{CallerMetadata, MethodInvoker, ParamBlob, Phase};
use crate::protocol::{CallbackRequest, CallbackResponse, RequestEnvelope, CALLBACK_SERVICE};
use crate::rpc::http::{
    MESH_ENV, MESH_INSTANCE_ID, MESH_NODE_ID, MESH_ORG, MESH_TOPIC, MESH_UNIT, MESH_WORKSPACE,
};

const TOPIC_ATTRIBUTES: [&str; 7] = [
    MESH_ORG,
    MESH_WORKSPACE,
    MESH_ENV,
    MESH_UNIT,
    MESH_NODE_ID,
    MESH_INSTANCE_ID,
    MESH_TOPIC,
];

/// Shared state of the callback endpoint
#[derive(Clone)]
pub struct CallbackState {
    pub invoker: MethodInvoker,
    pub config: ConfigHandle,
}

impl CallbackState {
    pub fn new(invoker: MethodInvoker, config: ConfigHandle) -> Self {
        Self { invoker, config }
    }
}

/// Create the router. Paths come from the current configuration.
pub fn router(state: CallbackState) -> Result<Router> {
    let config = state.config.current();
    for path in [&config.confirm_path, &config.cancel_path] {
        if !path.starts_with('/') {
            return Err(TxnError::Config(format!("callback path must start with '/': {:?}", path)));
        }
    }
    if config.confirm_path == config.cancel_path || config.confirm_path == "/health" {
        return Err(TxnError::Config(format!(
            "callback paths must be distinct: confirm {:?}, cancel {:?}",
            config.confirm_path, config.cancel_path
        )));
    }

    Ok(Router::new()
        .route("/health", get(health_check))
        .route(&config.confirm_path, post(confirm))
        .route(&config.cancel_path, post(cancel))
        .with_state(state))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub services: Vec<String>,
}

async fn health_check(State(state): State<CallbackState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        services: state.invoker.registry().services(),
    })
}

async fn confirm(State(state): State<CallbackState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Phase::Confirm, &headers, &body).await
}

async fn cancel(State(state): State<CallbackState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    dispatch(&state, Phase::Cancel, &headers, &body).await
}

async fn dispatch(
    state: &CallbackState,
    phase: Phase,
    headers: &HeaderMap,
    body: &[u8],
) -> (StatusCode, Json<CallbackResponse>) {
    match handle(state, phase, headers, body).await {
        Ok(()) => (StatusCode::OK, Json(CallbackResponse::ok())),
        Err(e) => {
            let status = match &e {
                TxnError::NotRegistered { .. } => StatusCode::NOT_FOUND,
                TxnError::Decode(_) | TxnError::Codec(_) | TxnError::Structural(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(phase = %phase, error = %e, status = status.as_u16(), "Callback failed");
            (status, Json(CallbackResponse::from(&e)))
        }
    }
}

async fn handle(state: &CallbackState, phase: Phase, headers: &HeaderMap, body: &[u8]) -> Result<()> {
    let config = state.config.current();
    let (envelope, tail): (RequestEnvelope<CallbackRequest>, &[u8]) = envelope::decode(body)?;
    if envelope.head.service != CALLBACK_SERVICE {
        return Err(TxnError::decode(format!(
            "unexpected envelope service {:?}",
            envelope.head.service
        )));
    }
    let request = envelope.request;

    let mut ctx = extract(headers, config.default_timeout_budget())
        .map_err(|e| TxnError::decode(e.to_string()))?;
    ctx.txn.root_xid = request.root_xid;
    ctx.txn.parent_xid = request.parent_xid;
    ctx.txn.branch_xid = request.branch_xid;
    let snapshot = decode_snapshot(&request.headers).map_err(|e| TxnError::decode(e.to_string()))?;
    ctx.request_headers.extend(snapshot);

    let params = ParamBlob::from_bytes(tail)?;
    let topic_attributes: HashMap<String, String> = TOPIC_ATTRIBUTES
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    let caller = CallerMetadata {
        language: config.language.clone(),
        remote_call: true,
        request_headers: ctx.request_headers.clone(),
        topic_attributes,
        service_config: config
            .services
            .get(&request.service_name)
            .cloned()
            .unwrap_or(Value::Null),
    };

    tracing::info!(
        service = %request.service_name,
        phase = %phase,
        root_xid = %ctx.txn.root_xid,
        branch_xid = %ctx.txn.branch_xid,
        "Dispatching callback"
    );
    state
        .invoker
        .invoke_phase(&request.service_name, phase, &mut ctx, &caller, &params)
        .await
}
