//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use mesh_span::{HandlerContext, SpanContext, TransactionContext};
use mesh_tcc::rpc::{Codec, RpcClient, RpcError, RpcRequest, RpcResponse};
use mesh_tcc::{
    CallerMetadata, Compensable, CompensableDescriptor, CompensableRegistry, ServiceError,
    TransactionManager, TransactionProxy, TxnConfig,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const COORDINATOR: &str = "http://dxc:9000|/v1/begin|/v1/join|/v1/end";
pub const STOCK: &str = "reserve-stock";
pub const GATEWAY: &str = "edge-gateway";

/// In-memory RPC client answering from a script and recording every request.
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<RpcResponse, RpcError>>>,
    requests: Mutex<Vec<RpcRequest>>,
    delay: Duration,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn reply(&self, body: Value) {
        let body = serde_json::to_vec(&body).unwrap();
        self.replies.lock().unwrap().push_back(Ok(RpcResponse::new(200, body)));
    }

    pub fn fail(&self, err: RpcError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<RpcRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `head.service` of every request, in order.
    pub fn services(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| envelope_header(r)["head"]["service"].as_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl RpcClient for ScriptedClient {
    async fn sync_call(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        self.requests.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(RpcError::Network("no scripted reply".into())))
    }
}

/// JSON header of a recorded request, whichever way it was encoded.
pub fn envelope_header(request: &RpcRequest) -> Value {
    match request.codec {
        Codec::Text => mesh_tcc::envelope::decode::<Value>(&request.body).unwrap().0,
        Codec::Json => serde_json::from_slice(&request.body).unwrap(),
    }
}

pub fn begin_ok(root_xid: &str) -> Value {
    json!({"errorCode": 0, "errorMsg": "", "data": {"rootXid": root_xid, "responseTime": 1}})
}

pub fn join_ok(branch_xid: &str) -> Value {
    json!({"errorCode": 0, "errorMsg": "", "data": {"branchXid": branch_xid, "responseTime": 1}})
}

pub fn end_ok() -> Value {
    json!({"errorCode": 0, "errorMsg": "", "data": {"responseTime": 1}})
}

pub fn rejected(code: i64, message: &str) -> Value {
    json!({"errorCode": code, "errorMsg": message})
}

/// Stock reservation used across tests.
#[derive(Clone, Default)]
pub struct Stock {
    pub fail_with: Option<ServiceError>,
    pub mark_error: bool,
    /// Time Try spends on its own work.
    pub delay: Duration,
    pub tries: Arc<AtomicUsize>,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub bound: Option<CallerMetadata>,
}

impl Stock {
    pub fn failing(code: i64, message: &str) -> Self {
        Self {
            fail_with: Some(ServiceError::new(code, message)),
            ..Default::default()
        }
    }

    pub fn tries(&self) -> usize {
        self.tries.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn record(&self, phase: &str, ctx: &HandlerContext, sku: &str, quantity: u32) {
        let bound = self.bound.as_ref();
        self.journal.lock().unwrap().push(format!(
            "{} {} {} branch={} lang={} warehouse={}",
            phase,
            sku,
            quantity,
            ctx.txn.branch_xid,
            bound.map(|b| b.language.as_str()).unwrap_or("-"),
            bound
                .and_then(|b| b.service_config["warehouse"].as_str())
                .unwrap_or("-"),
        ));
    }
}

#[async_trait]
impl Compensable for Stock {
    type Params = (String, u32);
    type Output = u32;

    fn bind(&mut self, caller: &CallerMetadata) {
        self.bound = Some(caller.clone());
    }

    async fn try_phase(&self, ctx: &mut HandlerContext, params: (String, u32)) -> Result<u32, ServiceError> {
        self.tries.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        ctx.response_headers.insert("x-txn-2s-lot".into(), format!("lot-{}", params.0));
        ctx.response_headers.insert("content-type".into(), "application/json".into());
        if self.mark_error {
            ctx.response_headers.insert("x-txn-marked-error".into(), "1".into());
        }
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(params.1),
        }
    }

    async fn confirm(&self, ctx: &mut HandlerContext, params: (String, u32)) -> Result<(), ServiceError> {
        self.record("confirm", ctx, &params.0, params.1);
        Ok(())
    }

    async fn cancel(&self, ctx: &mut HandlerContext, params: (String, u32)) -> Result<(), ServiceError> {
        self.record("cancel", ctx, &params.0, params.1);
        if params.1 == 0 {
            return Err(ServiceError::new(4100, "nothing to release"));
        }
        Ok(())
    }
}

pub fn config() -> TxnConfig {
    TxnConfig::builder().coordinator_address(COORDINATOR).build()
}

/// Registry with `reserve-stock` (confirm + cancel) and a propagating
/// gateway. Confirm/Cancel instances share `journal`.
pub fn registry(journal: Arc<Mutex<Vec<String>>>) -> Arc<CompensableRegistry> {
    let registry = Arc::new(CompensableRegistry::new());
    registry
        .register(
            CompensableDescriptor::new(STOCK, "TryReserve")
                .with_confirm("ConfirmReserve")
                .with_cancel("CancelReserve"),
            move || Stock {
                journal: journal.clone(),
                ..Default::default()
            },
        )
        .unwrap();
    registry
        .register(
            CompensableDescriptor::new(GATEWAY, "Forward").propagator(),
            Stock::default,
        )
        .unwrap();
    registry
}

pub fn proxy(config: TxnConfig, client: Arc<ScriptedClient>) -> TransactionProxy {
    let manager = Arc::new(TransactionManager::with_client(config, client));
    TransactionProxy::new(registry(Arc::default()), manager)
}

/// Context of a request arriving with no transaction.
pub fn root_ctx() -> HandlerContext {
    HandlerContext::new_root(Duration::from_secs(5))
}

/// Context of a request arriving inside transaction `root_xid` from a caller
/// whose branch is `parent_xid`.
pub fn branch_ctx(root_xid: &str, parent_xid: &str) -> HandlerContext {
    let caller = SpanContext::new_root(Duration::from_secs(5));
    HandlerContext::new(
        caller.child(),
        TransactionContext {
            root_xid: root_xid.into(),
            parent_xid: parent_xid.into(),
            branch_xid: parent_xid.into(),
            agent_address: COORDINATOR.into(),
            ..Default::default()
        },
    )
}
