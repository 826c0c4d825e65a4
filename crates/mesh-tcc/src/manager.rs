//! Begin / Join / End against the coordinator
//!
//! Every operation is exactly one call through the [`RpcClient`]. The call is
//! bounded by the chain's remaining timeout budget (see
//! [`TxnConfig::call_timeout`]), is refused outright once that budget is
//! spent, and charges its round trip back against the budget.

use mesh_span::headers::encode_snapshot;
use mesh_span::HandlerContext;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::address::{join_url, CoordinatorAddress, Operation, ParticipantAddress};
use crate::config::{ConfigHandle, TxnConfig};
use crate::descriptor::CompensableFlags;
use crate::envelope;
use crate::error::{Result, ServiceError, TxnError};
use crate::invoker::ParamBlob;
use crate::protocol::{
    now_ms, BeginData, BeginJoinRequest, CoordinatorResponse, EndData, EndRequest, JoinData,
    RequestEnvelope, BEGIN_SERVICE, END_SERVICE, JOIN_SERVICE, TRY_ERROR_CODE_HEADER,
    TRY_ERROR_MSG_HEADER,
};
use crate::rpc::{CallTarget, Codec, HttpRpcClient, HttpRpcConfig, RpcClient, RpcError, RpcRequest, RpcResponse};

/// The service taking part in a Begin or Join.
#[derive(Debug, Clone, Copy)]
pub struct Participant<'a> {
    pub service_name: &'a str,
    pub flags: CompensableFlags,
    pub params: &'a ParamBlob,
}

/// A parsed coordinator address plus whether calls to it go straight to the
/// co-located macro service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub address: CoordinatorAddress,
    pub direct_override: bool,
}

impl Route {
    /// Parse `raw` for the configured mode. The macro-service override
    /// applies when the coordinator instance is this process's own.
    pub fn resolve(config: &TxnConfig, raw: &str) -> Result<Self> {
        let address = CoordinatorAddress::parse(raw, config.comm_mode)?;
        let direct_override = config.macro_service
            && !config.local_instance_id.is_empty()
            && address.instance_id() == Some(config.local_instance_id.as_str());
        Ok(Self {
            address,
            direct_override,
        })
    }

    pub fn target(&self, config: &TxnConfig, operation: Operation) -> CallTarget {
        if self.direct_override {
            CallTarget::Http {
                url: join_url(&config.macro_service_base_url, self.address.endpoint(operation)),
            }
        } else {
            self.address.target(operation)
        }
    }
}

/// Client side of the coordinator protocol
pub struct TransactionManager {
    config: ConfigHandle,
    client: OnceLock<Arc<dyn RpcClient>>,
}

impl TransactionManager {
    /// Manager whose HTTP client is built on first use.
    pub fn new(config: impl Into<ConfigHandle>) -> Self {
        Self {
            config: config.into(),
            client: OnceLock::new(),
        }
    }

    /// Manager with an injected RPC client.
    pub fn with_client(config: impl Into<ConfigHandle>, client: Arc<dyn RpcClient>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(client);
        Self {
            config: config.into(),
            client: cell,
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The RPC client, built at most once even under concurrent first use.
    pub fn client(&self) -> Arc<dyn RpcClient> {
        self.client
            .get_or_init(|| {
                let config = self.config.current();
                tracing::debug!(gateway = %config.mesh_gateway_url, "Creating default RPC client");
                Arc::new(HttpRpcClient::new(HttpRpcConfig::from(config.as_ref())))
            })
            .clone()
    }

    /// Start a global transaction and make this hop its root.
    ///
    /// On success the context's RootXID and BranchXID both hold the
    /// coordinator-assigned ID and ParentXID holds the trace ID.
    pub async fn begin(
        &self,
        config: &TxnConfig,
        ctx: &mut HandlerContext,
        coordinator: &str,
        participant: Participant<'_>,
    ) -> Result<String> {
        let route = Route::resolve(config, coordinator)?;
        let request = BeginJoinRequest {
            participant_address: ParticipantAddress::build(config, participant.flags, route.direct_override)
                .encode(),
            request_time: now_ms(),
            parent_xid: ctx.span.trace_id.clone(),
            root_xid: ctx.span.span_id.clone(),
            branch_xid: ctx.span.span_id.clone(),
            service_name: participant.service_name.to_string(),
            headers: encode_snapshot(&ctx.request_headers),
        };
        let body = envelope::encode(
            &RequestEnvelope::new(BEGIN_SERVICE, request),
            &participant.params.to_bytes()?,
        )?;

        let target = route.target(config, Operation::Begin);
        let response = self
            .call(config, ctx, Operation::Begin, target, body, Codec::Text, HashMap::new())
            .await?;
        let data: BeginData = decode_data(&response, Operation::Begin)?;
        if data.root_xid.is_empty() {
            return Err(TxnError::codec("begin response carries an empty rootXid"));
        }

        ctx.txn.root_xid = data.root_xid.clone();
        ctx.txn.parent_xid = ctx.span.trace_id.clone();
        ctx.txn.branch_xid = data.root_xid.clone();
        ctx.txn.set_agent_address(coordinator);

        tracing::info!(
            service = participant.service_name,
            root_xid = %data.root_xid,
            proposed = %ctx.span.span_id,
            "Global transaction begun"
        );
        Ok(data.root_xid)
    }

    /// Register this hop as a branch of the context's global transaction.
    ///
    /// Only BranchXID changes; RootXID and ParentXID stay as received.
    pub async fn join(
        &self,
        config: &TxnConfig,
        ctx: &mut HandlerContext,
        coordinator: &str,
        participant: Participant<'_>,
    ) -> Result<String> {
        let route = Route::resolve(config, coordinator)?;
        let request = BeginJoinRequest {
            participant_address: ParticipantAddress::build(config, participant.flags, route.direct_override)
                .encode(),
            request_time: now_ms(),
            parent_xid: ctx.txn.parent_xid.clone(),
            root_xid: ctx.txn.root_xid.clone(),
            branch_xid: ctx.span.span_id.clone(),
            service_name: participant.service_name.to_string(),
            headers: encode_snapshot(&ctx.request_headers),
        };
        let body = envelope::encode(
            &RequestEnvelope::new(JOIN_SERVICE, request),
            &participant.params.to_bytes()?,
        )?;

        let target = route.target(config, Operation::Join);
        let response = self
            .call(config, ctx, Operation::Join, target, body, Codec::Text, HashMap::new())
            .await?;
        let data: JoinData = decode_data(&response, Operation::Join)?;
        if data.branch_xid.is_empty() {
            return Err(TxnError::codec("join response carries an empty branchXid"));
        }

        ctx.txn.branch_xid = data.branch_xid.clone();
        ctx.txn.set_agent_address(coordinator);

        tracing::info!(
            service = participant.service_name,
            root_xid = %ctx.txn.root_xid,
            branch_xid = %data.branch_xid,
            "Branch joined"
        );
        Ok(data.branch_xid)
    }

    /// Report the outcome of this hop's Try.
    ///
    /// `try_error` and `second_stage_headers` travel as request headers. A
    /// transport timeout is reported as [`TxnError::EndTimedOut`]; a non-zero
    /// coordinator code as [`TxnError::CoordinatorRejected`].
    pub async fn end(
        &self,
        config: &TxnConfig,
        ctx: &mut HandlerContext,
        coordinator: &str,
        ok: bool,
        try_error: Option<&ServiceError>,
        second_stage_headers: &HashMap<String, String>,
    ) -> Result<()> {
        let route = Route::resolve(config, coordinator)?;
        let request = EndRequest {
            root_xid: ctx.txn.root_xid.clone(),
            branch_xid: ctx.txn.branch_xid.clone(),
            parent_xid: ctx.txn.parent_xid.clone(),
            ok,
            request_time: now_ms(),
            try_failed_ignore_callback_cancel: config.try_failed_ignore_callback_cancel,
        };
        let body = serde_json::to_vec(&RequestEnvelope::new(END_SERVICE, request))?;

        let mut headers = second_stage_headers.clone();
        if let Some(err) = try_error {
            headers.insert(TRY_ERROR_CODE_HEADER.to_string(), err.code.to_string());
            headers.insert(TRY_ERROR_MSG_HEADER.to_string(), header_safe(&err.message));
        }

        let target = route.target(config, Operation::End);
        let response = match self
            .call(config, ctx, Operation::End, target, body, Codec::Json, headers)
            .await
        {
            Ok(response) => response,
            Err(TxnError::Rpc(RpcError::Timeout(msg))) => return Err(TxnError::EndTimedOut(msg)),
            Err(e) => return Err(e),
        };
        let reply: CoordinatorResponse<EndData> = response.json()?;
        reply.into_result()?;

        tracing::info!(
            root_xid = %ctx.txn.root_xid,
            branch_xid = %ctx.txn.branch_xid,
            ok = ok,
            "Transaction end reported"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn call(
        &self,
        config: &TxnConfig,
        ctx: &mut HandlerContext,
        operation: Operation,
        target: CallTarget,
        body: Vec<u8>,
        codec: Codec,
        headers: HashMap<String, String>,
    ) -> Result<RpcResponse> {
        if ctx.span.is_expired() {
            tracing::warn!(operation = operation.as_str(), "Timeout budget spent, not calling coordinator");
            return Err(TxnError::DeadlineExceeded {
                operation: operation.as_str(),
            });
        }

        let timeout = config.call_timeout(ctx.span.remaining());
        let request = RpcRequest::new(target, body)
            .with_timeout(timeout)
            .with_retries(config.rpc_max_retries)
            .with_codec(codec)
            .with_headers(headers);
        tracing::debug!(
            operation = operation.as_str(),
            timeout_ms = timeout.as_millis() as u64,
            budget_ms = ctx.span.timeout_budget_ms,
            "Calling coordinator"
        );

        let started = Instant::now();
        let outcome = self.client().sync_call(request).await;
        ctx.span.consume(started.elapsed());

        outcome.map_err(|e| {
            tracing::warn!(operation = operation.as_str(), error = %e, "Coordinator call failed");
            TxnError::from(e)
        })
    }
}

/// Decode a Begin/Join reply, turning a rejection into an error.
fn decode_data<T: serde::de::DeserializeOwned>(response: &RpcResponse, operation: Operation) -> Result<T> {
    let reply: CoordinatorResponse<T> = response.json()?;
    reply
        .into_result()?
        .ok_or_else(|| TxnError::codec(format!("{} response carries no data", operation.as_str())))
}

/// Header values cannot carry line breaks.
fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommMode;

    const MESH: &str = "acme|ws|dev|su1|dxc|inst-1|TXN_BEGIN|TXN_JOIN|TXN_END";

    #[test]
    fn test_route_without_override() {
        let config = TxnConfig::builder().comm_mode(CommMode::Mesh).build();
        let route = Route::resolve(&config, MESH).unwrap();

        assert!(!route.direct_override);
        assert!(matches!(route.target(&config, Operation::Begin), CallTarget::Topic { .. }));
    }

    #[test]
    fn test_macro_service_override() {
        let config = TxnConfig::builder()
            .comm_mode(CommMode::Mesh)
            .macro_service("http://127.0.0.1:9000/", "inst-1")
            .build();
        let route = Route::resolve(&config, MESH).unwrap();

        assert!(route.direct_override);
        assert_eq!(
            route.target(&config, Operation::End),
            CallTarget::Http {
                url: "http://127.0.0.1:9000/TXN_END".into()
            }
        );
    }

    #[test]
    fn test_macro_service_other_instance() {
        let config = TxnConfig::builder()
            .comm_mode(CommMode::Mesh)
            .macro_service("http://127.0.0.1:9000", "inst-2")
            .build();
        assert!(!Route::resolve(&config, MESH).unwrap().direct_override);
    }

    #[test]
    fn test_header_safe() {
        assert_eq!(header_safe("out of\r\nstock"), "out of  stock");
    }

    #[tokio::test]
    async fn test_bad_address_fails_before_any_call() {
        let config = TxnConfig::default();
        let manager = TransactionManager::new(config.clone());
        let mut ctx = HandlerContext::new_root(config.default_timeout_budget());
        let params = ParamBlob::default();

        let err = manager
            .begin(
                &config,
                &mut ctx,
                "http://dxc|/begin",
                Participant {
                    service_name: "orders",
                    flags: CompensableFlags::BOTH,
                    params: &params,
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_structural());
        assert!(ctx.txn.is_root());
    }

    #[tokio::test]
    async fn test_expired_budget_fails_fast() {
        let config = TxnConfig::default();
        let manager = TransactionManager::new(config.clone());
        let mut ctx = HandlerContext::new_root(std::time::Duration::ZERO);

        let err = manager
            .end(&config, &mut ctx, "http://dxc|/begin|/join|/end", true, None, &HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TxnError::DeadlineExceeded { operation: "end" }));
    }
}
