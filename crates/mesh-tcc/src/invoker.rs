//! Try/Confirm/Cancel dispatch
//!
//! Try runs on the caller's own service value with typed parameters. Confirm
//! and Cancel arrive later, from the coordinator, with only the serialized
//! Try parameters: they run on a fresh instance built by the registered
//! factory, bound to the caller's metadata, with every parameter decoded
//! before the method is entered.

use async_trait::async_trait;
use mesh_span::HandlerContext;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, ServiceError, TxnError};
use crate::registry::CompensableRegistry;

/// Stage of a compensable service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Try,
    Confirm,
    Cancel,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Try => "try",
            Phase::Confirm => "confirm",
            Phase::Cancel => "cancel",
        })
    }
}

/// What a freshly built instance learns about who is calling it.
#[derive(Debug, Clone, Default)]
pub struct CallerMetadata {
    pub language: String,
    /// Whether the instance may issue remote calls of its own.
    pub remote_call: bool,
    pub request_headers: HashMap<String, String>,
    pub topic_attributes: HashMap<String, String>,
    /// Entry for the service under `services` in the configuration.
    pub service_config: Value,
}

/// A service taking part in TCC transactions.
///
/// `Params` is the full argument list as a tuple, `(T,)` for a single
/// argument. It is passed typed to
/// Try and serialized for the coordinator so the same arguments can be
/// replayed into Confirm or Cancel.
#[async_trait]
pub trait Compensable: Send + Sync + 'static {
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Output: Send + 'static;

    /// Receive caller metadata before a Confirm or Cancel call.
    fn bind(&mut self, _caller: &CallerMetadata) {}

    async fn try_phase(
        &self,
        ctx: &mut HandlerContext,
        params: Self::Params,
    ) -> std::result::Result<Self::Output, ServiceError>;

    async fn confirm(
        &self,
        _ctx: &mut HandlerContext,
        _params: Self::Params,
    ) -> std::result::Result<(), ServiceError> {
        Ok(())
    }

    async fn cancel(
        &self,
        _ctx: &mut HandlerContext,
        _params: Self::Params,
    ) -> std::result::Result<(), ServiceError> {
        Ok(())
    }
}

/// Try parameters as an ordered list of JSON-encoded values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamBlob(pub Vec<String>);

impl ParamBlob {
    /// Split `params` into one entry per argument. The argument list must
    /// serialize as a sequence (a tuple, even of one element); anything else
    /// is rejected so the list replays with the same arity.
    pub fn encode<P: Serialize>(params: &P) -> Result<Self> {
        match serde_json::to_value(params)? {
            Value::Array(items) => Ok(Self(items.iter().map(Value::to_string).collect())),
            other => Err(TxnError::codec(format!(
                "parameters must serialize as a sequence, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Decode every entry by position, then assemble the typed argument list.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        let mut values = Vec::with_capacity(self.0.len());
        for (position, raw) in self.0.iter().enumerate() {
            let value: Value = serde_json::from_str(raw)
                .map_err(|e| TxnError::decode(format!("parameter {}: {}", position, e)))?;
            values.push(value);
        }
        serde_json::from_value(Value::Array(values))
            .map_err(|e| TxnError::decode(format!("parameters: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wire form, the envelope tail.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
            .map(Self)
            .map_err(|e| TxnError::decode(format!("parameter list: {}", e)))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Type-erased Confirm or Cancel entry point.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn call(
        &self,
        ctx: &mut HandlerContext,
        caller: &CallerMetadata,
        params: &ParamBlob,
    ) -> Result<()>;
}

/// Builds a fresh service instance for each second-stage call.
pub type Factory<S> = Arc<dyn Fn() -> S + Send + Sync>;

pub(crate) struct TypedPhase<S: Compensable> {
    factory: Factory<S>,
    phase: Phase,
}

impl<S: Compensable> TypedPhase<S> {
    pub(crate) fn new(factory: Factory<S>, phase: Phase) -> Self {
        Self { factory, phase }
    }
}

#[async_trait]
impl<S: Compensable> PhaseHandler for TypedPhase<S> {
    async fn call(
        &self,
        ctx: &mut HandlerContext,
        caller: &CallerMetadata,
        params: &ParamBlob,
    ) -> Result<()> {
        let mut instance = (self.factory)();
        instance.bind(caller);
        let params: S::Params = params.decode()?;

        let outcome = match self.phase {
            Phase::Confirm => instance.confirm(ctx, params).await,
            Phase::Cancel => instance.cancel(ctx, params).await,
            Phase::Try => {
                return Err(TxnError::structural(
                    "try is invoked directly, not through a phase handler",
                ))
            }
        };
        outcome.map_err(TxnError::from)
    }
}

/// Dispatches business methods for the proxy and the callback endpoint.
#[derive(Clone)]
pub struct MethodInvoker {
    registry: Arc<CompensableRegistry>,
}

impl MethodInvoker {
    pub fn new(registry: Arc<CompensableRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CompensableRegistry> {
        &self.registry
    }

    /// Run Try on the caller's instance with typed parameters.
    pub async fn invoke_try<S: Compensable>(
        &self,
        service: &S,
        ctx: &mut HandlerContext,
        params: S::Params,
    ) -> std::result::Result<S::Output, ServiceError> {
        service.try_phase(ctx, params).await
    }

    /// Run Confirm or Cancel of a registered service from serialized
    /// parameters. Never retried here.
    pub async fn invoke_phase(
        &self,
        service_name: &str,
        phase: Phase,
        ctx: &mut HandlerContext,
        caller: &CallerMetadata,
        params: &ParamBlob,
    ) -> Result<()> {
        let handler = self.registry.handler(service_name, phase)?;
        tracing::debug!(
            service = service_name,
            phase = %phase,
            root_xid = %ctx.txn.root_xid,
            branch_xid = %ctx.txn.branch_xid,
            "Invoking second-stage method"
        );
        handler.call(ctx, caller, params).await
    }
}
