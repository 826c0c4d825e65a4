//! Transaction proxy
//!
//! Wraps one business call in the TCC protocol:
//!
//! 1. decide the hop's role from the inbound transaction context;
//! 2. Begin (root) or Join (branch) with the coordinator, or skip the
//!    coordinator entirely (propagator);
//! 3. run Try with the caller's typed parameters;
//! 4. validate the context and, where the role calls for it, End.
//!
//! Protocol failures come back as the call's `Err`; nothing here panics.

use mesh_span::HandlerContext;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::config::TxnConfig;
use crate::descriptor::CompensableDescriptor;
use crate::error::{codes, Result, ServiceError, TxnError};
use crate::invoker::{Compensable, MethodInvoker, ParamBlob};
use crate::manager::{Participant, TransactionManager};
use crate::registry::CompensableRegistry;

/// Part a hop plays in the global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No transaction is active: begin one.
    Root,
    /// Forward the context without participating.
    Propagator,
    /// Join the active transaction.
    Branch,
}

impl Role {
    pub fn of(config: &TxnConfig, descriptor: &CompensableDescriptor, ctx: &HandlerContext) -> Self {
        if ctx.txn.is_root() {
            Role::Root
        } else if descriptor.is_propagator || config.is_propagator_service(&descriptor.service_name) {
            Role::Propagator
        } else {
            Role::Branch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Propagator => "propagator",
            Role::Branch => "branch",
        }
    }
}

/// Runs compensable services inside a global transaction.
#[derive(Clone)]
pub struct TransactionProxy {
    manager: Arc<TransactionManager>,
    invoker: MethodInvoker,
}

impl TransactionProxy {
    pub fn new(registry: Arc<CompensableRegistry>, manager: Arc<TransactionManager>) -> Self {
        Self {
            manager,
            invoker: MethodInvoker::new(registry),
        }
    }

    pub fn registry(&self) -> &Arc<CompensableRegistry> {
        self.invoker.registry()
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Run `service`'s Try as `service_name` within the transaction carried by
    /// `ctx`, beginning or joining it as needed.
    pub async fn execute<S: Compensable>(
        &self,
        ctx: &mut HandlerContext,
        service_name: &str,
        service: &S,
        params: S::Params,
    ) -> Result<S::Output> {
        let config = self.manager.config().current();
        let descriptor = self.registry().descriptor(service_name)?;
        let blob = ParamBlob::encode(&params)?;
        let role = Role::of(&config, &descriptor, ctx);
        let participant = Participant {
            service_name,
            flags: descriptor.flags,
            params: &blob,
        };

        let coordinator = match role {
            Role::Root => {
                let coordinator = config.coordinator_address.clone();
                self.manager
                    .begin(&config, ctx, &coordinator, participant)
                    .await
                    .map_err(|e| wrap(e, TxnError::BeginFailed))?;
                coordinator
            }
            Role::Branch => {
                let coordinator = if ctx.txn.agent_address.is_empty() {
                    config.coordinator_address.clone()
                } else {
                    ctx.txn.agent_address.clone()
                };
                self.manager
                    .join(&config, ctx, &coordinator, participant)
                    .await
                    .map_err(|e| wrap(e, TxnError::JoinFailed))?;
                coordinator
            }
            Role::Propagator => {
                ctx.txn.branch_xid = ctx.span.parent_span_id.clone();
                tracing::debug!(
                    service = service_name,
                    role = role.as_str(),
                    root_xid = %ctx.txn.root_xid,
                    branch_xid = %ctx.txn.branch_xid,
                    "Propagating transaction context"
                );
                String::new()
            }
        };

        let started = Instant::now();
        let outcome = self.invoker.invoke_try(service, ctx, params).await;
        ctx.span.consume(started.elapsed());
        let ok = is_ok(&config, ctx, outcome.is_ok());

        let missing = ctx.missing_fields();
        if !missing.is_empty() {
            return Err(TxnError::structural(format!(
                "incomplete transaction context after try: missing {}",
                missing.join(", ")
            )));
        }

        match role {
            Role::Propagator => outcome.map_err(TxnError::from),
            Role::Branch => {
                if !ok && config.try_failed_ignore_callback_cancel {
                    let try_error = outcome.as_ref().err();
                    if let Err(e) = self
                        .manager
                        .end(&config, ctx, &coordinator, false, try_error, &HashMap::new())
                        .await
                    {
                        tracing::warn!(
                            service = service_name,
                            role = role.as_str(),
                            branch_xid = %ctx.txn.branch_xid,
                            error = %e,
                            "Early end of failed branch was not accepted"
                        );
                    }
                }
                outcome.map_err(TxnError::from)
            }
            Role::Root => {
                let second_stage =
                    take_prefixed(&mut ctx.response_headers, &config.second_stage_header_prefix);
                let try_error = outcome.as_ref().err().cloned();
                match self
                    .manager
                    .end(&config, ctx, &coordinator, ok, try_error.as_ref(), &second_stage)
                    .await
                {
                    Ok(()) => outcome.map_err(TxnError::from),
                    Err(e) => {
                        tracing::error!(
                            service = service_name,
                            role = role.as_str(),
                            root_xid = %ctx.txn.root_xid,
                            ok = ok,
                            error = %e,
                            "Transaction end failed"
                        );
                        Err(classify_end_failure(e, ok, try_error.as_ref()))
                    }
                }
            }
        }
    }
}

/// Structural errors surface as-is; anything else is wrapped as the
/// operation's own failure kind.
fn wrap(err: TxnError, kind: fn(Box<TxnError>) -> TxnError) -> TxnError {
    if err.is_structural() {
        err
    } else {
        kind(Box::new(err))
    }
}

/// A Try succeeded when it returned `Ok`, nothing forced a cancel, and it
/// did not mark its response as an error.
fn is_ok(config: &TxnConfig, ctx: &HandlerContext, returned_ok: bool) -> bool {
    let marked = ctx
        .response_headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(&config.error_sentinel_header));
    returned_ok && !ctx.txn.force_cancel && !marked
}

/// Remove and return the headers whose name starts with `prefix`.
fn take_prefixed(headers: &mut HashMap<String, String>, prefix: &str) -> HashMap<String, String> {
    let prefix = prefix.to_ascii_lowercase();
    let keys: Vec<String> = headers
        .keys()
        .filter(|k| k.to_ascii_lowercase().starts_with(&prefix))
        .cloned()
        .collect();
    keys.into_iter()
        .filter_map(|k| headers.remove_entry(&k))
        .collect()
}

/// Map a failed End to the terminal error of the call.
///
/// Only an End that reached the coordinator can be a callback failure or
/// timeout. One refused for a spent budget was never sent and is a plain
/// end failure.
pub fn classify_end_failure(err: TxnError, ok: bool, try_error: Option<&ServiceError>) -> TxnError {
    match err {
        TxnError::Structural(_) => err,
        TxnError::CoordinatorRejected { code, message } => {
            if ok {
                TxnError::CallbackConfirmFailed { code, message }
            } else {
                TxnError::CallbackCancelFailed { code, message }
            }
        }
        e if e.is_timeout() => {
            if ok {
                TxnError::CallbackConfirmTimeout(e.to_string())
            } else {
                TxnError::CallbackCancelTimeout(e.to_string())
            }
        }
        e => match try_error {
            Some(t) => TxnError::EndFailed {
                code: t.code,
                message: format!("{}; {}", t.message, e),
            },
            None => TxnError::EndFailed {
                code: codes::TXN_END_FAILED,
                message: e.to_string(),
            },
        },
    }
}
