//! Per-request propagation context.
//!
//! A `HandlerContext` is created when a request enters the mesh and is passed
//! explicitly (`&mut`) through every layer that needs it. Crossing a hop
//! boundary always goes through [`HandlerContext::downstream`], which copies
//! the span and transaction data so a callee never observes later mutations
//! made by its caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Default timeout budget for requests that enter the mesh without one.
pub const DEFAULT_TIMEOUT_BUDGET_MS: u64 = 30_000;

/// Generate a fresh hop identifier.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Tracing identity of one hop plus the timeout budget left for the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanContext {
    pub trace_id: String,
    /// Generated once per hop. Reused as the proposed RootXID or BranchXID.
    pub span_id: String,
    /// Span ID of the caller.
    pub parent_span_id: String,
    #[serde(default)]
    pub reply_to_address: String,
    /// Milliseconds left before the whole call chain must have answered.
    pub timeout_budget_ms: u64,
}

impl SpanContext {
    /// Span for a request that has no upstream caller.
    ///
    /// The root hop's parent span is the trace itself, so every hop in a chain
    /// carries a non-empty `parent_span_id`.
    pub fn new_root(budget: Duration) -> Self {
        let trace_id = new_id();
        Self {
            parent_span_id: trace_id.clone(),
            trace_id,
            span_id: new_id(),
            reply_to_address: String::new(),
            timeout_budget_ms: budget.as_millis() as u64,
        }
    }

    /// Copy for the next hop: same trace and budget, fresh span ID, parented
    /// to this span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            parent_span_id: self.span_id.clone(),
            reply_to_address: self.reply_to_address.clone(),
            timeout_budget_ms: self.timeout_budget_ms,
        }
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.timeout_budget_ms)
    }

    pub fn is_expired(&self) -> bool {
        self.timeout_budget_ms == 0
    }

    /// Charge a round trip against the budget.
    ///
    /// Any non-zero elapsed time costs at least one millisecond; the budget
    /// saturates at zero.
    pub fn consume(&mut self, elapsed: Duration) {
        let cost = elapsed.as_nanos().div_ceil(1_000_000);
        let cost = u64::try_from(cost).unwrap_or(u64::MAX);
        self.timeout_budget_ms = self.timeout_budget_ms.saturating_sub(cost);
    }
}

/// Global transaction identity as seen by the current hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    pub root_xid: String,
    pub parent_xid: String,
    pub branch_xid: String,
    /// Coordinator address that owns the global transaction.
    pub agent_address: String,
    pub agent_address_old: String,
    #[serde(default)]
    pub force_cancel: bool,
}

impl TransactionContext {
    /// No global transaction is active: this hop must begin one.
    pub fn is_root(&self) -> bool {
        self.root_xid.is_empty() && self.branch_xid.is_empty() && self.agent_address.is_empty()
    }

    /// Copy handed to a callee. The caller's branch becomes the callee's
    /// parent.
    pub fn for_downstream(&self) -> Self {
        let mut txn = self.clone();
        if !self.branch_xid.is_empty() {
            txn.parent_xid = self.branch_xid.clone();
        }
        txn
    }

    /// Record a new coordinator address, keeping the previous one.
    pub fn set_agent_address(&mut self, address: impl Into<String>) {
        let address = address.into();
        if self.agent_address != address {
            self.agent_address_old = std::mem::take(&mut self.agent_address);
            self.agent_address = address;
        }
    }
}

/// Everything a handler knows about the request it is serving.
#[derive(Debug, Clone, Default)]
pub struct HandlerContext {
    pub span: SpanContext,
    pub txn: TransactionContext,
    pub request_headers: HashMap<String, String>,
    /// Headers returned to the caller. Business methods may write here.
    pub response_headers: HashMap<String, String>,
}

impl HandlerContext {
    pub fn new(span: SpanContext, txn: TransactionContext) -> Self {
        Self {
            span,
            txn,
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
        }
    }

    /// Context for a request entering the mesh with no transaction.
    pub fn new_root(budget: Duration) -> Self {
        Self::new(SpanContext::new_root(budget), TransactionContext::default())
    }

    pub fn with_request_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.request_headers = headers;
        self
    }

    /// Context as the next hop will receive it.
    pub fn downstream(&self) -> Self {
        Self::new(self.span.child(), self.txn.for_downstream())
    }

    /// Names of the identifiers that must be set once a transactional call
    /// has run. Empty when the context is complete.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("traceId", &self.span.trace_id),
            ("spanId", &self.span.span_id),
            ("parentSpanId", &self.span.parent_span_id),
            ("rootXid", &self.txn.root_xid),
            ("branchXid", &self.txn.branch_xid),
            ("parentXid", &self.txn.parent_xid),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_root_span() {
        let span = SpanContext::new_root(Duration::from_secs(5));
        assert_eq!(span.parent_span_id, span.trace_id);
        assert_ne!(span.span_id, span.trace_id);
        assert_eq!(span.timeout_budget_ms, 5000);
    }

    #[test]
    fn test_child_span_is_parented_to_caller() {
        let root = SpanContext::new_root(Duration::from_secs(5));
        let child = root.child();

        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, root.span_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.timeout_budget_ms, root.timeout_budget_ms);
    }

    #[test]
    fn test_consume_rounds_up_and_saturates() {
        let mut span = SpanContext::new_root(Duration::from_millis(10));
        span.consume(Duration::from_micros(1));
        assert_eq!(span.timeout_budget_ms, 9);

        span.consume(Duration::from_millis(4));
        assert_eq!(span.timeout_budget_ms, 5);

        span.consume(Duration::from_secs(1));
        assert_eq!(span.timeout_budget_ms, 0);
        assert!(span.is_expired());
    }

    #[test]
    fn test_empty_transaction_is_root() {
        let mut txn = TransactionContext::default();
        assert!(txn.is_root());

        txn.agent_address = "http|x|y|z".to_string();
        assert!(!txn.is_root());
    }

    #[test]
    fn test_for_downstream_moves_branch_to_parent() {
        let txn = TransactionContext {
            root_xid: "R1".into(),
            parent_xid: "P1".into(),
            branch_xid: "B2".into(),
            ..Default::default()
        };

        let next = txn.for_downstream();
        assert_eq!(next.root_xid, "R1");
        assert_eq!(next.parent_xid, "B2");
        assert_eq!(next.branch_xid, "B2");
    }

    #[test]
    fn test_set_agent_address_keeps_previous() {
        let mut txn = TransactionContext::default();
        txn.set_agent_address("a");
        txn.set_agent_address("b");
        assert_eq!(txn.agent_address, "b");
        assert_eq!(txn.agent_address_old, "a");

        txn.set_agent_address("b");
        assert_eq!(txn.agent_address_old, "a");
    }

    #[test]
    fn test_downstream_copy_is_isolated() {
        let mut ctx = HandlerContext::new_root(Duration::from_secs(1));
        ctx.txn.root_xid = "R1".into();
        ctx.txn.branch_xid = "R1".into();

        let downstream = ctx.downstream();
        ctx.txn.force_cancel = true;
        ctx.span.consume(Duration::from_millis(500));

        assert!(!downstream.txn.force_cancel);
        assert_eq!(downstream.span.timeout_budget_ms, 1000);
        assert_eq!(downstream.span.parent_span_id, ctx.span.span_id);
    }

    #[test]
    fn test_missing_fields() {
        let mut ctx = HandlerContext::new_root(Duration::from_secs(1));
        assert_eq!(ctx.missing_fields(), vec!["rootXid", "branchXid", "parentXid"]);

        ctx.txn.root_xid = "R1".into();
        ctx.txn.branch_xid = "R1".into();
        ctx.txn.parent_xid = ctx.span.trace_id.clone();
        assert!(ctx.missing_fields().is_empty());
    }

    #[test]
    fn test_json_serialization_roundtrip() {
        let span = SpanContext::new_root(Duration::from_secs(3));
        let json = serde_json::to_string(&span).unwrap();
        assert!(json.contains("timeoutBudgetMs"));

        let back: SpanContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, span);
    }
}
