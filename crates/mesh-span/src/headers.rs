//! Header encoding of the propagation context.
//!
//! Outbound calls carry the caller's identity; the callee derives its own
//! span from it on the way in. Header names are lowercase so they compare
//! equal after passing through any HTTP stack.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::context::{new_id, HandlerContext, SpanContext, TransactionContext};

pub const TRACE_ID: &str = "x-mesh-trace-id";
/// Span ID of the sender; becomes the receiver's parent span.
pub const SPAN_ID: &str = "x-mesh-span-id";
pub const REPLY_TO: &str = "x-mesh-reply-to";
pub const TIMEOUT_BUDGET_MS: &str = "x-mesh-timeout-budget-ms";

pub const ROOT_XID: &str = "x-txn-root-xid";
pub const PARENT_XID: &str = "x-txn-parent-xid";
pub const BRANCH_XID: &str = "x-txn-branch-xid";
pub const AGENT_ADDRESS: &str = "x-txn-agent-address";
pub const AGENT_ADDRESS_OLD: &str = "x-txn-agent-address-old";
pub const FORCE_CANCEL: &str = "x-txn-force-cancel";

/// Errors decoding propagation headers.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("Invalid header {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Invalid header snapshot: {0}")]
    Snapshot(String),
}

/// Write the context a callee needs into outbound request headers.
pub fn inject(ctx: &HandlerContext, headers: &mut HeaderMap) {
    let txn = ctx.txn.for_downstream();
    let pairs = [
        (TRACE_ID, ctx.span.trace_id.as_str()),
        (SPAN_ID, ctx.span.span_id.as_str()),
        (REPLY_TO, ctx.span.reply_to_address.as_str()),
        (ROOT_XID, txn.root_xid.as_str()),
        (PARENT_XID, txn.parent_xid.as_str()),
        (BRANCH_XID, txn.branch_xid.as_str()),
        (AGENT_ADDRESS, txn.agent_address.as_str()),
        (AGENT_ADDRESS_OLD, txn.agent_address_old.as_str()),
    ];

    for (name, value) in pairs {
        if value.is_empty() {
            continue;
        }
        match HeaderValue::from_str(value) {
            Ok(v) => {
                headers.insert(HeaderName::from_static(name), v);
            }
            Err(e) => tracing::warn!(header = name, error = %e, "Skipping unencodable propagation header"),
        }
    }

    headers.insert(
        HeaderName::from_static(TIMEOUT_BUDGET_MS),
        HeaderValue::from(ctx.span.timeout_budget_ms),
    );
    if txn.force_cancel {
        headers.insert(HeaderName::from_static(FORCE_CANCEL), HeaderValue::from_static("true"));
    }
}

/// Build the context of an inbound request.
///
/// A request without a trace starts a new one. The hop always gets a fresh
/// span ID. A missing budget header falls back to `default_budget`; a
/// malformed one is rejected.
pub fn extract(headers: &HeaderMap, default_budget: Duration) -> Result<HandlerContext, HeaderError> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let trace_id = get(TRACE_ID).unwrap_or_else(new_id);
    let parent_span_id = get(SPAN_ID).unwrap_or_else(|| trace_id.clone());
    let timeout_budget_ms = match get(TIMEOUT_BUDGET_MS) {
        Some(raw) => raw.parse::<u64>().map_err(|e| HeaderError::Invalid {
            name: TIMEOUT_BUDGET_MS,
            reason: e.to_string(),
        })?,
        None => default_budget.as_millis() as u64,
    };

    let span = SpanContext {
        trace_id,
        span_id: new_id(),
        parent_span_id,
        reply_to_address: get(REPLY_TO).unwrap_or_default(),
        timeout_budget_ms,
    };

    let txn = TransactionContext {
        root_xid: get(ROOT_XID).unwrap_or_default(),
        parent_xid: get(PARENT_XID).unwrap_or_default(),
        branch_xid: get(BRANCH_XID).unwrap_or_default(),
        agent_address: get(AGENT_ADDRESS).unwrap_or_default(),
        agent_address_old: get(AGENT_ADDRESS_OLD).unwrap_or_default(),
        force_cancel: get(FORCE_CANCEL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
    };

    Ok(HandlerContext::new(span, txn).with_request_headers(to_map(headers)))
}

/// Flatten a header map, dropping values that are not valid UTF-8.
pub fn to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Base64 snapshot of a header set, keys sorted so equal sets encode equally.
pub fn encode_snapshot(headers: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = headers.iter().collect();
    let json = serde_json::to_vec(&sorted).unwrap_or_default();
    STANDARD.encode(json)
}

pub fn decode_snapshot(encoded: &str) -> Result<HashMap<String, String>, HeaderError> {
    if encoded.is_empty() {
        return Ok(HashMap::new());
    }
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| HeaderError::Snapshot(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| HeaderError::Snapshot(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch_ctx() -> HandlerContext {
        let mut ctx = HandlerContext::new_root(Duration::from_millis(1200));
        ctx.txn = TransactionContext {
            root_xid: "R1".into(),
            parent_xid: "P1".into(),
            branch_xid: "B2".into(),
            agent_address: "http://dxc|/begin|/join|/end".into(),
            ..Default::default()
        };
        ctx
    }

    #[test]
    fn test_inject_then_extract_links_hops() {
        let caller = branch_ctx();
        let mut headers = HeaderMap::new();
        inject(&caller, &mut headers);

        let callee = extract(&headers, Duration::from_secs(30)).unwrap();

        assert_eq!(callee.span.trace_id, caller.span.trace_id);
        assert_eq!(callee.span.parent_span_id, caller.span.span_id);
        assert_ne!(callee.span.span_id, caller.span.span_id);
        assert_eq!(callee.span.timeout_budget_ms, 1200);
        assert_eq!(callee.txn.root_xid, "R1");
        assert_eq!(callee.txn.parent_xid, "B2");
        assert_eq!(callee.txn.agent_address, caller.txn.agent_address);
        assert!(!callee.txn.force_cancel);
        assert!(!callee.txn.is_root());
    }

    #[test]
    fn test_extract_without_headers_is_root() {
        let ctx = extract(&HeaderMap::new(), Duration::from_secs(7)).unwrap();

        assert!(ctx.txn.is_root());
        assert_eq!(ctx.span.parent_span_id, ctx.span.trace_id);
        assert_eq!(ctx.span.timeout_budget_ms, 7000);
    }

    #[test]
    fn test_extract_rejects_bad_budget() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMEOUT_BUDGET_MS, HeaderValue::from_static("soon"));

        let err = extract(&headers, Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains(TIMEOUT_BUDGET_MS));
    }

    #[test]
    fn test_force_cancel_propagates() {
        let mut caller = branch_ctx();
        caller.txn.force_cancel = true;
        let mut headers = HeaderMap::new();
        inject(&caller, &mut headers);

        let callee = extract(&headers, Duration::from_secs(1)).unwrap();
        assert!(callee.txn.force_cancel);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut headers = HashMap::new();
        headers.insert("x-tenant".to_string(), "acme".to_string());
        headers.insert("x-user".to_string(), "u-1".to_string());

        let encoded = encode_snapshot(&headers);
        assert_eq!(decode_snapshot(&encoded).unwrap(), headers);
        assert!(decode_snapshot("").unwrap().is_empty());
        assert!(decode_snapshot("!!!").is_err());
    }
}
