//! Propagation context for mesh service calls.
//!
//! This crate carries the identity of a call chain across process boundaries:
//! the tracing span of each hop and the global transaction it belongs to.
//!
//! # Hop model
//!
//! ```text
//! caller (span S1, branch B1)
//!   └─ inject() ──headers──> extract()
//!                              callee (span S2, parent S1, parentXid B1)
//! ```
//!
//! # Usage
//!
//! 1. Use `HandlerContextExtractor` (or `headers::extract`) on inbound requests.
//! 2. Pass the `HandlerContext` by `&mut` to the code serving the request.
//! 3. Call `headers::inject` on every outbound request.

pub mod context;
pub mod extract;
pub mod headers;

pub use context::{HandlerContext, SpanContext, TransactionContext, DEFAULT_TIMEOUT_BUDGET_MS};
pub use extract::HandlerContextExtractor;
pub use headers::HeaderError;
