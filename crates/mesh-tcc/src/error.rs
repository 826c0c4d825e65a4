//! Error types for the transaction engine
//!
//! Every failure a transactional call can end with is a [`TxnError`]. Each
//! variant maps to a stable numeric code so the RPC layer above can classify
//! a failure (and decide on retries) without matching on messages.

use thiserror::Error;

use crate::invoker::Phase;
use crate::rpc::RpcError;

/// Numeric error codes carried on the wire and returned by [`TxnError::code`].
pub mod codes {
    pub const OK: i64 = 0;

    pub const STRUCTURAL: i64 = 10_001;
    pub const DEADLINE_EXCEEDED: i64 = 10_002;
    pub const CONFIG: i64 = 10_003;
    pub const CODEC: i64 = 10_004;
    pub const RPC: i64 = 10_005;
    pub const COORDINATOR_REJECTED: i64 = 10_006;

    pub const TXN_BEGIN_FAILED: i64 = 11_001;
    pub const TXN_JOIN_FAILED: i64 = 11_002;

    pub const CALLBACK_CONFIRM_ERROR: i64 = 12_001;
    pub const CALLBACK_CANCEL_ERROR: i64 = 12_002;
    pub const CALLBACK_CONFIRM_TIMEOUT: i64 = 12_003;
    pub const CALLBACK_CANCEL_TIMEOUT: i64 = 12_004;
    pub const TXN_END_FAILED: i64 = 12_005;
    pub const TXN_END_TIMEOUT: i64 = 12_006;

    pub const DECODE: i64 = 13_001;
    pub const NOT_REGISTERED: i64 = 13_002;
    pub const ALREADY_REGISTERED: i64 = 13_003;
}

/// Failure reported by a business method.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Service error {code}: {message}")]
pub struct ServiceError {
    pub code: i64,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Nested transactional calls surface engine failures to their own caller
/// as business errors.
impl From<TxnError> for ServiceError {
    fn from(err: TxnError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Terminal error of a transactional call.
#[derive(Error, Debug)]
pub enum TxnError {
    /// Malformed address or incomplete propagation context. Never retried.
    #[error("Structural error: {0}")]
    Structural(String),

    /// The call chain's timeout budget ran out before the call was issued.
    #[error("Deadline exceeded before {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// The coordinator answered with a non-zero error code.
    #[error("Coordinator rejected request ({code}): {message}")]
    CoordinatorRejected { code: i64, message: String },

    /// The End call timed out; the global transaction may still resolve.
    #[error("Transaction end timed out: {0}")]
    EndTimedOut(String),

    #[error("Transaction begin failed: {0}")]
    BeginFailed(#[source] Box<TxnError>),

    #[error("Transaction join failed: {0}")]
    JoinFailed(#[source] Box<TxnError>),

    #[error("Callback confirm error ({code}): {message}")]
    CallbackConfirmFailed { code: i64, message: String },

    #[error("Callback cancel error ({code}): {message}")]
    CallbackCancelFailed { code: i64, message: String },

    #[error("Callback confirm timeout: {0}")]
    CallbackConfirmTimeout(String),

    #[error("Callback cancel timeout: {0}")]
    CallbackCancelTimeout(String),

    /// End failed for a reason other than rejection or timeout.
    ///
    /// `code` is the Try's own code when Try failed too.
    #[error("Transaction end error: {message}")]
    EndFailed { code: i64, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("No {phase} method registered for service {service}")]
    NotRegistered { service: String, phase: Phase },

    #[error("Service already registered: {0}")]
    AlreadyRegistered(String),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl TxnError {
    pub fn structural(msg: impl Into<String>) -> Self {
        TxnError::Structural(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        TxnError::Codec(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        TxnError::Decode(msg.into())
    }

    /// Stable code for this error. Business errors keep their own code.
    pub fn code(&self) -> i64 {
        match self {
            TxnError::Structural(_) => codes::STRUCTURAL,
            TxnError::DeadlineExceeded { .. } => codes::DEADLINE_EXCEEDED,
            TxnError::Config(_) => codes::CONFIG,
            TxnError::Codec(_) => codes::CODEC,
            TxnError::Rpc(_) => codes::RPC,
            TxnError::CoordinatorRejected { code, .. } => *code,
            TxnError::EndTimedOut(_) => codes::TXN_END_TIMEOUT,
            TxnError::BeginFailed(_) => codes::TXN_BEGIN_FAILED,
            TxnError::JoinFailed(_) => codes::TXN_JOIN_FAILED,
            TxnError::CallbackConfirmFailed { .. } => codes::CALLBACK_CONFIRM_ERROR,
            TxnError::CallbackCancelFailed { .. } => codes::CALLBACK_CANCEL_ERROR,
            TxnError::CallbackConfirmTimeout(_) => codes::CALLBACK_CONFIRM_TIMEOUT,
            TxnError::CallbackCancelTimeout(_) => codes::CALLBACK_CANCEL_TIMEOUT,
            TxnError::EndFailed { code, .. } => *code,
            TxnError::Decode(_) => codes::DECODE,
            TxnError::NotRegistered { .. } => codes::NOT_REGISTERED,
            TxnError::AlreadyRegistered(_) => codes::ALREADY_REGISTERED,
            TxnError::Service(e) => e.code,
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, TxnError::Structural(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TxnError::EndTimedOut(_)
                | TxnError::CallbackConfirmTimeout(_)
                | TxnError::CallbackCancelTimeout(_)
                | TxnError::Rpc(RpcError::Timeout(_))
        )
    }
}

impl From<serde_json::Error> for TxnError {
    fn from(err: serde_json::Error) -> Self {
        TxnError::Codec(format!("JSON error: {}", err))
    }
}

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, TxnError>;
