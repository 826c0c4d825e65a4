//! Coordinator wire messages.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{codes, TxnError};

pub const BEGIN_SERVICE: &str = "rootTxnBeginRequest";
pub const JOIN_SERVICE: &str = "branchTxnJoinRequest";
pub const END_SERVICE: &str = "txnEndRequest";
pub const CALLBACK_SERVICE: &str = "txnCallbackRequest";

/// Header carrying the root Try's error code on End.
pub const TRY_ERROR_CODE_HEADER: &str = "x-txn-try-error-code";
/// Header carrying the root Try's error message on End.
pub const TRY_ERROR_MSG_HEADER: &str = "x-txn-try-error-msg";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub service: String,
}

/// `{head:{service}, request:{..}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope<T> {
    pub head: Head,
    pub request: T,
}

impl<T> RequestEnvelope<T> {
    pub fn new(service: &str, request: T) -> Self {
        Self {
            head: Head {
                service: service.to_string(),
            },
            request,
        }
    }
}

/// Body of Begin and Join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginJoinRequest {
    pub participant_address: String,
    pub request_time: i64,
    pub parent_xid: String,
    pub root_xid: String,
    pub branch_xid: String,
    pub service_name: String,
    /// Base64 snapshot of the inbound request headers.
    pub headers: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRequest {
    pub root_xid: String,
    pub branch_xid: String,
    pub parent_xid: String,
    pub ok: bool,
    pub request_time: i64,
    pub try_failed_ignore_callback_cancel: bool,
}

/// `{errorCode, errorMsg, data}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorResponse<T> {
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_msg: String,
    pub data: Option<T>,
}

impl<T> CoordinatorResponse<T> {
    /// Data of an accepted request, or the rejection as an error.
    pub fn into_result(self) -> Result<Option<T>, TxnError> {
        if self.error_code != codes::OK {
            return Err(TxnError::CoordinatorRejected {
                code: self.error_code,
                message: self.error_msg,
            });
        }
        Ok(self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginData {
    pub root_xid: String,
    #[serde(default)]
    pub response_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinData {
    pub branch_xid: String,
    #[serde(default)]
    pub response_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndData {
    #[serde(default)]
    pub response_time: i64,
}

/// Confirm/Cancel call from the coordinator. The Try parameters follow as
/// the envelope tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub root_xid: String,
    #[serde(default)]
    pub parent_xid: String,
    pub branch_xid: String,
    pub service_name: String,
    /// Base64 snapshot of the Try's request headers plus second-stage
    /// headers.
    #[serde(default)]
    pub headers: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub error_code: i64,
    pub error_msg: String,
}

impl CallbackResponse {
    pub fn ok() -> Self {
        Self {
            error_code: codes::OK,
            error_msg: String::new(),
        }
    }
}

impl From<&TxnError> for CallbackResponse {
    fn from(err: &TxnError) -> Self {
        Self {
            error_code: err.code(),
            error_msg: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_begin_request_field_names() {
        let envelope = RequestEnvelope::new(
            BEGIN_SERVICE,
            BeginJoinRequest {
                participant_address: "http|b|c|d".into(),
                request_time: 1,
                parent_xid: "t".into(),
                root_xid: "s".into(),
                branch_xid: String::new(),
                service_name: "orders".into(),
                headers: String::new(),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["head"]["service"], "rootTxnBeginRequest");
        assert_eq!(value["request"]["participantAddress"], "http|b|c|d");
        assert_eq!(value["request"]["parentXid"], "t");
        assert_eq!(value["request"]["serviceName"], "orders");
    }

    #[test]
    fn test_end_request_field_names() {
        let value = serde_json::to_value(EndRequest {
            root_xid: "R1".into(),
            branch_xid: "R1".into(),
            parent_xid: "T".into(),
            ok: true,
            request_time: 5,
            try_failed_ignore_callback_cancel: false,
        })
        .unwrap();

        assert_eq!(value["ok"], true);
        assert_eq!(value["tryFailedIgnoreCallbackCancel"], false);
    }

    #[test]
    fn test_response_into_result() {
        let accepted: CoordinatorResponse<BeginData> = serde_json::from_value(json!({
            "errorCode": 0,
            "errorMsg": "",
            "data": {"rootXid": "R1", "responseTime": 3}
        }))
        .unwrap();
        assert_eq!(accepted.into_result().unwrap().unwrap().root_xid, "R1");

        let rejected: CoordinatorResponse<BeginData> =
            serde_json::from_value(json!({"errorCode": 500, "errorMsg": "busy"})).unwrap();
        match rejected.into_result() {
            Err(TxnError::CoordinatorRejected { code, message }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
