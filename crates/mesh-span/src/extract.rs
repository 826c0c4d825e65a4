//! Axum extractor for the propagation context.
//!
//! Builds a [`HandlerContext`] from the inbound request headers. Requests
//! carrying a malformed timeout budget are rejected with 400.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::time::Duration;

use crate::context::{HandlerContext, DEFAULT_TIMEOUT_BUDGET_MS};
use crate::headers;

/// Axum extractor yielding the request's [`HandlerContext`].
pub struct HandlerContextExtractor(pub HandlerContext);

/// Rejection for malformed propagation headers.
pub struct HandlerContextRejection {
    message: String,
}

impl IntoResponse for HandlerContextRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "INVALID_PROPAGATION_HEADER",
                "message": self.message
            })),
        )
            .into_response()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for HandlerContextExtractor {
    type Rejection = HandlerContextRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        headers::extract(&parts.headers, Duration::from_millis(DEFAULT_TIMEOUT_BUDGET_MS))
            .map(Self)
            .map_err(|e| HandlerContextRejection {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn test_extracts_context_from_headers() {
        let request = Request::builder()
            .header(headers::TRACE_ID, "t-1")
            .header(headers::SPAN_ID, "s-caller")
            .header(headers::ROOT_XID, "R1")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let HandlerContextExtractor(ctx) =
            HandlerContextExtractor::from_request_parts(&mut parts, &()).await.ok().unwrap();

        assert_eq!(ctx.span.trace_id, "t-1");
        assert_eq!(ctx.span.parent_span_id, "s-caller");
        assert_eq!(ctx.txn.root_xid, "R1");
        assert_eq!(ctx.span.timeout_budget_ms, DEFAULT_TIMEOUT_BUDGET_MS);
    }

    #[tokio::test]
    async fn test_rejects_malformed_budget() {
        let request = Request::builder()
            .header(headers::TIMEOUT_BUDGET_MS, "-5")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();

        let result = HandlerContextExtractor::from_request_parts(&mut parts, &()).await;
        let response = match result {
            Ok(_) => panic!("expected rejection"),
            Err(rejection) => rejection.into_response(),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
