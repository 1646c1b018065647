use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};

use crate::error::GatewayError;

/// Marker stamped on every core-emitted failure response. Fallback reads it
/// to stop walking siblings when the failure came from the gateway itself
/// rather than the upstream.
pub const GATEWAY_EXCEPTION_HEADER: &str = "x-portkey-gateway-exception";

/// Status used when the hook runtime votes to block a request or response.
pub const HOOKS_FAILED_STATUS: u16 = 446;

/// A materialized upstream (or core-synthesized) response.
#[derive(Clone, Debug)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn json(status: StatusCode, body: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::to_vec(body).map(Bytes::from).unwrap_or_default();
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or_default()
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type().starts_with("text/event-stream")
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Replaces the body with a JSON value, keeping status and headers.
    pub fn with_json_body(mut self, body: &Value) -> Self {
        self.body = serde_json::to_vec(body).map(Bytes::from).unwrap_or_default();
        self.headers.insert(
            "content-type",
            HeaderValue::from_static("application/json"),
        );
        self.headers.remove("content-length");
        self
    }

    pub fn has_gateway_exception(&self) -> bool {
        self.header(GATEWAY_EXCEPTION_HEADER) == Some("true")
    }

    fn mark_gateway_exception(mut self) -> Self {
        self.headers
            .insert(GATEWAY_EXCEPTION_HEADER, HeaderValue::from_static("true"));
        self
    }
}

/// Shapes an error escaping the resolver or the leaf pipeline into the
/// uniform failure response. Router misconfigurations become a 400 without
/// the gateway-exception marker; gateway errors surface their message
/// verbatim; anything else is logged and collapsed to a generic 500.
pub fn shape_error(err: &GatewayError) -> GatewayResponse {
    match err {
        GatewayError::Router(message) => GatewayResponse::json(
            StatusCode::BAD_REQUEST,
            &json!({"status": "failure", "message": message}),
        ),
        GatewayError::Gateway(message) => GatewayResponse::json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({"status": "failure", "message": message}),
        )
        .mark_gateway_exception(),
        other => {
            tracing::error!(error = %other, cause = ?other, "unhandled gateway error");
            GatewayResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({"status": "failure", "message": "Something went wrong"}),
            )
            .mark_gateway_exception()
        }
    }
}

/// Builds the 446 response emitted when hooks deny a request or response.
pub fn hooks_failed_response(
    before_results: &[Value],
    after_results: &[Value],
) -> GatewayResponse {
    let status = StatusCode::from_u16(HOOKS_FAILED_STATUS)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    GatewayResponse::json(
        status,
        &json!({
            "error": {
                "message": "The guardrail checks defined in the config failed. You can find more information in the `hook_results` object.",
                "type": "hooks_failed",
                "param": null,
                "code": null,
            },
            "hook_results": {
                "before_request_hooks": before_results,
                "after_request_hooks": after_results,
            },
        }),
    )
    .mark_gateway_exception()
}
