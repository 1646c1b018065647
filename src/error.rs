use thiserror::Error;

/// Errors raised inside the routing core.
///
/// `Gateway` messages are surfaced to the caller verbatim; `Router` failures
/// map to HTTP 400 at the edge; everything else collapses to a generic 500.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Gateway(String),
    #[error("{0}")]
    Router(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
}

impl GatewayError {
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway(message.into())
    }

    pub fn router(message: impl Into<String>) -> Self {
        Self::Router(message.into())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
