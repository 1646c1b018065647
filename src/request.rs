use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde_json::Value;

/// The gateway operation a request addresses. `Proxy` forwards near-verbatim;
/// everything else goes through provider request/response mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    ChatComplete,
    Complete,
    Embed,
    ImageGenerate,
    CreateSpeech,
    CreateTranscription,
    UploadFile,
    Proxy,
    Other(String),
}

impl Endpoint {
    pub fn from_name(name: &str) -> Self {
        match name {
            "chatComplete" => Self::ChatComplete,
            "complete" => Self::Complete,
            "embed" => Self::Embed,
            "imageGenerate" => Self::ImageGenerate,
            "createSpeech" => Self::CreateSpeech,
            "createTranscription" => Self::CreateTranscription,
            "uploadFile" => Self::UploadFile,
            "proxy" => Self::Proxy,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ChatComplete => "chatComplete",
            Self::Complete => "complete",
            Self::Embed => "embed",
            Self::ImageGenerate => "imageGenerate",
            Self::CreateSpeech => "createSpeech",
            Self::CreateTranscription => "createTranscription",
            Self::UploadFile => "uploadFile",
            Self::Proxy => "proxy",
            Self::Other(name) => name,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy)
    }

    pub fn is_upload_file(&self) -> bool {
        matches!(self, Self::UploadFile)
    }
}

/// The client body as the front-end handed it over. Multipart uploads and
/// raw audio arrive as opaque bytes with their original content type.
#[derive(Clone, Debug)]
pub enum RequestPayload {
    Json(Value),
    Binary {
        data: Bytes,
        content_type: Option<String>,
    },
    Empty,
}

impl RequestPayload {
    pub fn json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Conditional routing sees `{}` for non-JSON payloads.
    pub fn json_or_empty(&self) -> Value {
        self.json()
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    /// A request is streaming when its JSON body asks for `stream: true`.
    pub fn wants_stream(&self) -> bool {
        self.json()
            .and_then(|value| value.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One client request as seen by the routing core.
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    pub method: Method,
    pub endpoint: Endpoint,
    pub headers: HeaderMap,
    pub payload: RequestPayload,
}

impl IncomingRequest {
    pub fn new(
        method: Method,
        endpoint: Endpoint,
        headers: HeaderMap,
        payload: RequestPayload,
    ) -> Self {
        Self {
            method,
            endpoint,
            headers,
            payload,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
    }
}
