use bytes::Bytes;
use serde_json::Value;

use crate::request::{Endpoint, RequestPayload};

/// How the upstream body is produced for one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyPlan {
    /// Serialize the (provider-mapped) JSON params.
    Json,
    /// Forward the client's multipart bytes untouched.
    Multipart,
    /// Forward raw audio bytes untouched (proxy mode only).
    ProxyAudio,
    /// No body at all (e.g. GET, bodyless delete).
    None,
}

/// Decides the body shape from the endpoint and the two content types in
/// play: what the client sent and what the provider mapping asks for.
pub fn plan_request_body(
    endpoint: &Endpoint,
    client_content_type: Option<&str>,
    provider_content_type: Option<&str>,
) -> BodyPlan {
    let client_multipart = client_content_type
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);
    let provider_multipart = provider_content_type
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if provider_multipart || (endpoint.is_proxy() && client_multipart) {
        return BodyPlan::Multipart;
    }
    if endpoint.is_proxy()
        && client_content_type
            .map(|value| value.starts_with("audio/"))
            .unwrap_or(false)
    {
        return BodyPlan::ProxyAudio;
    }
    if client_content_type.is_some() {
        return BodyPlan::Json;
    }
    BodyPlan::None
}

/// Materializes the upstream body bytes for the chosen plan.
pub fn build_request_body(
    plan: BodyPlan,
    transformed_json: Option<&Value>,
    payload: &RequestPayload,
) -> Option<Bytes> {
    match plan {
        BodyPlan::Json => {
            let body = transformed_json.or_else(|| payload.json())?;
            serde_json::to_vec(body).ok().map(Bytes::from)
        }
        BodyPlan::Multipart | BodyPlan::ProxyAudio => match payload {
            RequestPayload::Binary { data, .. } => Some(data.clone()),
            _ => None,
        },
        BodyPlan::None => None,
    }
}
