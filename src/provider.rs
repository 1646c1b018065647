use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::http::{HeaderMap, Method};
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::request::{Endpoint, RequestPayload};
use crate::target::{RetryConfig, Target};
use crate::transport::UpstreamTransport;

/// Execution record for one leaf call. Created by the request processor,
/// mutated only by provider request mapping and URL resolution, dropped
/// with the processor.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Leaf target with inherited fields already applied.
    pub options: Target,
    pub provider: String,
    pub endpoint: Endpoint,
    pub method: Method,
    pub client_headers: HeaderMap,
    pub payload: RequestPayload,
    pub transformed_body: Option<Value>,
    pub transformed_headers: BTreeMap<String, String>,
    pub request_url: String,
    pub is_streaming: bool,
    pub retry: RetryConfig,
    pub request_timeout: Option<u64>,
    pub strict_open_ai_compliance: bool,
}

impl RequestContext {
    /// The params the upstream body is built from: the hook-transformed or
    /// provider-mapped JSON when present, the client's otherwise.
    pub fn effective_params(&self) -> Option<&Value> {
        self.transformed_body.as_ref().or_else(|| self.payload.json())
    }
}

/// Maps OpenAI-style requests onto one provider's wire format and back.
/// Concrete provider families (Azure auth flows, SigV4 signing, Vertex
/// batches) live outside the routing core behind this seam.
pub trait ProviderAdapter: Send + Sync {
    /// Full upstream URL for the request.
    fn resolve_url(&self, ctx: &RequestContext) -> Result<String>;

    /// Provider-mapped outgoing headers (authentication and friends).
    fn request_headers(&self, ctx: &RequestContext) -> Result<BTreeMap<String, String>>;

    /// Maps the OpenAI-style params into the provider's request body.
    fn transform_request(&self, ctx: &RequestContext, params: &Value) -> Result<Value>;

    /// Maps a provider response body back to the OpenAI-style shape.
    fn transform_response(&self, ctx: &RequestContext, response: Value) -> Result<Value>;

    /// A transport that speaks the provider's own protocol end to end;
    /// when present the generic request mapping is skipped.
    fn request_handler(&self) -> Option<Arc<dyn UpstreamTransport>> {
        None
    }
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ProviderAdapter")
    }
}

/// Lookup table from `provider` strings to adapters.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(provider.into(), adapter);
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned().ok_or_else(|| {
            GatewayError::gateway(format!("Unsupported provider: {provider}"))
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Adapter for OpenAI and OpenAI-compatible upstreams: bearer auth, JSON
/// bodies passed through with `override_params` applied.
#[derive(Clone, Debug)]
pub struct OpenAiCompatibleAdapter {
    default_base_url: String,
}

impl OpenAiCompatibleAdapter {
    pub fn new(default_base_url: impl Into<String>) -> Self {
        Self {
            default_base_url: default_base_url.into(),
        }
    }

    fn base_url(&self, ctx: &RequestContext) -> String {
        ctx.options
            .custom_host
            .clone()
            .unwrap_or_else(|| self.default_base_url.clone())
    }
}

impl Default for OpenAiCompatibleAdapter {
    fn default() -> Self {
        Self::new("https://api.openai.com/v1")
    }
}

impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn resolve_url(&self, ctx: &RequestContext) -> Result<String> {
        let base = self.base_url(ctx);
        let base = base.trim_end_matches('/');
        let path = match &ctx.endpoint {
            Endpoint::ChatComplete => "/chat/completions",
            Endpoint::Complete => "/completions",
            Endpoint::Embed => "/embeddings",
            Endpoint::ImageGenerate => "/images/generations",
            Endpoint::CreateSpeech => "/audio/speech",
            Endpoint::CreateTranscription => "/audio/transcriptions",
            Endpoint::UploadFile => "/files",
            Endpoint::Proxy => "",
            Endpoint::Other(name) => {
                return Err(GatewayError::gateway(format!(
                    "Endpoint {name} is not supported for provider {}",
                    ctx.provider
                )));
            }
        };
        Ok(format!("{base}{path}"))
    }

    fn request_headers(&self, ctx: &RequestContext) -> Result<BTreeMap<String, String>> {
        let mut headers = BTreeMap::new();
        if let Some(api_key) = &ctx.options.api_key {
            headers.insert("authorization".to_string(), format!("Bearer {api_key}"));
        }
        if let Some(organization) = ctx
            .options
            .extras
            .get("openaiOrganization")
            .and_then(Value::as_str)
        {
            headers.insert("openai-organization".to_string(), organization.to_string());
        }
        if let Some(project) = ctx
            .options
            .extras
            .get("openaiProject")
            .and_then(Value::as_str)
        {
            headers.insert("openai-project".to_string(), project.to_string());
        }
        Ok(headers)
    }

    fn transform_request(&self, ctx: &RequestContext, params: &Value) -> Result<Value> {
        let mut body = params.clone();
        if let (Some(object), Some(overrides)) =
            (body.as_object_mut(), &ctx.options.override_params)
        {
            for (key, value) in overrides {
                object.insert(key.clone(), value.clone());
            }
        }
        Ok(body)
    }

    fn transform_response(&self, _ctx: &RequestContext, response: Value) -> Result<Value> {
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context(options: Value, endpoint: Endpoint) -> RequestContext {
        RequestContext {
            options: serde_json::from_value(options).expect("target"),
            provider: "openai".to_string(),
            endpoint,
            method: Method::POST,
            client_headers: HeaderMap::new(),
            payload: RequestPayload::Empty,
            transformed_body: None,
            transformed_headers: BTreeMap::new(),
            request_url: String::new(),
            is_streaming: false,
            retry: RetryConfig::default(),
            request_timeout: None,
            strict_open_ai_compliance: false,
        }
    }

    #[test]
    fn url_resolution_respects_custom_host() {
        let adapter = OpenAiCompatibleAdapter::default();
        let ctx = context(
            json!({"provider": "openai", "customHost": "https://llm.internal/v1/"}),
            Endpoint::ChatComplete,
        );
        assert_eq!(
            adapter.resolve_url(&ctx).expect("url"),
            "https://llm.internal/v1/chat/completions"
        );
    }

    #[test]
    fn override_params_win_over_request_params() {
        let adapter = OpenAiCompatibleAdapter::default();
        let ctx = context(
            json!({"provider": "openai", "override_params": {"model": "gpt-4o-mini"}}),
            Endpoint::ChatComplete,
        );
        let body = adapter
            .transform_request(&ctx, &json!({"model": "gpt-4o", "max_tokens": 10}))
            .expect("body");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 10);
    }

    #[test]
    fn bearer_auth_and_org_headers_are_mapped() {
        let adapter = OpenAiCompatibleAdapter::default();
        let ctx = context(
            json!({"provider": "openai", "apiKey": "sk-test", "openaiOrganization": "org-9"}),
            Endpoint::ChatComplete,
        );
        let headers = adapter.request_headers(&ctx).expect("headers");
        assert_eq!(headers["authorization"], "Bearer sk-test");
        assert_eq!(headers["openai-organization"], "org-9");
    }

    #[test]
    fn unknown_provider_is_a_gateway_error() {
        let registry = ProviderRegistry::new();
        let err = registry.get("nope").expect_err("missing provider");
        assert!(matches!(err, GatewayError::Gateway(_)));
    }
}
