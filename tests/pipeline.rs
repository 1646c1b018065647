use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::{Value, json};
use trellis_gateway::cache::MemoryCache;
use trellis_gateway::circuit::MemoryCircuitBreaker;
use trellis_gateway::hooks::{HookOutcome, HookSpanId, Hooks};
use trellis_gateway::logging::MemoryLogSink;
use trellis_gateway::provider::{OpenAiCompatibleAdapter, ProviderRegistry, RequestContext};
use trellis_gateway::transport::{FetchOptions, UpstreamTransport};
use trellis_gateway::{
    Endpoint, GatewayContext, GatewayResponse, IncomingRequest, PreRequestValidator,
    RequestPayload, Result, Target, execute_request,
};

struct StubUpstream {
    respond: Box<dyn Fn(&str, usize) -> GatewayResponse + Send + Sync>,
    seen: Mutex<Vec<(String, Option<Value>, HeaderMap)>>,
}

impl StubUpstream {
    fn new(
        respond: impl Fn(&str, usize) -> GatewayResponse + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().expect("seen lock").len()
    }

    fn calls_to(&self, host: &str) -> usize {
        self.seen
            .lock()
            .expect("seen lock")
            .iter()
            .filter(|(url, _, _)| url.starts_with(host))
            .count()
    }

    fn last_body(&self) -> Option<Value> {
        self.seen
            .lock()
            .expect("seen lock")
            .last()
            .and_then(|(_, body, _)| body.clone())
    }

    fn last_headers(&self) -> HeaderMap {
        self.seen
            .lock()
            .expect("seen lock")
            .last()
            .map(|(_, _, headers)| headers.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl UpstreamTransport for StubUpstream {
    async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
        _timeout: Option<std::time::Duration>,
    ) -> Result<GatewayResponse> {
        let mut seen = self.seen.lock().expect("seen lock");
        let index = seen.len();
        seen.push((
            url.to_string(),
            options
                .body
                .as_ref()
                .and_then(|body| serde_json::from_slice(body).ok()),
            options.headers.clone(),
        ));
        Ok((self.respond)(url, index))
    }
}

fn ok_json(body: Value) -> GatewayResponse {
    GatewayResponse::json(StatusCode::OK, &body)
}

fn target(value: Value) -> Target {
    serde_json::from_value(value).expect("target")
}

fn chat_request(body: Value) -> IncomingRequest {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    IncomingRequest::new(
        Method::POST,
        Endpoint::ChatComplete,
        headers,
        RequestPayload::Json(body),
    )
}

fn gateway_context(
    transport: Arc<StubUpstream>,
    sink: Arc<MemoryLogSink>,
) -> GatewayContext {
    let mut providers = ProviderRegistry::new();
    providers.register("openai", Arc::new(OpenAiCompatibleAdapter::default()));
    GatewayContext::new(providers)
        .expect("gateway context")
        .with_transport(transport)
        .with_log_sink(sink)
}

struct MutatingHooks;

#[async_trait]
impl Hooks for MutatingHooks {
    fn create_span(
        &self,
        _request_json: Option<Value>,
        _provider: &str,
        _is_streaming: bool,
        _before_request_hooks: &[Value],
        _after_request_hooks: &[Value],
    ) -> HookSpanId {
        "span-mutate".to_string()
    }

    fn are_sync_hooks_available(&self, _span: &HookSpanId) -> bool {
        true
    }

    fn span_request_json(&self, _span: &HookSpanId) -> Option<Value> {
        Some(json!({"model": "gpt-4o", "messages": [], "redacted": true}))
    }

    async fn run_before_request_hooks(&self, _span: &HookSpanId) -> Result<HookOutcome> {
        Ok(HookOutcome {
            should_deny: false,
            results: vec![json!({"id": "input_guardrail_abc", "transformed": true})],
            transformed: true,
            response_json: None,
        })
    }

    async fn run_after_request_hooks(
        &self,
        _span: &HookSpanId,
        _response_json: Option<&Value>,
        _response_status: u16,
    ) -> Result<HookOutcome> {
        Ok(HookOutcome::default())
    }

    fn release_span(&self, _span: &HookSpanId) {}
}

#[tokio::test]
async fn mutated_request_params_reach_the_upstream() {
    let upstream = StubUpstream::new(|_, _| ok_json(json!({"ok": true})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx =
        gateway_context(upstream.clone(), sink).with_hooks(Arc::new(MutatingHooks));

    let root = target(json!({"provider": "openai", "apiKey": "sk-x"}));
    let response = execute_request(
        &ctx,
        &root,
        &chat_request(json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]})),
    )
    .await;

    assert_eq!(response.status, StatusCode::OK);
    let body = upstream.last_body().expect("body");
    assert_eq!(body["redacted"], true);
    assert!(body["messages"].as_array().expect("messages").is_empty());
}

struct AfterDenyHooks;

#[async_trait]
impl Hooks for AfterDenyHooks {
    fn create_span(
        &self,
        _request_json: Option<Value>,
        _provider: &str,
        _is_streaming: bool,
        _before_request_hooks: &[Value],
        _after_request_hooks: &[Value],
    ) -> HookSpanId {
        "span-after".to_string()
    }

    fn are_sync_hooks_available(&self, _span: &HookSpanId) -> bool {
        true
    }

    fn span_request_json(&self, _span: &HookSpanId) -> Option<Value> {
        None
    }

    async fn run_before_request_hooks(&self, _span: &HookSpanId) -> Result<HookOutcome> {
        Ok(HookOutcome {
            should_deny: false,
            results: vec![json!({"id": "default.wordCount", "verdict": true})],
            transformed: false,
            response_json: None,
        })
    }

    async fn run_after_request_hooks(
        &self,
        _span: &HookSpanId,
        _response_json: Option<&Value>,
        _response_status: u16,
    ) -> Result<HookOutcome> {
        Ok(HookOutcome {
            should_deny: true,
            results: vec![json!({"id": "default.moderateContent", "verdict": false})],
            transformed: false,
            response_json: None,
        })
    }

    fn release_span(&self, _span: &HookSpanId) {}
}

#[tokio::test]
async fn after_hook_denial_returns_446_with_both_result_sets() {
    let upstream = StubUpstream::new(|_, _| ok_json(json!({"ok": true})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx =
        gateway_context(upstream.clone(), sink).with_hooks(Arc::new(AfterDenyHooks));

    let root = target(json!({"provider": "openai", "apiKey": "sk-x"}));
    let response = execute_request(&ctx, &root, &chat_request(json!({"model": "gpt-4o"}))).await;

    assert_eq!(response.status.as_u16(), 446);
    assert_eq!(upstream.calls(), 1);
    let body = response.body_json().expect("body");
    assert_eq!(
        body["hook_results"]["before_request_hooks"][0]["verdict"],
        true
    );
    assert_eq!(
        body["hook_results"]["after_request_hooks"][0]["verdict"],
        false
    );
}

struct RewritingHooks;

#[async_trait]
impl Hooks for RewritingHooks {
    fn create_span(
        &self,
        _request_json: Option<Value>,
        _provider: &str,
        _is_streaming: bool,
        _before_request_hooks: &[Value],
        _after_request_hooks: &[Value],
    ) -> HookSpanId {
        "span-rewrite".to_string()
    }

    fn are_sync_hooks_available(&self, _span: &HookSpanId) -> bool {
        true
    }

    fn span_request_json(&self, _span: &HookSpanId) -> Option<Value> {
        None
    }

    async fn run_before_request_hooks(&self, _span: &HookSpanId) -> Result<HookOutcome> {
        Ok(HookOutcome::default())
    }

    async fn run_after_request_hooks(
        &self,
        _span: &HookSpanId,
        response_json: Option<&Value>,
        _response_status: u16,
    ) -> Result<HookOutcome> {
        let mut rewritten = response_json.cloned().unwrap_or_else(|| json!({}));
        if let Some(object) = rewritten.as_object_mut() {
            object.insert("moderated".to_string(), json!(true));
        }
        Ok(HookOutcome {
            should_deny: false,
            results: Vec::new(),
            transformed: true,
            response_json: Some(rewritten),
        })
    }

    fn release_span(&self, _span: &HookSpanId) {}
}

#[tokio::test]
async fn output_mutators_rewrite_the_response_body() {
    let upstream = StubUpstream::new(|_, _| ok_json(json!({"ok": true})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx =
        gateway_context(upstream.clone(), sink).with_hooks(Arc::new(RewritingHooks));

    let root = target(json!({"provider": "openai", "apiKey": "sk-x"}));
    let response = execute_request(&ctx, &root, &chat_request(json!({"model": "gpt-4o"}))).await;

    assert_eq!(response.status, StatusCode::OK);
    let body = response.body_json().expect("body");
    assert_eq!(body["ok"], true);
    assert_eq!(body["moderated"], true);
}

#[tokio::test]
async fn cache_hit_skips_the_upstream_call() {
    let upstream = StubUpstream::new(|_, _| ok_json(json!({"ok": true})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx = gateway_context(upstream.clone(), sink.clone())
        .with_cache(Arc::new(MemoryCache::default()));

    let root = target(json!({
        "provider": "openai",
        "apiKey": "sk-x",
        "cache": {"mode": "simple", "maxAge": 60},
    }));
    let request = chat_request(json!({"model": "gpt-4o"}));

    let first = execute_request(&ctx, &root, &request).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(upstream.calls(), 1);

    let second = execute_request(&ctx, &root, &request).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body_json().expect("body")["ok"], true);
    assert_eq!(upstream.calls(), 1);

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].cache_status.as_deref(), Some("miss"));
    assert_eq!(records[1].cache_status.as_deref(), Some("hit"));
    assert_eq!(records[1].retry_attempt, Some(0));
}

#[tokio::test]
async fn failed_responses_are_not_cached() {
    let upstream =
        StubUpstream::new(|_, _| GatewayResponse::json(StatusCode::BAD_GATEWAY, &json!({})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx = gateway_context(upstream.clone(), sink)
        .with_cache(Arc::new(MemoryCache::default()));

    let root = target(json!({
        "provider": "openai",
        "cache": {"mode": "simple", "maxAge": 60},
    }));
    let request = chat_request(json!({"model": "gpt-4o"}));

    execute_request(&ctx, &root, &request).await;
    execute_request(&ctx, &root, &request).await;
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn open_circuit_breaker_diverts_traffic() {
    let upstream = StubUpstream::new(|url, _| {
        if url.starts_with("https://a.test") {
            GatewayResponse::json(StatusCode::INTERNAL_SERVER_ERROR, &json!({"error": "down"}))
        } else {
            ok_json(json!({"ok": true}))
        }
    });
    let sink = Arc::new(MemoryLogSink::new());
    let ctx = gateway_context(upstream.clone(), sink)
        .with_circuit_breaker(Arc::new(MemoryCircuitBreaker::new()));

    let root = target(json!({
        "id": "cb-main",
        "strategy": {"mode": "fallback"},
        "targets": [
            {
                "provider": "openai",
                "customHost": "https://a.test/v1",
                "cb_config": {"failure_threshold": 1, "cooldown_seconds": 300},
            },
            {
                "provider": "openai",
                "customHost": "https://b.test/v1",
                "cb_config": {"failure_threshold": 1, "cooldown_seconds": 300},
            },
        ],
    }));
    let request = chat_request(json!({"model": "gpt-4o"}));

    // First pass: A fails (opening its breaker), B serves the response.
    let first = execute_request(&ctx, &root, &request).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(upstream.calls_to("https://a.test"), 1);

    // Second pass: A is filtered out before any call is made.
    let second = execute_request(&ctx, &root, &request).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(upstream.calls_to("https://a.test"), 1);
    assert_eq!(upstream.calls_to("https://b.test"), 2);
}

struct BudgetValidator;

#[async_trait]
impl PreRequestValidator for BudgetValidator {
    async fn validate(&self, _ctx: &RequestContext) -> Option<GatewayResponse> {
        Some(GatewayResponse::json(
            StatusCode::PAYMENT_REQUIRED,
            &json!({"status": "failure", "message": "Budget exhausted"}),
        ))
    }
}

#[tokio::test]
async fn validator_short_circuits_before_the_upstream() {
    let upstream = StubUpstream::new(|_, _| ok_json(json!({"ok": true})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx = gateway_context(upstream.clone(), sink.clone())
        .with_validator(Arc::new(BudgetValidator));

    let root = target(json!({"provider": "openai", "apiKey": "sk-x"}));
    let response = execute_request(&ctx, &root, &chat_request(json!({"model": "gpt-4o"}))).await;

    assert_eq!(response.status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(upstream.calls(), 0);
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn proxy_mode_forwards_client_headers() {
    let upstream = StubUpstream::new(|_, _| ok_json(json!({"ok": true})));
    let sink = Arc::new(MemoryLogSink::new());
    let ctx = gateway_context(upstream.clone(), sink)
        .with_proxy_ignore_headers(vec!["x-secret".to_string()]);

    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static("x-correlation-id"),
        HeaderValue::from_static("corr-7"),
    );
    headers.insert(
        HeaderName::from_static("x-secret"),
        HeaderValue::from_static("hidden"),
    );
    headers.insert(
        HeaderName::from_static("x-portkey-provider"),
        HeaderValue::from_static("openai"),
    );
    let request = IncomingRequest::new(
        Method::POST,
        Endpoint::Proxy,
        headers,
        RequestPayload::Json(json!({"model": "gpt-4o"})),
    );

    let root = target(json!({"provider": "openai", "customHost": "https://edge.test"}));
    let response = execute_request(&ctx, &root, &request).await;

    assert_eq!(response.status, StatusCode::OK);
    let sent = upstream.last_headers();
    assert_eq!(sent.get("x-correlation-id").unwrap(), "corr-7");
    assert!(sent.get("x-secret").is_none());
    assert!(sent.get("x-portkey-provider").is_none());
}
