use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{CacheStore, NoopCache};
use crate::circuit::CircuitBreakerHooks;
use crate::conditional::ConditionalRouter;
use crate::error::Result;
use crate::hooks::{Hooks, NoopHooks};
use crate::logging::{LogSink, TracingLogSink};
use crate::provider::{ProviderRegistry, RequestContext};
use crate::response::GatewayResponse;
use crate::transport::{ReqwestTransport, UpstreamTransport};

/// Extra client header names dropped in proxy passthrough, on top of the
/// built-in ignore set.
pub const CUSTOM_HEADERS_TO_IGNORE_ENV: &str = "CUSTOM_HEADERS_TO_IGNORE";

/// Pre-flight gate consulted after the cache and before the upstream call
/// (virtual-key budgets, quotas). Returning a response short-circuits the
/// pipeline.
#[async_trait]
pub trait PreRequestValidator: Send + Sync {
    async fn validate(&self, ctx: &RequestContext) -> Option<GatewayResponse>;
}

/// The collaborators one request resolution runs against. Shared across
/// concurrent requests; every member is thread-safe.
#[derive(Clone)]
pub struct GatewayContext {
    pub providers: ProviderRegistry,
    pub transport: Arc<dyn UpstreamTransport>,
    pub hooks: Arc<dyn Hooks>,
    pub cache: Arc<dyn CacheStore>,
    pub circuit_breaker: Option<Arc<dyn CircuitBreakerHooks>>,
    pub conditional_router: Option<Arc<dyn ConditionalRouter>>,
    pub validator: Option<Arc<dyn PreRequestValidator>>,
    pub log_sink: Arc<dyn LogSink>,
    pub proxy_ignore_headers: Vec<String>,
}

impl GatewayContext {
    pub fn new(providers: ProviderRegistry) -> Result<Self> {
        Ok(Self {
            providers,
            transport: Arc::new(ReqwestTransport::new()?),
            hooks: Arc::new(NoopHooks),
            cache: Arc::new(NoopCache),
            circuit_breaker: None,
            conditional_router: None,
            validator: None,
            log_sink: Arc::new(TracingLogSink),
            proxy_ignore_headers: proxy_ignore_headers_from_env(),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn UpstreamTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreakerHooks>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_conditional_router(mut self, router: Arc<dyn ConditionalRouter>) -> Self {
        self.conditional_router = Some(router);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn PreRequestValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_proxy_ignore_headers(mut self, headers: Vec<String>) -> Self {
        self.proxy_ignore_headers = headers;
        self
    }
}

fn proxy_ignore_headers_from_env() -> Vec<String> {
    std::env::var(CUSTOM_HEADERS_TO_IGNORE_ENV)
        .map(|raw| {
            raw.split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_list_parsing_trims_and_lowercases() {
        let parsed: Vec<String> = " X-Debug , x-internal-token ,"
            .split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        assert_eq!(parsed, vec!["x-debug".to_string(), "x-internal-token".to_string()]);
    }
}
