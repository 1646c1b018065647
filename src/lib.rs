//! Routing and execution core for an OpenAI-style AI-provider gateway.
//!
//! A request arrives with a declarative routing config (either the
//! `x-portkey-config` header or a flat per-provider header family), gets
//! resolved against a tree of targets under a strategy (single, fallback,
//! loadbalance, conditional), and is executed against the selected provider
//! through a pipeline of hooks, provider mapping, caching, validation, and
//! a retrying upstream exchange.
//!
//! The crate owns the routing tree and the per-target pipeline. Provider
//! wire formats, the guardrail evaluation DSL, conditional-routing
//! conditions, cache backends, and log transport plug in behind traits on
//! [`GatewayContext`].

pub mod cache;
pub mod casing;
pub mod circuit;
pub mod conditional;
mod context;
mod error;
pub mod header_config;
pub mod hooks;
pub mod logging;
mod outgoing_body;
mod outgoing_headers;
mod processor;
pub mod provider;
pub mod request;
mod resolver;
pub mod response;
pub mod retry;
mod strategy;
pub mod target;
pub mod transport;

pub use context::{CUSTOM_HEADERS_TO_IGNORE_ENV, GatewayContext, PreRequestValidator};
pub use error::{GatewayError, Result};
pub use header_config::build_target_from_headers;
pub use outgoing_body::{BodyPlan, build_request_body, plan_request_body};
pub use outgoing_headers::{build_final_headers, post_process_headers};
pub use processor::try_post;
pub use request::{Endpoint, IncomingRequest, RequestPayload};
pub use resolver::{execute_request, handle_request, try_targets_recursively};
pub use response::{
    GATEWAY_EXCEPTION_HEADER, GatewayResponse, hooks_failed_response, shape_error,
};
pub use target::{
    CacheSettings, CircuitBreakerConfig, InheritedConfig, RetryConfig, StrategyConfig,
    StrategyMode, Target,
};
