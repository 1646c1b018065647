use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cache::now_epoch_seconds;
use crate::response::GatewayResponse;
use crate::target::{CircuitBreakerConfig, Target};

/// Circuit-breaker store consulted by the resolver. `is_open` flags are
/// stamped onto children before resolution; every leaf response under an
/// inherited breaker id is reported back here.
#[async_trait]
pub trait CircuitBreakerHooks: Send + Sync {
    async fn handle_response(
        &self,
        response: &GatewayResponse,
        id: &str,
        config: Option<&CircuitBreakerConfig>,
        json_path: &str,
    );

    /// Marks tree nodes whose breaker is currently open. `base_path` is the
    /// json path of `target` itself within the routing tree.
    async fn stamp_open_flags(&self, id: &str, target: &mut Target, base_path: &str);
}

#[derive(Clone, Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until_epoch_seconds: Option<u64>,
}

impl BreakerState {
    fn is_open(&self, now: u64) -> bool {
        match self.open_until_epoch_seconds {
            Some(until) => now < until,
            None => false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until_epoch_seconds = None;
    }

    fn record_failure(&mut self, now: u64, config: &CircuitBreakerConfig) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= config.failure_threshold {
            self.open_until_epoch_seconds = Some(now.saturating_add(config.cooldown_seconds));
        }
    }
}

/// In-memory breaker store keyed by `(config id, json path)`.
#[derive(Debug, Default)]
pub struct MemoryCircuitBreaker {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl MemoryCircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_key(id: &str, json_path: &str) -> String {
        format!("{id}:{json_path}")
    }

    fn counts_as_failure(response: &GatewayResponse, config: &CircuitBreakerConfig) -> bool {
        let status = response.status.as_u16();
        if config.failure_status_codes.is_empty() {
            response.status.is_server_error() || status == 429
        } else {
            config.failure_status_codes.contains(&status)
        }
    }

    async fn handle_response_at(
        &self,
        response: &GatewayResponse,
        id: &str,
        config: Option<&CircuitBreakerConfig>,
        json_path: &str,
        now: u64,
    ) {
        let Some(config) = config else {
            return;
        };
        let key = Self::state_key(id, json_path);
        let mut states = self.states.lock().await;
        let state = states.entry(key).or_default();
        if Self::counts_as_failure(response, config) {
            state.record_failure(now, config);
            if state.is_open(now) {
                tracing::warn!(
                    breaker = id,
                    path = json_path,
                    failures = state.consecutive_failures,
                    "circuit breaker opened"
                );
            }
        } else {
            state.record_success();
        }
    }

    async fn stamp_open_flags_at(&self, id: &str, target: &mut Target, path: &str, now: u64) {
        let states = self.states.lock().await;
        stamp_recursive(&states, id, target, path, now);
    }
}

fn stamp_recursive(
    states: &HashMap<String, BreakerState>,
    id: &str,
    target: &mut Target,
    path: &str,
    now: u64,
) {
    if let Some(children) = target.targets.as_mut() {
        for (index, child) in children.iter_mut().enumerate() {
            let child_path = format!("{path}.targets[{index}]");
            let key = MemoryCircuitBreaker::state_key(id, &child_path);
            if states
                .get(&key)
                .map(|state| state.is_open(now))
                .unwrap_or(false)
            {
                child.is_open = Some(true);
            }
            stamp_recursive(states, id, child, &child_path, now);
        }
    }
}

#[async_trait]
impl CircuitBreakerHooks for MemoryCircuitBreaker {
    async fn handle_response(
        &self,
        response: &GatewayResponse,
        id: &str,
        config: Option<&CircuitBreakerConfig>,
        json_path: &str,
    ) {
        self.handle_response_at(response, id, config, json_path, now_epoch_seconds())
            .await;
    }

    async fn stamp_open_flags(&self, id: &str, target: &mut Target, base_path: &str) {
        self.stamp_open_flags_at(id, target, base_path, now_epoch_seconds())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, StatusCode};
    use bytes::Bytes;
    use serde_json::json;

    use super::*;

    fn response(status: StatusCode) -> GatewayResponse {
        GatewayResponse::new(status, HeaderMap::new(), Bytes::new())
    }

    fn config(threshold: u32, cooldown: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown_seconds: cooldown,
            failure_status_codes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures_and_cools_down() {
        let breaker = MemoryCircuitBreaker::new();
        let cb = config(2, 30);
        let path = ".targets[0]";

        breaker
            .handle_response_at(&response(StatusCode::BAD_GATEWAY), "cb-1", Some(&cb), path, 100)
            .await;
        let states = breaker.states.lock().await;
        assert!(!states[&MemoryCircuitBreaker::state_key("cb-1", path)].is_open(100));
        drop(states);

        breaker
            .handle_response_at(&response(StatusCode::BAD_GATEWAY), "cb-1", Some(&cb), path, 101)
            .await;
        let states = breaker.states.lock().await;
        let state = &states[&MemoryCircuitBreaker::state_key("cb-1", path)];
        assert!(state.is_open(102));
        assert!(!state.is_open(131));
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let breaker = MemoryCircuitBreaker::new();
        let cb = config(2, 30);
        let path = ".targets[1]";

        breaker
            .handle_response_at(&response(StatusCode::SERVICE_UNAVAILABLE), "cb-1", Some(&cb), path, 100)
            .await;
        breaker
            .handle_response_at(&response(StatusCode::OK), "cb-1", Some(&cb), path, 101)
            .await;
        breaker
            .handle_response_at(&response(StatusCode::SERVICE_UNAVAILABLE), "cb-1", Some(&cb), path, 102)
            .await;

        let states = breaker.states.lock().await;
        assert!(!states[&MemoryCircuitBreaker::state_key("cb-1", path)].is_open(103));
    }

    #[tokio::test]
    async fn stamping_marks_open_children() {
        let breaker = MemoryCircuitBreaker::new();
        let cb = config(1, 300);
        breaker
            .handle_response_at(
                &response(StatusCode::INTERNAL_SERVER_ERROR),
                "cb-1",
                Some(&cb),
                ".targets[0]",
                100,
            )
            .await;

        let mut target: Target = serde_json::from_value(json!({
            "strategy": {"mode": "fallback"},
            "targets": [{"provider": "openai"}, {"provider": "anthropic"}],
        }))
        .expect("target");

        breaker.stamp_open_flags_at("cb-1", &mut target, "", 101).await;
        let children = target.targets.expect("children");
        assert_eq!(children[0].is_open, Some(true));
        assert_eq!(children[1].is_open, None);
    }
}
