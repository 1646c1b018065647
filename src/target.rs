use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Selection policy for a strategy node's children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    Single,
    Fallback,
    Loadbalance,
    Conditional,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StrategyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_status_codes: Option<Vec<u16>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_retry_status_codes")]
    pub on_status_codes: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_retry_after_header: Option<bool>,
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 0,
            on_status_codes: default_retry_status_codes(),
            use_retry_after_header: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,
}

/// Inner keys stay snake_case: `cb_config` is on the casing preserve list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub failure_status_codes: Vec<u16>,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    30
}

/// A node in the routing tree: either an inner strategy node with `targets`
/// or a leaf provider. Leaf fields on an inner node only serve as an
/// inheritance source. Provider-specific fields (resource names, regions,
/// service accounts) ride in `extras` untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<Target>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_host: Option<String>,
    #[serde(
        default,
        rename = "override_params",
        skip_serializing_if = "Option::is_none"
    )]
    pub override_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_headers: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_request_hooks: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_request_hooks: Option<Vec<Value>>,
    #[serde(
        default,
        rename = "input_guardrails",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_guardrails: Option<Vec<Value>>,
    #[serde(
        default,
        rename = "output_guardrails",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_guardrails: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mutators: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mutators: Option<Vec<Value>>,
    #[serde(
        default,
        rename = "default_input_guardrails",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_input_guardrails: Option<Vec<Value>>,
    #[serde(
        default,
        rename = "default_output_guardrails",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_output_guardrails: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_open_ai_compliance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "cb_config", skip_serializing_if = "Option::is_none")]
    pub cb_config: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_open: Option<bool>,

    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Target {
    pub fn strategy_mode(&self) -> Option<StrategyMode> {
        self.strategy.as_ref().and_then(|strategy| strategy.mode)
    }

    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

/// Settings flowing down the target walk. The current node always wins:
/// `override_params` merges shallowly (current keys over inherited), list
/// fields replace wholesale, `retry` and `cache` swap atomically.
#[derive(Clone, Debug, Default)]
pub struct InheritedConfig {
    pub id: Option<String>,
    pub override_params: Option<Map<String, Value>>,
    pub retry: Option<RetryConfig>,
    pub cache: Option<CacheSettings>,
    pub request_timeout: Option<u64>,
    pub default_input_guardrails: Option<Vec<Value>>,
    pub default_output_guardrails: Option<Vec<Value>>,
    pub strict_open_ai_compliance: Option<bool>,
    pub forward_headers: Option<Vec<String>>,
    pub custom_host: Option<String>,
    pub before_request_hooks: Option<Vec<Value>>,
    pub after_request_hooks: Option<Vec<Value>>,
}

impl InheritedConfig {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.override_params.is_none()
            && self.retry.is_none()
            && self.cache.is_none()
            && self.request_timeout.is_none()
            && self.default_input_guardrails.is_none()
            && self.default_output_guardrails.is_none()
            && self.strict_open_ai_compliance.is_none()
            && self.forward_headers.is_none()
            && self.custom_host.is_none()
            && self.before_request_hooks.is_none()
            && self.after_request_hooks.is_none()
    }

    /// Merges this snapshot with the fields a node declares, preferring the
    /// node. Returns the snapshot the node's children (or its leaf
    /// execution) will see.
    pub fn merged_with(&self, node: &Target) -> InheritedConfig {
        let override_params = match (&self.override_params, &node.override_params) {
            (Some(inherited), Some(current)) => {
                let mut merged = inherited.clone();
                for (key, value) in current {
                    merged.insert(key.clone(), value.clone());
                }
                Some(merged)
            }
            (None, Some(current)) => Some(current.clone()),
            (inherited, None) => inherited.clone(),
        };

        InheritedConfig {
            id: node.id.clone().or_else(|| self.id.clone()),
            override_params,
            retry: node.retry.clone().or_else(|| self.retry.clone()),
            cache: node.cache.clone().or_else(|| self.cache.clone()),
            request_timeout: node.request_timeout.or(self.request_timeout),
            default_input_guardrails: node
                .default_input_guardrails
                .clone()
                .or_else(|| self.default_input_guardrails.clone()),
            default_output_guardrails: node
                .default_output_guardrails
                .clone()
                .or_else(|| self.default_output_guardrails.clone()),
            strict_open_ai_compliance: node
                .strict_open_ai_compliance
                .or(self.strict_open_ai_compliance),
            forward_headers: node
                .forward_headers
                .clone()
                .or_else(|| self.forward_headers.clone()),
            custom_host: node.custom_host.clone().or_else(|| self.custom_host.clone()),
            before_request_hooks: node
                .before_request_hooks
                .clone()
                .or_else(|| self.before_request_hooks.clone()),
            after_request_hooks: node
                .after_request_hooks
                .clone()
                .or_else(|| self.after_request_hooks.clone()),
        }
    }

    /// Copies inherited fields onto a node that did not declare them, so
    /// leaf execution sees them as its own. `override_params` is always
    /// written back: the merge above already folded the node's own keys in.
    pub fn apply_to(&self, node: &mut Target) {
        if self.override_params.is_some() {
            node.override_params = self.override_params.clone();
        }
        if node.forward_headers.is_none() {
            node.forward_headers = self.forward_headers.clone();
        }
        if node.before_request_hooks.is_none() {
            node.before_request_hooks = self.before_request_hooks.clone();
        }
        if node.after_request_hooks.is_none() {
            node.after_request_hooks = self.after_request_hooks.clone();
        }
        if node.default_input_guardrails.is_none() {
            node.default_input_guardrails = self.default_input_guardrails.clone();
        }
        if node.default_output_guardrails.is_none() {
            node.default_output_guardrails = self.default_output_guardrails.clone();
        }
        if node.custom_host.is_none() {
            node.custom_host = self.custom_host.clone();
        }
    }
}
