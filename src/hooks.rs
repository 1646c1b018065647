use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::casing::to_camel_case;
use crate::error::Result;

/// Which side of the upstream call a hook runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookStage {
    Input,
    Output,
}

impl HookStage {
    fn as_str(self) -> &'static str {
        match self {
            HookStage::Input => "input",
            HookStage::Output => "output",
        }
    }
}

/// Whether a hook asserts (guardrail) or rewrites (mutator).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Guardrail,
    Mutator,
}

impl HookKind {
    fn as_str(self) -> &'static str {
        match self {
            HookKind::Guardrail => "guardrail",
            HookKind::Mutator => "mutator",
        }
    }
}

/// Keys lifted out of a shorthand declaration into the hook object itself.
/// Everything left over is a check.
const HOOK_PROPERTY_KEYS: &[&str] = &[
    "deny",
    "on_fail",
    "on_success",
    "async",
    "id",
    "type",
    "guardrail_version_id",
];

/// Expands one compact guardrail/mutator declaration into the canonical
/// hook object the hook runtime consumes. The generated id carries a random
/// base-36 suffix, so callers must not compare ids for equality.
pub fn expand_hook_shorthand(shorthand: &Value, stage: HookStage, kind: HookKind) -> Value {
    let mut source = match shorthand {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let mut hook = Map::new();
    hook.insert(
        "id".to_string(),
        Value::String(format!(
            "{}_guardrail_{}",
            stage.as_str(),
            random_base36_suffix()
        )),
    );
    hook.insert("type".to_string(), Value::String(kind.as_str().to_string()));

    for key in HOOK_PROPERTY_KEYS {
        if let Some(value) = source.remove(*key) {
            hook.insert(to_camel_case(key), value);
        }
    }

    let checks: Vec<Value> = source
        .into_iter()
        .map(|(key, value)| {
            let check_id = if key.contains('.') {
                key
            } else {
                format!("default.{key}")
            };
            let is_enabled = value.get("is_enabled").cloned().unwrap_or(Value::Null);
            json!({
                "id": check_id,
                "parameters": value,
                "is_enabled": is_enabled,
            })
        })
        .collect();
    hook.insert("checks".to_string(), Value::Array(checks));

    Value::Object(hook)
}

/// Expands a whole shorthand array, tolerating non-object entries.
pub fn expand_hook_shorthands(
    shorthands: &[Value],
    stage: HookStage,
    kind: HookKind,
) -> Vec<Value> {
    shorthands
        .iter()
        .map(|shorthand| expand_hook_shorthand(shorthand, stage, kind))
        .collect()
}

fn random_base36_suffix() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = rand::random::<u64>();
    let mut out = String::with_capacity(3);
    for _ in 0..3 {
        out.push(ALPHABET[(n % 36) as usize] as char);
        n /= 36;
    }
    out
}

/// Identifier of one hook-runtime span. One span is created per leaf call
/// and released on terminal emission.
pub type HookSpanId = String;

/// Result of running one hook phase on a span.
#[derive(Clone, Debug, Default)]
pub struct HookOutcome {
    /// The runtime voted to block the request/response.
    pub should_deny: bool,
    /// Per-hook result payloads, surfaced in the 446 body and in logs.
    pub results: Vec<Value>,
    /// A mutator rewrote the span's request JSON.
    pub transformed: bool,
    /// Present when an output mutator rewrote the response body.
    pub response_json: Option<Value>,
}

/// The hook runtime the core delegates guardrail and mutator execution to.
/// The evaluation DSL behind each check is the runtime's business; the core
/// only sequences phases and honors verdicts.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Opens a span for one leaf execution.
    fn create_span(
        &self,
        request_json: Option<Value>,
        provider: &str,
        is_streaming: bool,
        before_request_hooks: &[Value],
        after_request_hooks: &[Value],
    ) -> HookSpanId;

    /// True when synchronous after-request hooks exist on the span; the
    /// processor only parses upstream bodies when it must feed them.
    fn are_sync_hooks_available(&self, span: &HookSpanId) -> bool;

    /// The span's (possibly mutated) request payload.
    fn span_request_json(&self, span: &HookSpanId) -> Option<Value>;

    async fn run_before_request_hooks(&self, span: &HookSpanId) -> Result<HookOutcome>;

    async fn run_after_request_hooks(
        &self,
        span: &HookSpanId,
        response_json: Option<&Value>,
        response_status: u16,
    ) -> Result<HookOutcome>;

    fn release_span(&self, span: &HookSpanId);
}

/// Hook runtime that runs nothing. The default collaborator when an
/// embedding host wires no guardrails.
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {
    fn create_span(
        &self,
        _request_json: Option<Value>,
        _provider: &str,
        _is_streaming: bool,
        _before_request_hooks: &[Value],
        _after_request_hooks: &[Value],
    ) -> HookSpanId {
        String::new()
    }

    fn are_sync_hooks_available(&self, _span: &HookSpanId) -> bool {
        false
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
        _response_json: Option<&Value>,
        _response_status: u16,
    ) -> Result<HookOutcome> {
        Ok(HookOutcome::default())
    }

    fn release_span(&self, _span: &HookSpanId) {}
}
