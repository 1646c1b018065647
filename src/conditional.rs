use serde_json::Value;

use crate::target::Target;

/// Inputs the conditional router evaluates its conditions against:
/// request metadata from the `x-portkey-metadata` header and the parsed
/// JSON body (`{}` when the body is not JSON).
#[derive(Clone, Debug)]
pub struct RouteContext {
    pub metadata: Value,
    pub params: Value,
}

/// External evaluator for `conditional` strategy nodes. The condition DSL
/// is the evaluator's business; the core only consumes the selected child
/// index and maps failures to router errors (HTTP 400 at the edge).
pub trait ConditionalRouter: Send + Sync {
    /// Returns the index of the child to route to.
    fn select_target(
        &self,
        target: &Target,
        context: &RouteContext,
    ) -> std::result::Result<usize, String>;
}
