use futures_util::future::BoxFuture;

use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::header_config::build_target_from_headers;
use crate::hooks::{HookKind, HookStage, expand_hook_shorthands};
use crate::processor;
use crate::request::IncomingRequest;
use crate::response::{GatewayResponse, shape_error};
use crate::strategy;
use crate::target::{InheritedConfig, Target};

/// Resolves a request against the full target tree. The tree is derived
/// from the request's own headers (`x-portkey-config` or the flat provider
/// header family).
pub async fn handle_request(ctx: &GatewayContext, request: &IncomingRequest) -> GatewayResponse {
    let target = match build_target_from_headers(&request.headers) {
        Ok(target) => target,
        Err(err) => return shape_error(&err),
    };
    execute_request(ctx, &target, request).await
}

/// Resolves a request against a caller-supplied target tree.
pub async fn execute_request(
    ctx: &GatewayContext,
    target: &Target,
    request: &IncomingRequest,
) -> GatewayResponse {
    try_targets_recursively(ctx, target, request, "", InheritedConfig::default()).await
}

/// Walks one subtree and always emits exactly one terminal response.
/// Router errors become a 400; everything else a marked 500.
pub async fn try_targets_recursively(
    ctx: &GatewayContext,
    target: &Target,
    request: &IncomingRequest,
    json_path: &str,
    inherited: InheritedConfig,
) -> GatewayResponse {
    match try_targets_internal(
        ctx,
        target.clone(),
        request,
        json_path.to_string(),
        inherited,
    )
    .await
    {
        Ok(response) => response,
        Err(err) => shape_error(&err),
    }
}

/// Recursive walk. Only router errors travel upward as errors (so nested
/// conditional misconfiguration reaches the edge as a 400); anything else
/// is shaped in place so strategies see a response, not a panic path.
pub(crate) fn try_targets_internal<'a>(
    ctx: &'a GatewayContext,
    mut target: Target,
    request: &'a IncomingRequest,
    json_path: String,
    inherited: InheritedConfig,
) -> BoxFuture<'a, Result<GatewayResponse>> {
    Box::pin(async move {
        // Base of the walk: the root may carry default guardrails in
        // shorthand form; expand them before they enter the inherited
        // record.
        if inherited.is_empty() {
            if let Some(shorthands) = target.default_input_guardrails.take() {
                target.default_input_guardrails = Some(expand_hook_shorthands(
                    &shorthands,
                    HookStage::Input,
                    HookKind::Guardrail,
                ));
            }
            if let Some(shorthands) = target.default_output_guardrails.take() {
                target.default_output_guardrails = Some(expand_hook_shorthands(
                    &shorthands,
                    HookStage::Output,
                    HookKind::Guardrail,
                ));
            }
        }

        let current_inherited = inherited.merged_with(&target);
        current_inherited.apply_to(&mut target);
        normalize_hook_shorthands(&mut target);

        if let (Some(id), Some(breaker)) =
            (current_inherited.id.as_deref(), &ctx.circuit_breaker)
        {
            breaker.stamp_open_flags(id, &mut target, &json_path).await;
        }

        if let Some(mode) = target.strategy_mode() {
            if target.targets.is_some() {
                let children =
                    filtered_children(&mut target, current_inherited.id.is_some());
                let result = strategy::execute(
                    ctx,
                    &target,
                    mode,
                    children,
                    request,
                    &current_inherited,
                    &json_path,
                )
                .await;
                return match result {
                    Ok(response) => Ok(response),
                    Err(err @ GatewayError::Router(_)) => Err(err),
                    Err(err) => Ok(shape_error(&err)),
                };
            }
        }

        // No strategy mode: the node is a leaf provider.
        let response =
            processor::try_post(ctx, target.clone(), request, &current_inherited, &json_path)
                .await;
        if let (Some(id), Some(breaker)) =
            (current_inherited.id.as_deref(), &ctx.circuit_breaker)
        {
            breaker
                .handle_response(&response, id, target.cb_config.as_ref(), &json_path)
                .await;
        }
        Ok(response)
    })
}

/// Rewrites guardrail/mutator shorthand on the node into the canonical hook
/// arrays the leaf pipeline consumes.
fn normalize_hook_shorthands(target: &mut Target) {
    let mut before = target.before_request_hooks.take().unwrap_or_default();
    if let Some(shorthands) = target.input_guardrails.take() {
        before.extend(expand_hook_shorthands(
            &shorthands,
            HookStage::Input,
            HookKind::Guardrail,
        ));
    }
    if let Some(shorthands) = target.input_mutators.take() {
        before.extend(expand_hook_shorthands(
            &shorthands,
            HookStage::Input,
            HookKind::Mutator,
        ));
    }
    if !before.is_empty() {
        target.before_request_hooks = Some(before);
    }

    let mut after = target.after_request_hooks.take().unwrap_or_default();
    if let Some(shorthands) = target.output_guardrails.take() {
        after.extend(expand_hook_shorthands(
            &shorthands,
            HookStage::Output,
            HookKind::Guardrail,
        ));
    }
    if let Some(shorthands) = target.output_mutators.take() {
        after.extend(expand_hook_shorthands(
            &shorthands,
            HookStage::Output,
            HookKind::Mutator,
        ));
    }
    if !after.is_empty() {
        target.after_request_hooks = Some(after);
    }
}

/// Pairs each child with its original index, dropping open-breaker children
/// when a breaker id is inherited. A fully open sibling set keeps every
/// child: serving through an open breaker beats serving nothing.
fn filtered_children(target: &mut Target, breaker_active: bool) -> Vec<(usize, Target)> {
    let children: Vec<(usize, Target)> = target
        .targets
        .take()
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .collect();

    if !breaker_active {
        return children;
    }

    let healthy: Vec<(usize, Target)> = children
        .iter()
        .filter(|(_, child)| child.is_open != Some(true))
        .cloned()
        .collect();
    if healthy.is_empty() {
        children
    } else {
        healthy
    }
}
