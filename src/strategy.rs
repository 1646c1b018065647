use serde_json::Value;

use crate::conditional::RouteContext;
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::header_config::METADATA_HEADER;
use crate::request::IncomingRequest;
use crate::resolver::try_targets_internal;
use crate::response::GatewayResponse;
use crate::target::{InheritedConfig, StrategyMode, Target};

/// Dispatches a strategy node onto its policy. `children` pairs each child
/// with its original index so json paths stay stable across circuit-breaker
/// filtering.
pub(crate) async fn execute(
    ctx: &GatewayContext,
    node: &Target,
    mode: StrategyMode,
    children: Vec<(usize, Target)>,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    json_path: &str,
) -> Result<GatewayResponse> {
    match mode {
        StrategyMode::Single => execute_single(ctx, children, request, inherited, json_path).await,
        StrategyMode::Fallback => {
            execute_fallback(ctx, node, children, request, inherited, json_path).await
        }
        StrategyMode::Loadbalance => {
            execute_loadbalance(ctx, children, request, inherited, json_path).await
        }
        StrategyMode::Conditional => {
            execute_conditional(ctx, node, children, request, inherited, json_path).await
        }
    }
}

fn child_path(json_path: &str, index: usize) -> String {
    format!("{json_path}.targets[{index}]")
}

async fn execute_single(
    ctx: &GatewayContext,
    children: Vec<(usize, Target)>,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    json_path: &str,
) -> Result<GatewayResponse> {
    let (index, child) = children
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::gateway("The single strategy has no targets"))?;
    try_targets_internal(
        ctx,
        child,
        request,
        child_path(json_path, index),
        inherited.clone(),
    )
    .await
}

/// Walks children in order until one produces a response worth keeping:
/// outside the configured status codes, or simply ok, or carrying the
/// gateway-exception marker (the gateway itself refused; siblings cannot
/// do better).
async fn execute_fallback(
    ctx: &GatewayContext,
    node: &Target,
    children: Vec<(usize, Target)>,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    json_path: &str,
) -> Result<GatewayResponse> {
    let on_status_codes = node
        .strategy
        .as_ref()
        .and_then(|strategy| strategy.on_status_codes.clone());

    let mut last_response: Option<GatewayResponse> = None;
    for (index, child) in children {
        let response = try_targets_internal(
            ctx,
            child,
            request,
            child_path(json_path, index),
            inherited.clone(),
        )
        .await?;
        if should_stop_fallback(&response, on_status_codes.as_deref()) {
            return Ok(response);
        }
        tracing::debug!(
            status = response.status.as_u16(),
            path = %child_path(json_path, index),
            "fallback target failed, trying next"
        );
        last_response = Some(response);
    }

    last_response.ok_or_else(|| GatewayError::gateway("All fallback attempts failed"))
}

fn should_stop_fallback(response: &GatewayResponse, on_status_codes: Option<&[u16]>) -> bool {
    if response.has_gateway_exception() {
        return true;
    }
    match on_status_codes {
        Some(codes) => !codes.contains(&response.status.as_u16()),
        None => response.is_ok(),
    }
}

/// Draws one child with probability weight/total. Weights default to 1;
/// a tree whose weights sum to zero cannot route anywhere.
async fn execute_loadbalance(
    ctx: &GatewayContext,
    mut children: Vec<(usize, Target)>,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    json_path: &str,
) -> Result<GatewayResponse> {
    let total: f64 = children
        .iter()
        .map(|(_, child)| child.effective_weight())
        .sum();
    if total <= 0.0 || children.is_empty() {
        return Err(GatewayError::gateway(
            "No provider selected, please check the weights",
        ));
    }

    let draw = rand::random::<f64>() * total;
    let mut pick = children.len() - 1;
    let mut cumulative = 0.0;
    for (position, (_, child)) in children.iter().enumerate() {
        cumulative += child.effective_weight();
        if draw < cumulative {
            pick = position;
            break;
        }
    }

    let (index, child) = children.swap_remove(pick);
    try_targets_internal(
        ctx,
        child,
        request,
        child_path(json_path, index),
        inherited.clone(),
    )
    .await
}

/// Delegates child selection to the external conditional router; any
/// misconfiguration surfaces as a router error (HTTP 400 at the edge).
async fn execute_conditional(
    ctx: &GatewayContext,
    node: &Target,
    children: Vec<(usize, Target)>,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    json_path: &str,
) -> Result<GatewayResponse> {
    let router = ctx
        .conditional_router
        .as_ref()
        .ok_or_else(|| GatewayError::router("Conditional router is not configured"))?;

    let metadata = request
        .headers
        .get(METADATA_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let params = request.payload.json_or_empty();
    let route_context = RouteContext { metadata, params };

    let selected = router
        .select_target(node, &route_context)
        .map_err(GatewayError::Router)?;
    let (index, child) = children
        .into_iter()
        .find(|(index, _)| *index == selected)
        .ok_or_else(|| {
            GatewayError::router(format!(
                "Conditional router selected an invalid target index {selected}"
            ))
        })?;

    try_targets_internal(
        ctx,
        child,
        request,
        child_path(json_path, index),
        inherited.clone(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use bytes::Bytes;

    use crate::response::GATEWAY_EXCEPTION_HEADER;

    use super::*;

    fn response(status: StatusCode) -> GatewayResponse {
        GatewayResponse::new(status, HeaderMap::new(), Bytes::new())
    }

    #[test]
    fn fallback_stops_on_ok_without_status_list() {
        assert!(should_stop_fallback(&response(StatusCode::OK), None));
        assert!(!should_stop_fallback(
            &response(StatusCode::INTERNAL_SERVER_ERROR),
            None
        ));
    }

    #[test]
    fn fallback_with_status_list_only_continues_on_listed_codes() {
        let codes = [429u16, 503];
        assert!(!should_stop_fallback(
            &response(StatusCode::SERVICE_UNAVAILABLE),
            Some(codes.as_slice())
        ));
        // a 500 is not in the list, so the fallback keeps this response
        assert!(should_stop_fallback(
            &response(StatusCode::INTERNAL_SERVER_ERROR),
            Some(codes.as_slice())
        ));
    }

    #[test]
    fn gateway_exceptions_always_stop_the_walk() {
        let mut failed = response(StatusCode::INTERNAL_SERVER_ERROR);
        failed
            .headers
            .insert(GATEWAY_EXCEPTION_HEADER, HeaderValue::from_static("true"));
        assert!(should_stop_fallback(&failed, None));
        assert!(should_stop_fallback(&failed, Some(&[500u16][..])));
    }
}
