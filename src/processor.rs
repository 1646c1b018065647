use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::cache::CacheQuery;
use crate::context::GatewayContext;
use crate::error::{GatewayError, Result};
use crate::hooks::HookSpanId;
use crate::logging::LogRecord;
use crate::outgoing_body::{build_request_body, plan_request_body};
use crate::outgoing_headers::build_final_headers;
use crate::provider::{ProviderAdapter, RequestContext};
use crate::request::{IncomingRequest, RequestPayload};
use crate::response::{GatewayResponse, hooks_failed_response, shape_error};
use crate::retry::retry_request;
use crate::target::{CacheSettings, InheritedConfig, Target};
use crate::transport::FetchOptions;

/// Executes one leaf target: before-hooks, provider mapping, cache,
/// validation, the retrying upstream exchange, after-hooks, and the log
/// record that ties them together. Never errors out; failures are shaped
/// into the uniform failure response.
pub async fn try_post(
    ctx: &GatewayContext,
    options: Target,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    json_path: &str,
) -> GatewayResponse {
    let started = Instant::now();
    let mut log = LogRecord {
        provider: options.provider.clone(),
        json_path: (!json_path.is_empty()).then(|| json_path.to_string()),
        request_method: Some(request.method.to_string()),
        ..LogRecord::default()
    };

    match run_leaf(ctx, options, request, inherited, &mut log, started).await {
        Ok(response) => response,
        Err(err) => {
            let shaped = shape_error(&err);
            emit_log(ctx, &mut log, &shaped, started, None);
            shaped
        }
    }
}

async fn run_leaf(
    ctx: &GatewayContext,
    options: Target,
    request: &IncomingRequest,
    inherited: &InheritedConfig,
    log: &mut LogRecord,
    started: Instant,
) -> Result<GatewayResponse> {
    let provider = options
        .provider
        .clone()
        .ok_or_else(|| GatewayError::gateway("No provider specified in the target"))?;
    let adapter = ctx.providers.get(&provider)?;

    let mut rc = RequestContext {
        provider,
        endpoint: request.endpoint.clone(),
        method: request.method.clone(),
        client_headers: request.headers.clone(),
        payload: request.payload.clone(),
        transformed_body: None,
        transformed_headers: BTreeMap::new(),
        request_url: String::new(),
        is_streaming: request.payload.wants_stream(),
        retry: inherited.retry.clone().unwrap_or_default(),
        request_timeout: inherited.request_timeout,
        strict_open_ai_compliance: inherited.strict_open_ai_compliance.unwrap_or(false),
        options,
    };
    rc.request_url = adapter.resolve_url(&rc)?;
    log.request_url = Some(rc.request_url.clone());

    let before_hooks = concat_hooks(
        rc.options.before_request_hooks.as_deref(),
        rc.options.default_input_guardrails.as_deref(),
    );
    let after_hooks = concat_hooks(
        rc.options.after_request_hooks.as_deref(),
        rc.options.default_output_guardrails.as_deref(),
    );
    let span = ctx.hooks.create_span(
        rc.payload.json().cloned(),
        &rc.provider,
        rc.is_streaming,
        &before_hooks,
        &after_hooks,
    );
    if !span.is_empty() {
        log.hook_span_id = Some(span.clone());
    }

    // Released on completion and on caller cancellation alike.
    let _span_guard = SpanGuard {
        hooks: ctx.hooks.clone(),
        span: span.clone(),
    };
    leaf_pipeline(ctx, &mut rc, &adapter, &span, inherited, log, started).await
}

struct SpanGuard {
    hooks: Arc<dyn crate::hooks::Hooks>,
    span: HookSpanId,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.hooks.release_span(&self.span);
    }
}

async fn leaf_pipeline(
    ctx: &GatewayContext,
    rc: &mut RequestContext,
    adapter: &Arc<dyn ProviderAdapter>,
    span: &HookSpanId,
    inherited: &InheritedConfig,
    log: &mut LogRecord,
    started: Instant,
) -> Result<GatewayResponse> {
    // Before-request hooks. Runtime failures here are swallowed so a broken
    // guardrail backend cannot take the data path down with it.
    let mut before_results: Vec<Value> = Vec::new();
    match ctx.hooks.run_before_request_hooks(span).await {
        Err(err) => {
            tracing::warn!(error = %err, "before-request hooks failed; continuing");
        }
        Ok(outcome) => {
            before_results = outcome.results;
            if outcome.should_deny {
                let response = hooks_failed_response(&before_results, &[]);
                emit_log(ctx, log, &response, started, Some(0));
                return Ok(response);
            }
            if outcome.transformed {
                if let Some(json) = ctx.hooks.span_request_json(span) {
                    rc.payload = RequestPayload::Json(json);
                }
            }
        }
    }

    // Provider request mapping, unless the adapter brings its own handler.
    rc.transformed_headers = adapter.request_headers(rc)?;
    if adapter.request_handler().is_none() {
        if let Some(params) = rc.payload.json().cloned() {
            rc.transformed_body = Some(adapter.transform_request(rc, &params)?);
        }
    }

    let forward_headers = rc.options.forward_headers.clone().unwrap_or_default();
    let final_headers = build_final_headers(
        &rc.transformed_headers,
        &rc.client_headers,
        &forward_headers,
        &rc.endpoint,
        &rc.method,
        &ctx.proxy_ignore_headers,
    );
    let provider_content_type = rc
        .transformed_headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.as_str());
    let plan = plan_request_body(
        &rc.endpoint,
        rc.client_headers
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        provider_content_type,
    );
    let body = build_request_body(plan, rc.transformed_body.as_ref(), &rc.payload);
    let mut fetch_options = FetchOptions::new(rc.method.clone(), final_headers, body);
    fetch_options.half_duplex = rc.endpoint.is_upload_file();

    log.request_headers = Some(
        fetch_options
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
    );
    log.request_body = rc.effective_params().cloned();

    // Cache lookup.
    let cache_settings = inherited.cache.clone();
    let lookup = {
        let query = CacheQuery {
            settings: cache_settings.as_ref(),
            provider: &rc.provider,
            url: &rc.request_url,
            request_json: rc.effective_params(),
        };
        ctx.cache.lookup(&query).await
    };
    log.cache_status = lookup.status.clone();
    log.cache_key = lookup.key.clone();
    if let Some(mut cached) = lookup.response {
        if let Some(json) = cached.body_json() {
            let mapped = adapter.transform_response(rc, json)?;
            cached = cached.with_json_body(&mapped);
        }
        log.created_at_ms = lookup.created_at;
        emit_log(ctx, log, &cached, started, Some(0));
        return Ok(cached);
    }

    // Pre-request validation (budgets, quotas).
    if let Some(validator) = &ctx.validator {
        if let Some(response) = validator.validate(rc).await {
            emit_log(ctx, log, &response, started, Some(0));
            return Ok(response);
        }
    }

    after_request_hook_loop(
        ctx,
        rc,
        adapter,
        span,
        &fetch_options,
        cache_settings.as_ref(),
        lookup.key.as_deref(),
        &before_results,
        log,
        started,
    )
    .await
}

/// The upstream exchange plus after-request hooks, re-fetching while the
/// hook-mapped response is still retriable and budget remains.
#[allow(clippy::too_many_arguments)]
async fn after_request_hook_loop(
    ctx: &GatewayContext,
    rc: &RequestContext,
    adapter: &Arc<dyn ProviderAdapter>,
    span: &HookSpanId,
    fetch_options: &FetchOptions,
    cache_settings: Option<&CacheSettings>,
    cache_key: Option<&str>,
    before_results: &[Value],
    log: &mut LogRecord,
    started: Instant,
) -> Result<GatewayResponse> {
    let transport = adapter
        .request_handler()
        .unwrap_or_else(|| ctx.transport.clone());
    let timeout = rc.request_timeout.map(Duration::from_millis);
    let retry = rc.retry.clone();
    let use_retry_after = retry.use_retry_after_header.unwrap_or(false);
    let mut attempts_already_made: u32 = 0;

    loop {
        let remaining_budget = retry.attempts.saturating_sub(attempts_already_made);
        let outcome = retry_request(
            transport.as_ref(),
            &rc.request_url,
            fetch_options,
            remaining_budget,
            &retry.on_status_codes,
            attempts_already_made,
            timeout,
            use_retry_after,
        )
        .await;

        // Upstream bodies are only parsed when a synchronous after-hook
        // needs to see them; otherwise the response passes through as-is.
        let sync_hooks = ctx.hooks.are_sync_hooks_available(span);
        let (mapped_response, mapped_json, original_json) = if sync_hooks {
            match outcome.response.body_json() {
                Some(original) => {
                    let mapped = adapter.transform_response(rc, original.clone())?;
                    let response = outcome.response.clone().with_json_body(&mapped);
                    (response, Some(mapped), Some(original))
                }
                None => (outcome.response.clone(), None, None),
            }
        } else {
            (outcome.response.clone(), None, None)
        };

        let arh = ctx
            .hooks
            .run_after_request_hooks(span, mapped_json.as_ref(), mapped_response.status.as_u16())
            .await?;
        let arh_response = if arh.should_deny {
            hooks_failed_response(before_results, &arh.results)
        } else if let Some(rewritten) = &arh.response_json {
            mapped_response.with_json_body(rewritten)
        } else {
            mapped_response
        };

        let retriable = retry
            .on_status_codes
            .contains(&arh_response.status.as_u16());
        let attempts_spent = attempts_already_made + outcome.attempts_used;
        let remaining =
            i64::from(retry.attempts) - i64::from(outcome.attempts_used) - i64::from(attempts_already_made);

        if remaining > 0 && !outcome.skipped && retriable {
            log.created_at_ms = Some(outcome.created_at_ms);
            emit_log(ctx, log, &arh_response, started, Some(i64::from(attempts_spent)));
            attempts_already_made = attempts_spent + 1;
            continue;
        }

        // -1 marks "budget exhausted (or retry bypassed) without success".
        let retry_count: i64 = if retriable || outcome.skipped {
            -1
        } else {
            i64::from(attempts_spent)
        };

        if !arh.should_deny && arh_response.is_ok() {
            if let (Some(settings), Some(key)) = (cache_settings, cache_key) {
                ctx.cache.store(key, &arh_response, settings).await;
            }
        }

        log.created_at_ms = Some(outcome.created_at_ms);
        log.original_response_body = original_json;
        emit_log(ctx, log, &arh_response, started, Some(retry_count));
        return Ok(arh_response);
    }
}

fn concat_hooks(primary: Option<&[Value]>, defaults: Option<&[Value]>) -> Vec<Value> {
    let mut hooks = primary.map(<[Value]>::to_vec).unwrap_or_default();
    if let Some(defaults) = defaults {
        hooks.extend(defaults.iter().cloned());
    }
    hooks
}

fn emit_log(
    ctx: &GatewayContext,
    log: &mut LogRecord,
    response: &GatewayResponse,
    started: Instant,
    retry_attempt: Option<i64>,
) {
    log.response_status = Some(response.status.as_u16());
    log.response_body = response.body_json();
    log.execution_time_ms = Some(started.elapsed().as_millis() as u64);
    log.retry_attempt = retry_attempt;
    ctx.log_sink.emit(log.clone());
}
