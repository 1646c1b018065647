use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;

use crate::cache::now_epoch_millis;
use crate::response::GatewayResponse;
use crate::transport::{FetchOptions, UpstreamTransport};

const BASE_RETRY_DELAY_MS: u64 = 250;
const MAX_RETRY_DELAY_MS: u64 = 10_000;
const MAX_RETRY_AFTER_SECONDS: u64 = 300;

/// What one engine invocation produced. The after-request-hook loop owns
/// the response-level retry budget; the engine reports how many extra
/// upstream calls it spent on transport failures and whether it decided
/// retrying is off the table (`skipped`).
#[derive(Debug)]
pub struct RetryOutcome {
    pub response: GatewayResponse,
    pub attempts_used: u32,
    pub created_at_ms: u64,
    pub skipped: bool,
}

/// Performs one upstream exchange with transport-failure retries and
/// response-level retry pacing. Never errors: transport failures come back
/// as synthesized failure responses.
///
/// Guarantees: at most `remaining_attempts + 1` calls on `handler`; honors
/// `Retry-After` (delta-seconds or HTTP-date) when asked to; `skipped` is
/// set for event-stream responses, timeouts, and exhausted transport
/// failures, all of which must not be retried again.
#[allow(clippy::too_many_arguments)]
pub async fn retry_request(
    handler: &dyn UpstreamTransport,
    url: &str,
    options: &FetchOptions,
    remaining_attempts: u32,
    retriable_status_codes: &[u16],
    attempts_already_made: u32,
    timeout: Option<Duration>,
    use_retry_after_header: bool,
) -> RetryOutcome {
    let created_at_ms = now_epoch_millis();
    let mut attempts_used: u32 = 0;

    loop {
        match handler.fetch(url, options, timeout).await {
            Ok(response) => {
                if response.is_event_stream() {
                    return RetryOutcome {
                        response,
                        attempts_used,
                        created_at_ms,
                        skipped: true,
                    };
                }

                let retriable = retriable_status_codes.contains(&response.status.as_u16());
                if retriable && attempts_used < remaining_attempts {
                    // The loop issues the next attempt; pace it here so
                    // Retry-After and backoff are honored either way.
                    let delay = retry_after_delay(&response)
                        .filter(|_| use_retry_after_header)
                        .unwrap_or_else(|| {
                            backoff_delay(attempts_already_made + attempts_used)
                        });
                    tracing::debug!(
                        url,
                        status = response.status.as_u16(),
                        delay_ms = delay.as_millis() as u64,
                        "upstream returned retriable status"
                    );
                    tokio::time::sleep(delay).await;
                }

                return RetryOutcome {
                    response,
                    attempts_used,
                    created_at_ms,
                    skipped: false,
                };
            }
            Err(err) => {
                let timed_out = matches!(
                    &err,
                    crate::error::GatewayError::Http(inner) if inner.is_timeout()
                );
                if timed_out {
                    tracing::debug!(url, "upstream fetch timed out");
                    return RetryOutcome {
                        response: synthesized_failure(
                            StatusCode::REQUEST_TIMEOUT,
                            "Request exceeded the configured timeout",
                        ),
                        attempts_used,
                        created_at_ms,
                        skipped: true,
                    };
                }

                if attempts_used < remaining_attempts {
                    attempts_used += 1;
                    let delay = backoff_delay(attempts_already_made + attempts_used);
                    tracing::debug!(
                        url,
                        error = %err,
                        attempt = attempts_used,
                        "retrying upstream after transport failure"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }

                tracing::warn!(url, error = %err, "upstream fetch failed");
                return RetryOutcome {
                    response: synthesized_failure(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("Upstream fetch failed: {err}"),
                    ),
                    attempts_used,
                    created_at_ms,
                    skipped: true,
                };
            }
        }
    }
}

fn synthesized_failure(status: StatusCode, message: &str) -> GatewayResponse {
    GatewayResponse::json(status, &json!({"status": "failure", "message": message}))
}

/// Exponential backoff with a little jitter to avoid thundering herds.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_RETRY_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = base.min(MAX_RETRY_DELAY_MS);
    let jitter = (capped as f64 * 0.2 * rand::random::<f64>()) as u64;
    Duration::from_millis(capped + jitter)
}

/// Parses `Retry-After`, accepting delta-seconds or an HTTP-date.
fn retry_after_delay(response: &GatewayResponse) -> Option<Duration> {
    let value = response.header("retry-after")?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(MAX_RETRY_AFTER_SECONDS)));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let seconds = (date.timestamp() - chrono::Utc::now().timestamp()).max(0) as u64;
    Some(Duration::from_secs(seconds.min(MAX_RETRY_AFTER_SECONDS)))
}
