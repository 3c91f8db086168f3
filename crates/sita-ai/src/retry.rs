//! Bounded retry with backoff for completion-service requests.
//!
//! Both HTTP clients funnel every attempt through [`send_with_retry`], so a
//! transient provider failure is retried a small, fixed number of times and
//! then surfaces as a [`SitaAiError`] for the turn to record.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::{header::HeaderMap, RequestBuilder};
use tokio::time::sleep;

use crate::SitaAiError;

pub const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_SHIFT: usize = 6;

const REQUEST_ID_HEADER: &str = "x-sita-request-id";
const RETRY_ATTEMPT_HEADER: &str = "x-sita-retry-attempt";

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static JITTER_STATE: AtomicU64 = AtomicU64::new(0x2545_F491_4F6C_DD1D);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: usize,
    /// Wall-clock ceiling for all attempts plus waits; 0 disables the ceiling.
    pub budget_ms: u64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Exponential backoff from [`BASE_BACKOFF_MS`], doubled per attempt and capped.
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let full = BASE_BACKOFF_MS.saturating_mul(1_u64 << attempt.min(MAX_BACKOFF_SHIFT));
        if !self.jitter {
            return full;
        }
        // Keep at least half the delay so retries never collapse onto each other.
        let half = full / 2;
        half.saturating_add(next_jitter() % (full - half + 1))
    }

    /// Backoff for `attempt`, raised to a server-provided `Retry-After` floor.
    pub fn delay_ms(&self, attempt: usize, retry_after_ms: Option<u64>) -> u64 {
        let backoff = self.backoff_ms(attempt);
        retry_after_ms.map_or(backoff, |floor| backoff.max(floor))
    }

    pub fn budget_allows(&self, elapsed_ms: u64, delay_ms: u64) -> bool {
        self.budget_ms == 0 || elapsed_ms.saturating_add(delay_ms) <= self.budget_ms
    }
}

/// Sends the request built by `build` until it succeeds or retries run out.
///
/// Returns the body of the first 2xx response. Statuses that are not
/// retryable, and transport errors other than timeouts or connect failures,
/// return immediately.
pub(crate) async fn send_with_retry<F>(
    policy: RetryPolicy,
    operation: &'static str,
    build: F,
) -> Result<String, SitaAiError>
where
    F: Fn() -> RequestBuilder,
{
    let started = Instant::now();
    let mut attempt = 0_usize;
    loop {
        let sent = build()
            .header(REQUEST_ID_HEADER, new_request_id())
            .header(RETRY_ATTEMPT_HEADER, attempt.to_string())
            .send()
            .await;

        let (retryable, retry_after_ms, failure) = match sent {
            Ok(response) if response.status().is_success() => return Ok(response.text().await?),
            Ok(response) => {
                let status = response.status().as_u16();
                let retry_after_ms = parse_retry_after_ms(response.headers());
                let body = response.text().await?;
                (
                    should_retry_status(status),
                    retry_after_ms,
                    SitaAiError::HttpStatus { status, body },
                )
            }
            Err(error) => (is_retryable_http_error(&error), None, SitaAiError::Http(error)),
        };

        if !retryable || attempt >= policy.max_retries {
            return Err(failure);
        }
        let delay_ms = policy.delay_ms(attempt, retry_after_ms);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !policy.budget_allows(elapsed_ms, delay_ms) {
            tracing::warn!(operation, attempt, delay_ms, "retry budget exhausted");
            return Err(failure);
        }
        tracing::warn!(operation, attempt, delay_ms, error = %failure, "retrying provider request");
        sleep(Duration::from_millis(delay_ms)).await;
        attempt += 1;
    }
}

pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || status >= 500
}

/// `Retry-After` as milliseconds; accepts delta-seconds or an HTTP date.
pub fn parse_retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay = at.signed_duration_since(Utc::now()).num_milliseconds();
    Some(u64::try_from(delay).unwrap_or(0))
}

pub fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

pub fn new_request_id() -> String {
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sita-{}-{count}", Utc::now().timestamp_millis())
}

// xorshift over a shared state; quality only needs to spread concurrent retries.
fn next_jitter() -> u64 {
    let mut current = JITTER_STATE.load(Ordering::Relaxed);
    loop {
        let mut next = current;
        next ^= next << 13;
        next ^= next >> 7;
        next ^= next << 17;
        match JITTER_STATE.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(observed) => current = observed,
        }
    }
}
