//! Error classification and exponential backoff with full jitter.
//!
//! Grounded on the teacher's `storage/request/backoff.rs` attempt/deadline
//! bookkeeping, reshaped to the exact full-jitter formula spec.md pins:
//! `delay = uniform(0, min(max, base * 2^attempt))`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{UploadError, UploadErrorCode};
use crate::platform::runtime::sleep;

/// Status codes that are always worth retrying: request timeout, too-early,
/// too-many-requests, and the whole 5xx range.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..600).contains(&status)
}

/// True if the error has no HTTP response (network/DNS/timeout) or carries
/// one of the retryable statuses. Any other HTTP status is fatal.
pub fn is_retryable(err: &UploadError) -> bool {
    if err.code == UploadErrorCode::Offline {
        return false;
    }
    match err.status {
        None => true,
        Some(status) => is_retryable_status(status),
    }
}

/// `cap = min(max, base * 2^attempt)`; returns a uniformly random duration in
/// `[0, cap)`. `attempt` is zero-based, so the very first retry (attempt 0)
/// samples from `[0, base)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let cap = std::cmp::min(scaled, max);
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let cap_nanos = cap.as_nanos().min(u64::MAX as u128) as u64;
    let sampled = rand::thread_rng().gen_range(0..cap_nanos.max(1));
    Duration::from_nanos(sampled)
}

#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    pub retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
        }
    }
}

/// Runs `op`, retrying with full-jitter backoff while attempts remain and the
/// error is retryable. `op` receives the zero-based attempt index so callers
/// can log it.
pub async fn with_retry<F, Fut, T>(opts: RetryOptions, mut op: F) -> Result<T, UploadError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= opts.retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = backoff_delay(attempt, opts.base, opts.max);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
