//! Caller-side retry with exponential backoff
//!
//! `dispatch` never retries on its own. Callers that want to re-send failed
//! entries of a batch use [`retry_failed`], which wraps each re-dispatch in
//! [`retry_with_backoff`]. Every attempt builds a fresh envelope, so a retried
//! event carries a new `event_id`.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::batch::{BatchReport, OutboundEvent};
use crate::dispatcher::{Connection, EventDispatcher};
use crate::error::DispatchError;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Every error is considered retryable; see [`retry_with_backoff_if`] to stop
/// early on errors that cannot recover.
///
/// # Example
/// ```rust
/// use event_dispatch::retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    retry_with_backoff_if(operation, config, context, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up as soon as `retryable` says no
///
/// # Returns
/// * `Ok(T)` if the operation succeeds within `max_attempts`
/// * `Err(E)` with the last error once attempts run out or an error is final
pub async fn retry_with_backoff_if<F, Fut, T, E, R>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    retryable: R,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
    R: Fn(&E) -> bool,
{
    let mut backoff = config.initial_backoff;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "succeeded on retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !retryable(&err) {
            warn!(context = %context, attempt, error = %err, "giving up, error is final");
            return Err(err);
        }
        if attempt >= config.max_attempts {
            warn!(context = %context, attempts = attempt, error = %err, "retries exhausted");
            return Err(err);
        }

        warn!(
            context = %context,
            attempt,
            max_attempts = config.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "attempt failed, backing off"
        );
        sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, config.max_backoff);
    }
}

/// Whether re-sending could plausibly succeed on the same connection
fn is_retryable(err: &DispatchError) -> bool {
    !err.is_connection_fatal()
        && !matches!(
            err,
            DispatchError::InvalidEventName | DispatchError::Serialization(_)
        )
}

/// Re-dispatch the failed, retryable entries of `report` in input order
///
/// Entries whose failure is connection-fatal or caused by the event itself are
/// left untouched. Returns the number of entries that now succeed.
pub async fn retry_failed(
    report: &mut BatchReport,
    events: &[OutboundEvent],
    dispatcher: &EventDispatcher,
    connection: &Connection,
    config: &RetryConfig,
) -> usize {
    let mut recovered = 0;
    let exchange = report.exchange.clone();

    for idx in report.failed_indices() {
        let retryable = report
            .entries()
            .get(idx)
            .and_then(|entry| entry.result.as_ref().err())
            .map(is_retryable)
            .unwrap_or(false);
        let Some(event) = events.get(idx) else {
            continue;
        };
        if !retryable {
            debug!(event_name = %event.event_name, "skipping non-retryable failure");
            continue;
        }

        let result = retry_with_backoff_if(
            || {
                dispatcher.dispatch(
                    connection,
                    &exchange,
                    &event.event_name,
                    event.payload.clone(),
                )
            },
            config,
            &event.event_name,
            is_retryable,
        )
        .await;

        if result.is_ok() {
            recovered += 1;
        }
        report.replace(idx, result);
    }

    if recovered > 0 {
        info!(recovered = recovered, "failed entries recovered by retry");
    }
    recovered
}
