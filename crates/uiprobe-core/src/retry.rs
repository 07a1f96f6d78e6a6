//! Retry with exponential backoff.
//!
//! Two users inside the crate:
//!
//! - tmux control commands, retried on transient failures through
//!   [`with_smart_retry`] and [`RetryPolicy::tmux_cli`];
//! - the consistency oracle, which spaces its rendered-side re-captures with
//!   [`RetryPolicy::delay_for_attempt`] from [`RetryPolicy::propagation_poll`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use uiprobe_core::retry::{RetryPolicy, with_smart_retry};
//!
//! let panes = with_smart_retry(&RetryPolicy::tmux_cli(), || {
//!     channel.request(&["list-panes", "-t", "tmuxy"])
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result, UnavailableError};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Initial delay before first retry (default: 100ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 5s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as percentage (default: 0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = bounded only by the caller's deadline.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for tmux CLI calls: 3 attempts, 50ms initial.
    #[must_use]
    pub fn tmux_cli() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(3),
        }
    }

    /// Policy for polling the rendered side until it catches up with tmux:
    /// 50ms initial, growing 1.5x to 500ms, unbounded attempts (the caller's
    /// timeout ends the loop).
    #[must_use]
    pub fn propagation_poll() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            backoff_factor: 1.5,
            jitter_percent: 0.1,
            max_attempts: None,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_possible_wrap)] // attempt is capped at 31, safe for i32
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Check if an error is retryable.
///
/// Missing binaries, malformed input and disagreements between the two
/// snapshot sides are not; transport hiccups are.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Unavailable(e) => match e {
            UnavailableError::NotRunning(_) => true,     // Might start up
            UnavailableError::CommandFailed(_) => true,  // Might be transient
            UnavailableError::TreeUnreachable(_) => true, // Page may be reloading
            UnavailableError::Timeout { .. } => true,    // Temporary slowdown
            UnavailableError::CliNotFound(_) => false,   // Need installation
        },
        // I/O errors are generally retryable
        Error::Io(_) => true,
        // Runtime errors might be transient
        Error::Runtime(_) => true,
        // Output we cannot parse will not parse next time either
        Error::Parse(_) => false,
        Error::Selector(_) => false,
        Error::Config(_) => false,
        Error::Json(_) => false,
        // Verdicts, not failures
        Error::Instability { .. } => false,
        Error::Mismatch { .. } => false,
    }
}

/// Execute an operation with smart retry (only retries if error is retryable).
pub async fn with_smart_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) {
                    debug!(attempt, error = %e, "Non-retryable error, giving up");
                    return Err(e);
                }

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            attempt,
                            max_attempts = max,
                            error = %e,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "Operation failed after all retry attempts"
                        );
                        return Err(e);
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after retryable failure"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
