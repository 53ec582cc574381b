//! Retry-with-timeout primitive.
//!
//! [`wait_until`] re-runs an async status check on a fixed interval until it
//! yields a value or the deadline passes. Dropping the returned future cancels
//! the wait between checks.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Timing for a [`wait_until`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Delay before the first check.
    pub initial_delay: Duration,
    /// Delay between checks.
    pub interval: Duration,
    /// Give up once this much time has passed since the wait started.
    pub timeout: Duration,
}

impl PollOptions {
    /// Check every `interval`, starting immediately, for at most `timeout`.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            interval,
            timeout,
        }
    }

    /// Wait `initial_delay` before the first check.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

/// Why a [`wait_until`] loop stopped without a value.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The deadline passed before the condition held.
    #[error("timed out after {elapsed:?}")]
    Timeout {
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The status check itself failed.
    #[error("status check failed")]
    Check(E),
}

/// Run `check` until it returns `Ok(Some(_))`, fails, or `options.timeout`
/// elapses.
///
/// The check always runs at least once, even with a zero timeout. Errors from
/// the check end the loop immediately and are not retried.
pub async fn wait_until<T, E, F, Fut>(options: PollOptions, mut check: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();

    if !options.initial_delay.is_zero() {
        sleep(options.initial_delay).await;
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(value) = check().await.map_err(PollError::Check)? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            return Err(PollError::Timeout { elapsed });
        }

        trace!(attempt, ?elapsed, "Condition not met yet");
        sleep(options.interval).await;
    }
}
