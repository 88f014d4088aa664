//! Retry policy for remote inference calls.
//!
//! ## Strategy
//!
//! * **Transient** (network, 5xx, deadline) and **Refusal** wait a fixed
//!   base delay.
//! * **RateLimited** (429) waits `base × attempt × multiplier`, which grows
//!   linearly and is never shorter than the base delay.
//! * **Terminal** (bad request, auth) gives up immediately.
//!
//! A single attempt ceiling applies to every class. On exhaustion the caller
//! receives [`RetryExhausted`] with the last error; there is no silent
//! default.

use crate::config::IngestConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Failure classification driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// HTTP 429 or provider quota signal.
    RateLimited,
    /// Network failure, 5xx, or per-call deadline elapsed.
    Transient,
    /// Short, apologetic, non-extractive reply instead of a transcription.
    Refusal,
    /// Malformed input, authentication failure; retrying cannot help.
    Terminal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::RateLimited => "rate-limited",
            ErrorClass::Transient => "transient",
            ErrorClass::Refusal => "refusal",
            ErrorClass::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// Errors that know their own [`ErrorClass`].
pub trait Classified {
    fn class(&self) -> ErrorClass;
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Returned by [`RetryPolicy::run`] once no further attempt will be made.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    /// Attempts actually made, first try included.
    pub attempts: u32,
    pub last_error: E,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempts)", self.last_error, self.attempts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    rate_limit_multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, rate_limit_multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            rate_limit_multiplier: rate_limit_multiplier.max(1),
        }
    }

    /// Policy for page transcription.
    pub fn for_pages(config: &IngestConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_delay(),
            config.rate_limit_multiplier,
        )
    }

    /// Policy for field extraction: rate limits back off twice as hard.
    pub fn for_extraction(config: &IngestConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_delay(),
            config.rate_limit_multiplier.saturating_mul(2),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after `attempt` (1-based) failed with `class`.
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match class {
            ErrorClass::Terminal => RetryDecision::GiveUp,
            ErrorClass::Transient | ErrorClass::Refusal => {
                RetryDecision::RetryAfter(self.base_delay)
            }
            ErrorClass::RateLimited => RetryDecision::RetryAfter(
                self.base_delay
                    .saturating_mul(attempt.saturating_mul(self.rate_limit_multiplier)),
            ),
        }
    }

    /// Drive `op` until it succeeds or the policy gives up.
    ///
    /// `op` receives the 1-based attempt number. Waits are timer suspensions,
    /// never busy loops.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        E: Classified + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => match self.decide(attempt, e.class()) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            "{}: retry {}/{} after {}ms ({}: {})",
                            label,
                            attempt,
                            self.max_attempts,
                            delay.as_millis(),
                            e.class(),
                            e
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: e,
                        })
                    }
                },
            }
        }
    }
}
