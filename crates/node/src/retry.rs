//! Retry-until-success with an explicit bound and exponential backoff.
//!
//! Every blocking loop on the node (ADC bring-up, HTTP client setup, link
//! reconnect, time sync) goes through [`retry`].  A policy with
//! `max_attempts = None` keeps the old "spin until it works" behaviour; a
//! bounded policy hands the last error back to the caller instead.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Unbounded, constant delay.
    pub const fn forever(delay_ms: u64) -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
        }
    }

    /// Bounded exponential backoff.
    pub const fn backoff(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_delay_ms,
            max_delay_ms,
            multiplier: 2.0,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// True once `attempt` failures use up the policy.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Validation problems, phrased for the config error list.
    pub fn problems(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.max_attempts == Some(0) {
            out.push(format!("{name}: max_attempts must be at least 1"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            out.push(format!(
                "{name}: multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            out.push(format!(
                "{name}: max_delay_ms ({}) is below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        out
    }
}

/// One fallible step that [`retry_on`] can repeat.  Implemented by
/// wrappers that need `&mut` access to long-lived state between tries.
pub trait Attempt {
    type Output;

    /// `n` is the 1-based attempt number.
    async fn attempt(&mut self, n: u32) -> Result<Self::Output>;
}

/// Closure adapter for [`retry`].
struct Repeat<F>(F);

impl<T, F, Fut> Attempt for Repeat<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    type Output = T;

    async fn attempt(&mut self, _n: u32) -> Result<T> {
        (self.0)().await
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts.
///
/// `what` names the operation in log lines and in the final error.
pub async fn retry<T, F, Fut>(what: &str, policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_on(what, policy, &mut Repeat(op)).await
}

/// [`retry`] for steps that borrow state mutably across attempts.
pub async fn retry_on<A: Attempt>(what: &str, policy: &RetryPolicy, op: &mut A) -> Result<A::Output> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op.attempt(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if policy.exhausted(attempt) {
                    return Err(e.context(format!("{what} failed after {attempt} attempt(s)")));
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "{what} failed: {e:#}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
