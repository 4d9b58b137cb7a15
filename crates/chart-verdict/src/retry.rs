//! Retry decisions: attempt budgets, exponential backoff, jitter.
//!
//! The controller answers one question: after a classified failure on
//! attempt `n`, do we call the same model again, and after how long? It
//! never sleeps itself; the orchestrator owns the actual wait so that it
//! stays cancellable.
//!
//! Delays follow `base * 2^(n-1)` capped at a ceiling, plus jitter drawn
//! from `[0, base)` so concurrent requests that failed together do not
//! retry together. The per-kind base comes from the failure taxonomy;
//! rate limits back off with the largest base. A provider-advertised
//! `Retry-After` replaces the computed delay outright.

use std::time::Duration;

use rand::Rng;

use crate::errors::ErrorKind;

/// Tunables for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed on one model before escalation, counting the first.
    pub max_attempts: u32,
    /// Upper bound on any single computed or provider-advertised delay.
    pub delay_ceiling: Duration,
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay_ceiling(mut self, ceiling: Duration) -> Self {
        self.delay_ceiling = ceiling;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ceiling: Duration::from_secs(30),
        }
    }
}

/// Outcome of one retry consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    /// How long to wait before the next attempt. Zero when not retrying.
    pub delay: Duration,
}

impl RetryDecision {
    fn no_retry() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides whether a failed attempt is retried on the same model.
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide after a failure of `kind` on 1-based attempt `attempt_number`.
    ///
    /// `retry_after` is the provider-advertised wait, honored over the
    /// computed backoff (clamped to the ceiling so a pathological header
    /// cannot stall a request). Exhaustion here is not terminal; the
    /// orchestrator still owns the fallback decision.
    pub fn decide(
        &self,
        kind: ErrorKind,
        attempt_number: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::no_retry();
        }
        if attempt_number >= self.policy.max_attempts {
            return RetryDecision::no_retry();
        }

        let delay = match retry_after {
            Some(advertised) => advertised.min(self.policy.delay_ceiling),
            None => self.backoff_delay(kind, attempt_number),
        };
        RetryDecision {
            should_retry: true,
            delay,
        }
    }

    fn backoff_delay(&self, kind: ErrorKind, attempt_number: u32) -> Duration {
        let base_ms = kind.metadata().default_delay_ms;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let ceiling_ms = self.policy.delay_ceiling.as_millis().min(u64::MAX as u128) as u64;

        // 1-based attempts: the first retry waits one base, shifts are
        // clamped so large attempt numbers cannot overflow.
        let shift = attempt_number.saturating_sub(1).min(10);
        let exponential = base_ms.saturating_mul(1_u64 << shift).min(ceiling_ms);
        let jitter = rand::thread_rng().gen_range(0..base_ms);
        Duration::from_millis(exponential.saturating_add(jitter))
    }
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
