//! Per-position ephemeral retry state and backoff policy
//!
//! One record per live position, created on open and deleted exactly once
//! on terminal transition. Everything here is in-memory only: attempt
//! counters, cooldowns, stranded-mode bookkeeping. Never persisted.

use rand::Rng;
use std::time::{Duration, Instant};

use crate::config::RetryConfig;
use crate::error::Error;
use crate::position::Urgency;

/// Why a retry cycle gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpKind {
    /// Pool confirmed drained; further attempts are pointless
    Drained,
    /// Absolute attempt cap reached
    HardCap,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp(GiveUpKind),
}

/// Stranded-recovery bookkeeping
#[derive(Debug, Clone, Copy)]
pub struct StrandedState {
    pub started: Instant,
    /// Deadline passed while an attempt was still in flight
    pub expired: bool,
}

/// Ephemeral, never-persisted state for one live position
#[derive(Debug)]
pub struct EphemeralState {
    /// Total sell attempts this position has made
    pub attempts: u32,
    pub rate_limit_failures: u32,
    pub pool_drained_failures: u32,
    pub zero_output_failures: u32,
    /// Consecutive rate-limited take-profit attempts, drives the
    /// progressive 429-aware ladder cooldown
    pub consecutive_tp_rate_limits: u32,
    pub tp_cooldown_until: Option<Instant>,
    /// Extra staleness misses credited by in-grace resolution
    pub stale_bonus: u32,
    /// Execution urgency, escalated per emergency retry
    pub urgency: Urgency,
    pub stranded: Option<StrandedState>,
}

impl EphemeralState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            rate_limit_failures: 0,
            pool_drained_failures: 0,
            zero_output_failures: 0,
            consecutive_tp_rate_limits: 0,
            tp_cooldown_until: None,
            stale_bonus: 0,
            urgency: Urgency::Normal,
            stranded: None,
        }
    }

    pub fn is_stranded(&self) -> bool {
        self.stranded.is_some()
    }

    pub fn tp_cooldown_active(&self, now: Instant) -> bool {
        self.tp_cooldown_until.map(|t| now < t).unwrap_or(false)
    }

    /// Record a failure and classify it for the counters.
    pub fn record_failure(&mut self, error: &Error) {
        if error.is_rate_limit() {
            self.rate_limit_failures += 1;
        } else if error.is_pool_drained() {
            self.pool_drained_failures += 1;
        } else if error.is_zero_output() {
            self.zero_output_failures += 1;
        }
    }

    /// A confirmed fill clears the failure streaks.
    pub fn record_success(&mut self, now: Instant, tp_cooldown: Duration) {
        self.rate_limit_failures = 0;
        self.pool_drained_failures = 0;
        self.consecutive_tp_rate_limits = 0;
        self.urgency = Urgency::Normal;
        self.tp_cooldown_until = Some(now + tp_cooldown);
    }

    /// Progressive take-profit cooldown after a rate-limited ladder attempt.
    pub fn apply_tp_rate_limit(&mut self, now: Instant, base: Duration, step: Duration) {
        self.consecutive_tp_rate_limits += 1;
        self.tp_cooldown_until = Some(now + base + step * self.consecutive_tp_rate_limits);
    }
}

impl Default for EphemeralState {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute attempt ceiling independent of failure reason.
pub fn absolute_cap(config: &RetryConfig) -> u32 {
    config.max_attempts.max(config.max_rate_limit_retries)
}

/// Decide the next step after a failed attempt.
///
/// Rate limits are recoverable and get a long fixed cooldown with a higher
/// ceiling. A drained pool gets at most a couple of fast retries. Emergency
/// sells use a short flat delay (the caller escalates urgency). Everything
/// else backs off exponentially with jitter.
pub fn next_retry(
    config: &RetryConfig,
    state: &EphemeralState,
    error: &Error,
    emergency: bool,
) -> RetryDecision {
    if state.attempts >= absolute_cap(config) {
        return RetryDecision::GiveUp(GiveUpKind::HardCap);
    }

    if error.is_pool_drained() {
        return if state.pool_drained_failures > config.pool_drained_retries {
            RetryDecision::GiveUp(GiveUpKind::Drained)
        } else {
            RetryDecision::Retry(Duration::from_millis(config.pool_drained_delay_ms))
        };
    }

    if error.is_rate_limit() {
        return if state.rate_limit_failures >= config.max_rate_limit_retries {
            RetryDecision::GiveUp(GiveUpKind::HardCap)
        } else {
            RetryDecision::Retry(Duration::from_secs(config.rate_limit_cooldown_secs))
        };
    }

    if state.attempts >= config.max_attempts {
        return RetryDecision::GiveUp(GiveUpKind::HardCap);
    }

    if emergency {
        return RetryDecision::Retry(Duration::from_millis(config.emergency_retry_delay_ms));
    }

    let exp = config
        .backoff_base_ms
        .saturating_mul(1u64 << state.attempts.saturating_sub(1).min(16))
        .min(config.backoff_cap_ms);
    // +/-20% jitter so parallel positions do not retry in lockstep
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    RetryDecision::Retry(Duration::from_millis((exp as f64 * jitter) as u64))
}
