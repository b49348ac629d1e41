// src/engine/retry.rs

//! Retry bookkeeping and backoff curves.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BackoffPolicy, UnitId};

/// Delay curve for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub policy: BackoffPolicy,
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::Exponential,
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), capped at `max`.
    ///
    /// - exponential: `base * 2^(attempt - 1)`
    /// - fibonacci: `base * fib(attempt)` with fib(1)=1, fib(2)=2, fib(3)=3, fib(4)=5
    pub fn delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let factor: u64 = match self.policy {
            BackoffPolicy::Exponential => 1u64.checked_shl(n - 1).unwrap_or(u64::MAX),
            BackoffPolicy::Fibonacci => fibonacci(n),
        };

        let factor = u32::try_from(factor).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 2u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Retry state for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Failed attempts counted against `max_retries`.
    pub attempts: u32,
    /// Set while the unit waits out a delay; cleared when it is due.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Per-unit retry state.
#[derive(Debug, Clone, Default)]
pub struct RetryBook {
    entries: BTreeMap<UnitId, RetryState>,
}

impl RetryBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self, unit: &str) -> u32 {
        self.entries.get(unit).map_or(0, |s| s.attempts)
    }

    /// Count a failed attempt and return the new total.
    pub fn record_failure(&mut self, unit: &str) -> u32 {
        let state = self.entry(unit);
        state.attempts += 1;
        state.attempts
    }

    /// Start waiting `delay` before the next launch.
    pub fn schedule(&mut self, unit: &str, delay: Duration) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let at = Utc::now().checked_add_signed(delta).unwrap_or_else(Utc::now);
        self.entry(unit).next_retry_at = Some(at);
        at
    }

    /// The wait is over. Returns `false` if the unit was not waiting.
    pub fn mark_due(&mut self, unit: &str) -> bool {
        match self.entries.get_mut(unit) {
            Some(state) if state.next_retry_at.is_some() => {
                state.next_retry_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_waiting(&self, unit: &str) -> bool {
        self.entries
            .get(unit)
            .is_some_and(|s| s.next_retry_at.is_some())
    }

    pub fn waiting_count(&self) -> usize {
        self.entries
            .values()
            .filter(|s| s.next_retry_at.is_some())
            .count()
    }

    pub fn clear(&mut self, unit: &str) {
        self.entries.remove(unit);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, &RetryState)> {
        self.entries.iter()
    }

    pub(crate) fn insert(&mut self, unit: UnitId, state: RetryState) {
        self.entries.insert(unit, state);
    }

    fn entry(&mut self, unit: &str) -> &mut RetryState {
        self.entries
            .entry(unit.to_string())
            .or_insert(RetryState {
                attempts: 0,
                next_retry_at: None,
            })
    }
}
