//! Respawn backoff and the crash-loop breaker.

use std::time::Duration;

use drover_core::{BackoffStrategy, PoolConfig};
use tokio::time::Instant;

use super::record::ExitRecord;

/// Delay before respawning a slot after its `n`th consecutive crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            strategy: config.backoff_strategy,
            base: config.backoff_base(),
            max: config.backoff_max(),
        }
    }

    /// Delay after `crashes` consecutive crashes.
    ///
    /// Linear grows as `base * n`, exponential as `base * 2^(n-1)`; both are
    /// capped at `max`. Zero crashes means no delay.
    pub fn delay(&self, crashes: u32) -> Duration {
        if crashes == 0 {
            return Duration::ZERO;
        }
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base.saturating_mul(crashes),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(crashes - 1).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor)
            }
        };
        delay.min(self.max)
    }
}

/// Halts a slot that keeps crashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashLoopBreaker {
    pub max_restarts: u32,
    pub window: Duration,
}

impl CrashLoopBreaker {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            max_restarts: config.max_restarts_per_window,
            window: config.restart_window(),
        }
    }

    /// Failure exits recorded within the window ending at `now`.
    pub fn crashes_in_window<'a, I>(&self, history: I, now: Instant) -> usize
    where
        I: IntoIterator<Item = &'a ExitRecord>,
    {
        history
            .into_iter()
            .filter(|exit| exit.kind.is_failure())
            .filter(|exit| now.saturating_duration_since(exit.at) <= self.window)
            .count()
    }

    /// True once the crashes inside the window exceed the restart budget.
    pub fn tripped(&self, crashes_in_window: usize) -> bool {
        crashes_in_window > self.max_restarts as usize
    }
}
