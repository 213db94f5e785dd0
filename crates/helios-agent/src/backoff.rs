// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Restart and retry backoff.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`. The
//! same policy paces crash restarts and per-cycle fetch retries, so a
//! persistently failing worker or an unreachable origin backs off to the
//! same ceiling.

use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Initial delay (attempt 0).
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl BackoffPolicy {
    /// Doubling policy starting at `first`, capped at `max`.
    pub fn doubling(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Compute the delay for the given attempt number.
    ///
    /// Overflowing or non-finite intermediate values clamp to `max`.
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let raw = self.first.as_secs_f64() * self.factor.powi(exp);
        if !raw.is_finite() || raw < 0.0 || raw > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(raw)
        }
    }
}
