// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reconnect scheduling and backoff.
//!
//! A failed connection is cleaned up, reset to the socket-creation phase
//! and re-armed through a one-shot timer whose delay grows per the
//! client's policy. The delay never falls below a floor chosen to stay
//! clear of timer granularity.

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::timer::TimerEvent;
use crate::transport::engine::ProcCtx;
use crate::transport::{transport_cleanup, Conn, Modifiers, Phase, Transport};

/// Delays below this are rounded up; sub-50us timers are unreliable.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_micros(50);

// ============================================================================
// Backoff policy
// ============================================================================

/// Exponential (or fractional-additive) reconnect delay.
///
/// With `factor > 1` each failure multiplies the delay; with
/// `0 < factor < 1` each failure adds `delay * factor`; `factor == 0`
/// keeps the delay constant. Either way the sequence is monotonically
/// non-decreasing and bounded below by [`MIN_RECONNECT_DELAY`].
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    initial: Duration,
    factor: f64,
    current: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, factor: f64) -> Self {
        Self {
            initial,
            factor,
            current: initial,
        }
    }

    /// The delay to use now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.max(MIN_RECONNECT_DELAY);
        if self.factor > 1.0 {
            self.current = self.current.mul_f64(self.factor);
        } else if self.factor > 0.0 {
            self.current += self.current.mul_f64(self.factor);
        }
        delay
    }

    /// Reset to the initial delay after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Tear the connection down and arm the reconnect timer.
///
/// Idempotent: a connection already reset to `NeedCreate` has a timer (or
/// a queued job) in flight, and scheduling again would double-arm it.
pub(crate) fn schedule_reconnect(trans: &Arc<Transport>, c: &mut Conn, ctx: &ProcCtx<'_>) {
    if c.phase == Phase::NeedCreate {
        return;
    }

    debug!(
        "client {} scheduling reconnect (phase {})",
        trans.cfg.client_id, c.phase
    );

    if let Some(stream) = c.stream.as_mut() {
        stream.close();
    }
    ctx.shared.listeners[trans.listener_idx].detach(c);
    transport_cleanup(trans, c);

    trans.set_phase(c, Phase::NeedCreate, ctx.shared);
    trans.set_protocol(c, crate::session::ProtocolState::Unknown);
    c.mods = Modifiers::empty();

    ctx.shared.metrics.record_reconnect_scheduled();

    let delay = c.backoff.next_delay();
    ctx.shared
        .timer
        .set_once(delay, TimerEvent::Reconnect(Arc::clone(trans)));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_multiplicative() {
        let mut policy = BackoffPolicy::new(Duration::from_millis(100), 2.0);
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
        assert_eq!(policy.next_delay(), Duration::from_millis(200));
        assert_eq!(policy.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_fractional_additive() {
        let mut policy = BackoffPolicy::new(Duration::from_millis(100), 0.5);
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
        assert_eq!(policy.next_delay(), Duration::from_millis(150));
        assert_eq!(policy.next_delay(), Duration::from_millis(225));
    }

    #[test]
    fn test_backoff_constant_when_factor_zero() {
        let mut policy = BackoffPolicy::new(Duration::from_millis(100), 0.0);
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_monotonic_non_decreasing() {
        for factor in [0.0, 0.1, 0.9, 1.0, 1.5, 3.0] {
            let mut policy = BackoffPolicy::new(Duration::from_micros(80), factor);
            let mut last = Duration::ZERO;
            for _ in 0..20 {
                let delay = policy.next_delay();
                assert!(delay >= last, "factor {} regressed", factor);
                assert!(delay >= MIN_RECONNECT_DELAY);
                last = delay;
            }
        }
    }

    #[test]
    fn test_backoff_floor() {
        let mut policy = BackoffPolicy::new(Duration::from_nanos(10), 2.0);
        assert_eq!(policy.next_delay(), MIN_RECONNECT_DELAY);
    }

    #[test]
    fn test_backoff_reset() {
        let mut policy = BackoffPolicy::new(Duration::from_millis(100), 2.0);
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Duration::from_millis(100));
    }
}
