//! Error-rate hysteresis for a whole channel.
//!
//! Blocking is checked every scan cycle so a burst of errors takes the channel
//! out of service within one cycle. Unblocking is only considered at the end of
//! each one-second window, together with the reset of the window counters, so
//! recovery is deliberately slower than reaction.

use std::time::{Duration, Instant};

use crate::config::ErrorThresholds;
use crate::stats::PerformanceCounters;

pub const HEALTH_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    Blocked,
    Unblocked,
}

#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: ErrorThresholds,
    window_start: Instant,
    blocked: bool,
    block_count: u32,
}

impl HealthMonitor {
    pub fn new(thresholds: ErrorThresholds, now: Instant) -> Self {
        Self {
            thresholds,
            window_start: now,
            blocked: false,
            block_count: 0,
        }
    }

    pub fn thresholds(&self) -> ErrorThresholds {
        self.thresholds
    }

    pub fn set_thresholds(&mut self, thresholds: ErrorThresholds) {
        self.thresholds = thresholds;
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Number of times the channel has been blocked since creation
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Run once per scan cycle after classification.
    pub fn evaluate(
        &mut self,
        now: Instant,
        counters: &mut PerformanceCounters,
    ) -> HealthTransition {
        let sum = counters.this_second().link_error_sum();
        let mut transition = HealthTransition::Unchanged;

        if !self.thresholds.is_enabled() {
            if self.blocked {
                self.blocked = false;
                transition = HealthTransition::Unblocked;
            }
        } else if !self.blocked && sum >= self.thresholds.high {
            self.blocked = true;
            self.block_count = self.block_count.saturating_add(1);
            transition = HealthTransition::Blocked;
        }

        if now.saturating_duration_since(self.window_start) >= HEALTH_WINDOW {
            self.window_start = now;
            if self.blocked
                && transition != HealthTransition::Blocked
                && sum <= self.thresholds.low
            {
                self.blocked = false;
                transition = HealthTransition::Unblocked;
            }
            counters.reset_window();
        }

        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::ErrorKind;

    fn inject(counters: &mut PerformanceCounters, kind: ErrorKind, n: u32) {
        for _ in 0..n {
            counters.record(kind);
        }
    }

    #[test]
    fn test_block_within_one_cycle() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ErrorThresholds::new(5, 2), t0);
        let mut counters = PerformanceCounters::new();

        inject(&mut counters, ErrorKind::RxCrcError, 4);
        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(10), &mut counters),
            HealthTransition::Unchanged
        );

        inject(&mut counters, ErrorKind::WatchdogError, 1);
        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(20), &mut counters),
            HealthTransition::Blocked
        );
        assert!(monitor.is_blocked());
        assert_eq!(monitor.block_count(), 1);
    }

    #[test]
    fn test_unblock_only_at_window_boundary() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ErrorThresholds::new(5, 2), t0);
        let mut counters = PerformanceCounters::new();

        inject(&mut counters, ErrorKind::RxSizeError, 5);
        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(10), &mut counters),
            HealthTransition::Blocked
        );

        // Boundary of the blocking window: still 5 errors counted, stays blocked
        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(1000), &mut counters),
            HealthTransition::Unchanged
        );
        assert!(counters.this_second().is_empty());

        // Quiet window, but no boundary yet
        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(1500), &mut counters),
            HealthTransition::Unchanged
        );
        assert!(monitor.is_blocked());

        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(2000), &mut counters),
            HealthTransition::Unblocked
        );
        assert!(!monitor.is_blocked());
    }

    #[test]
    fn test_tx_underruns_do_not_block() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ErrorThresholds::new(1, 0), t0);
        let mut counters = PerformanceCounters::new();

        inject(&mut counters, ErrorKind::TxUnderrun, 50);
        assert_eq!(monitor.evaluate(t0, &mut counters), HealthTransition::Unchanged);
    }

    #[test]
    fn test_disabled_thresholds_never_block() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ErrorThresholds::DISABLED, t0);
        let mut counters = PerformanceCounters::new();

        inject(&mut counters, ErrorKind::RxSymbolError, 1000);
        assert_eq!(monitor.evaluate(t0, &mut counters), HealthTransition::Unchanged);
        assert!(!monitor.is_blocked());
    }

    #[test]
    fn test_disabling_thresholds_releases_block() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ErrorThresholds::new(2, 0), t0);
        let mut counters = PerformanceCounters::new();

        inject(&mut counters, ErrorKind::RemoteCrcError, 2);
        assert_eq!(monitor.evaluate(t0, &mut counters), HealthTransition::Blocked);

        monitor.set_thresholds(ErrorThresholds::DISABLED);
        assert_eq!(
            monitor.evaluate(t0 + Duration::from_millis(5), &mut counters),
            HealthTransition::Unblocked
        );
    }
}
