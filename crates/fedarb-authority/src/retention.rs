//! # Retention Policy
//!
//! How long records must be kept, derived from the configuration.
//!
//! A record may be consulted by three things after it is written:
//!
//! - the suspicion sweep, for `record_suspicion_expire_interval`;
//! - a later two-way request, reaching back at most one lease plus two
//!   arbitration round trips;
//! - implicit arbitration, reaching back one implicit lease interval, two
//!   round trips, and one lease.
//!
//! Retention is the longest of the three. Anything older can be dropped
//! without changing a future decision, and `history_start` is raised to
//! the same bound so a request needing more history than is retained is
//! answered conservatively.

use std::time::Duration;

use fedarb_core::{ArbitrationConfig, MonoTime};

/// Retention windows derived from one configuration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    suspicion_window: Duration,
    history_window: Duration,
    implicit_window: Duration,
    cleanup_interval: Duration,
    budget: Duration,
}

impl RetentionPolicy {
    pub fn from_config(config: &ArbitrationConfig) -> Self {
        let round_trips = config.max_arbitration_timeout.saturating_mul(2);
        Self {
            suspicion_window: config.record_suspicion_expire_interval,
            history_window: config.max_lease_duration.saturating_add(round_trips),
            implicit_window: config
                .max_implicit_lease_interval
                .saturating_add(round_trips)
                .saturating_add(config.max_lease_duration),
            cleanup_interval: config.cleanup_interval,
            budget: config.compaction_budget,
        }
    }

    /// How far back implicit arbitration looks for a prior record.
    pub fn implicit_window(&self) -> Duration {
        self.implicit_window
    }

    /// How long any record is kept.
    pub fn retention(&self) -> Duration {
        self.suspicion_window
            .max(self.history_window)
            .max(self.implicit_window)
    }

    /// Records processed before this instant may be removed.
    pub fn time_bound(&self, now: MonoTime) -> MonoTime {
        now - self.retention()
    }

    /// Whether a retention sweep is due, given when the last complete one
    /// finished.
    pub fn sweep_due(&self, last_compact: MonoTime, now: MonoTime) -> bool {
        now.duration_since(last_compact) >= self.cleanup_interval
    }

    /// When the next sweep becomes due.
    pub fn next_sweep(&self, last_compact: MonoTime) -> MonoTime {
        last_compact + self.cleanup_interval
    }

    /// Wall-clock budget for one sweep.
    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retention_is_suspicion_window() {
        let policy = RetentionPolicy::from_config(&ArbitrationConfig::default());
        // 120 + 2*40 + 40 = 240s implicit, 40 + 80 = 120s history, 300s suspicion.
        assert_eq!(policy.implicit_window(), Duration::from_secs(240));
        assert_eq!(policy.retention(), Duration::from_secs(300));
    }

    #[test]
    fn long_implicit_interval_dominates() {
        let config = ArbitrationConfig {
            max_implicit_lease_interval: Duration::from_secs(600),
            ..ArbitrationConfig::default()
        };
        let policy = RetentionPolicy::from_config(&config);
        assert_eq!(policy.retention(), Duration::from_secs(720));
    }

    #[test]
    fn time_bound_saturates() {
        let policy = RetentionPolicy::from_config(&ArbitrationConfig::default());
        assert_eq!(policy.time_bound(MonoTime::from_millis(1_000)), MonoTime::ZERO);
        assert_eq!(
            policy.time_bound(MonoTime::from_millis(301_000)),
            MonoTime::from_millis(1_000)
        );
    }

    #[test]
    fn sweep_spacing() {
        let policy = RetentionPolicy::from_config(&ArbitrationConfig::default());
        let last = MonoTime::from_millis(10_000);
        assert!(!policy.sweep_due(last, MonoTime::from_millis(39_999)));
        assert!(policy.sweep_due(last, MonoTime::from_millis(40_000)));
        assert_eq!(policy.next_sweep(last), MonoTime::from_millis(40_000));
    }
}
