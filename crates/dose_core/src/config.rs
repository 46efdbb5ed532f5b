//! Engine tuning resolved once at startup and handed to the service.

use std::time::Duration;

use crate::dose::BucketBoundaries;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Minutes past the scheduled instant before a pending dose counts as overdue.
    pub grace_minutes: u32,
    /// Minutes before the scheduled instant during which a reminder is due.
    pub lead_minutes: u32,
    pub scan_interval: Duration,
    /// Overlays older than this many days are pruned by `prune_history`.
    pub retention_days: u32,
    pub buckets: BucketBoundaries,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_minutes: 30,
            lead_minutes: 15,
            scan_interval: Duration::from_secs(60),
            retention_days: 90,
            buckets: BucketBoundaries::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_grace_minutes(mut self, grace_minutes: u32) -> Self {
        self.grace_minutes = grace_minutes;
        self
    }

    pub fn with_lead_minutes(mut self, lead_minutes: u32) -> Self {
        self.lead_minutes = lead_minutes;
        self
    }

    /// Intervals below 10 ms are raised to 10 ms so the timer cannot spin.
    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval.max(Duration::from_millis(10));
        self
    }

    pub fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }
}
