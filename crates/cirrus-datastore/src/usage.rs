//! Per-tenant resource usage history built from instance telemetry.

use chrono::{DateTime, Duration, Utc};

use cirrus_state::UsageSample;

/// At most one sample is opened per tenant within this many minutes.
pub const USAGE_PERIOD_MINUTES: i64 = 5;

/// Change in a tenant's usage caused by one instance report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub vcpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

impl UsageDelta {
    pub fn is_zero(&self) -> bool {
        self.vcpu == 0 && self.memory_mb == 0 && self.disk_mb == 0
    }
}

/// Time-ascending cumulative samples for one tenant.
#[derive(Debug, Clone, Default)]
pub struct UsageHistory {
    samples: Vec<UsageSample>,
}

impl UsageHistory {
    /// Fold `delta` into the history. Inside [`USAGE_PERIOD_MINUTES`] of the last
    /// sample the totals are updated in place and the sample keeps its
    /// timestamp; otherwise a new sample stamped `now` is appended.
    pub fn record(&mut self, delta: UsageDelta, now: DateTime<Utc>) {
        if delta.is_zero() {
            return;
        }
        let (vcpu, memory_mb, disk_mb) = self
            .samples
            .last()
            .map(|s| (s.vcpu, s.memory_mb, s.disk_mb))
            .unwrap_or_default();
        let totals = UsageSample {
            timestamp: now,
            vcpu: vcpu + delta.vcpu,
            memory_mb: memory_mb + delta.memory_mb,
            disk_mb: disk_mb + delta.disk_mb,
        };

        match self.samples.last_mut() {
            Some(last) if now - last.timestamp < Duration::minutes(USAGE_PERIOD_MINUTES) => {
                *last = UsageSample {
                    timestamp: last.timestamp,
                    ..totals
                };
            }
            _ => self.samples.push(totals),
        }
    }

    /// Samples with `start <= timestamp <= end`.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<UsageSample> {
        let first = self.samples.partition_point(|s| s.timestamp < start);
        let last = self.samples.partition_point(|s| s.timestamp <= end);
        if first >= last {
            return Vec::new();
        }
        self.samples[first..last].to_vec()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
