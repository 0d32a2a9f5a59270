//! Router Metrics
//!
//! Lock-free counters for the routing path:
//! - Requests routed, and how many needed a fallback
//! - Rejections (circuit open, burst queue full, queue timeout)
//! - Burst queue usage and wait times
//! - Reported outcomes

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

// ============================================================================
// Counter
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Wait Time Tracking
// ============================================================================

/// Running total and maximum of observed durations
#[derive(Debug, Default)]
pub struct WaitTimes {
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl WaitTimes {
    /// Record one observation
    pub fn record(&self, waited: Duration) {
        let ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Mean wait in milliseconds (0 when empty)
    pub fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    /// Longest wait in milliseconds
    pub fn max_ms(&self) -> u64 {
        self.max_ms.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Counters maintained by the request router
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Calls to `route`
    pub requests: Counter,
    /// Requests that received a routing decision
    pub routed: Counter,
    /// Decisions whose target came from a fallback lane
    pub fallback_resolved: Counter,
    /// Requests whose lane could not be resolved
    pub resolve_failures: Counter,
    /// Requests refused by an open breaker
    pub circuit_open_rejections: Counter,
    /// Requests refused because the burst queue was full
    pub paused_rejections: Counter,
    /// Requests that timed out in the burst queue
    pub queue_timeouts: Counter,
    /// Requests that waited in the burst queue and were admitted
    pub queued: Counter,
    /// Successful outcomes reported
    pub successes: Counter,
    /// Failed outcomes reported
    pub failures: Counter,
    /// Leases dropped without a report
    pub abandoned: Counter,
    /// Time spent in the burst queue
    pub queue_wait: WaitTimes,
}

impl RouterMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.get(),
            routed: self.routed.get(),
            fallback_resolved: self.fallback_resolved.get(),
            resolve_failures: self.resolve_failures.get(),
            circuit_open_rejections: self.circuit_open_rejections.get(),
            paused_rejections: self.paused_rejections.get(),
            queue_timeouts: self.queue_timeouts.get(),
            queued: self.queued.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            abandoned: self.abandoned.get(),
            queue_wait_mean_ms: self.queue_wait.mean_ms(),
            queue_wait_max_ms: self.queue_wait.max_ms(),
        }
    }
}

/// Serializable copy of [`RouterMetrics`]
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub routed: u64,
    pub fallback_resolved: u64,
    pub resolve_failures: u64,
    pub circuit_open_rejections: u64,
    pub paused_rejections: u64,
    pub queue_timeouts: u64,
    pub queued: u64,
    pub successes: u64,
    pub failures: u64,
    pub abandoned: u64,
    pub queue_wait_mean_ms: f64,
    pub queue_wait_max_ms: u64,
}

impl MetricsSnapshot {
    /// Share of requests refused for any reason (0.0 - 1.0)
    #[must_use]
    pub fn rejection_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        let rejected = self.circuit_open_rejections + self.paused_rejections + self.queue_timeouts;
        rejected as f64 / self.requests as f64
    }
}
