//! Routing Events
//!
//! Structured notifications for external logging/metrics collaborators. Every
//! event is also emitted through `tracing` at the point where it happens; the
//! bus only adds a programmatic feed.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::breaker::{CircuitState, TransitionReason};
use super::burst::{BurstStatus, DrainOutcome};
use super::health::HealthStatus;
use super::lane::BackendKind;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observable happened in the routing core
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoutingEvent {
    /// Resolution followed one fallback edge
    FallbackTraversed {
        /// Lane the caller asked for
        requested: String,
        /// Lane without explicit config
        from: String,
        /// Its fallback
        to: String,
    },

    /// A lane's probed health changed
    HealthChanged {
        /// Lane name
        lane: String,
        /// Previous status
        from: HealthStatus,
        /// New status
        to: HealthStatus,
    },

    /// A lane's circuit breaker changed state
    BreakerTransition {
        /// Lane name
        lane: String,
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
        /// What caused the transition
        reason: TransitionReason,
    },

    /// A burst session began draining a backend kind
    BurstStarted {
        /// Session id
        session_id: Uuid,
        /// Paused kind
        kind: BackendKind,
        /// External job that triggered the burst
        job_id: String,
    },

    /// The paused kind drained; reallocation is safe
    BurstReady {
        /// Session id
        session_id: Uuid,
        /// Paused kind
        kind: BackendKind,
        /// How the drain finished
        drain: DrainOutcome,
    },

    /// A burst session closed and routing was restored
    BurstEnded {
        /// Session id
        session_id: Uuid,
        /// Paused kind
        kind: BackendKind,
        /// Final status (`Completed` or `Cancelled`)
        status: BurstStatus,
    },

    /// Restoring pre-burst state failed; manual intervention required
    BurstFailed {
        /// Session id
        session_id: Uuid,
        /// Paused kind
        kind: BackendKind,
        /// Description of the mismatch
        reason: String,
    },

    /// A request was rejected because the burst queue was full
    QueueRejected {
        /// Resolved lane
        lane: String,
        /// Paused kind
        kind: BackendKind,
        /// Queue depth limit
        depth: usize,
    },

    /// A queued request gave up waiting
    QueueTimedOut {
        /// Resolved lane
        lane: String,
        /// Paused kind
        kind: BackendKind,
        /// Time spent queued
        #[serde(with = "duration_millis")]
        waited: Duration,
    },
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Broadcast channel for [`RoutingEvent`]s
///
/// Cheap to clone. Publishing never blocks; slow subscribers lose the oldest
/// events (`RecvError::Lagged`).
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RoutingEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody is subscribed
    pub fn publish(&self, event: RoutingEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RoutingEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
