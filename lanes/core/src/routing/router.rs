//! Request Router
//!
//! Entry point for every request. Combines resolution, breaker admission and
//! the burst gate into a single decision:
//!
//! ```text
//! route(lane) ──> resolve ──> breaker open? ──> gate paused? ──> breaker admission ──> RoutingDecision
//!                   │             │ yes            │ yes (queue)        │ refused
//!                   v             v                v                    v
//!                Resolve     CircuitOpen   BackendPaused / QueueTimeout  CircuitOpen
//! ```
//!
//! The decision carries an [`OutcomeLease`]. Reporting on the lease feeds the
//! breaker, and dropping it ends the request's in-flight accounting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::breaker::{Admission, CircuitBreaker, CircuitOpenError, FailureKind};
use super::events::{EventBus, RoutingEvent};
use super::groups::{BackendGroups, GateError, InFlightGuard};
use super::lane::BackendKind;
use super::metrics::RouterMetrics;
use super::resolver::{LaneResolver, ResolveError, ResolvedTarget};

// ============================================================================
// Configuration
// ============================================================================

/// Burst queue limits applied by the router
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    /// Maximum queued requests per paused backend kind
    pub queue_depth: usize,
    /// Default time a request may wait in the queue
    pub queue_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_depth: 50,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Request / Decision
// ============================================================================

/// Per-request routing options
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    /// Overrides [`RouterConfig::queue_timeout`] for this request
    pub queue_timeout: Option<Duration>,
    /// Caller's own identifier, used only in logs
    pub label: Option<String>,
}

impl RequestMeta {
    /// Options with every default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a per-request queue timeout
    #[must_use]
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    /// Attach a label for log correlation
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Where to send a request, plus the lease that reports its outcome
#[derive(Debug)]
pub struct RoutingDecision {
    /// Router-assigned request id
    pub request_id: Uuid,
    /// Forwarding target
    pub target: ResolvedTarget,
    /// Time spent in a burst queue (zero when the gate was open)
    pub queued_for: Duration,
    /// Outcome reporting handle
    pub lease: OutcomeLease,
}

/// Serializable summary of a [`RoutingDecision`]
#[derive(Clone, Debug, Serialize)]
pub struct DecisionSummary {
    /// Request id
    pub request_id: Uuid,
    /// Resolved backend
    pub target: ResolvedTarget,
    /// Milliseconds spent in a burst queue
    pub queued_ms: u64,
    /// Whether the request is the half-open trial
    pub trial: bool,
}

impl RoutingDecision {
    /// Summary for logs and external collaborators
    #[must_use]
    pub fn summary(&self) -> DecisionSummary {
        DecisionSummary {
            request_id: self.request_id,
            target: self.target.clone(),
            queued_ms: u64::try_from(self.queued_for.as_millis()).unwrap_or(u64::MAX),
            trial: self.lease.is_trial(),
        }
    }
}

// ============================================================================
// Outcome Lease
// ============================================================================

/// Holds a request's breaker admission and in-flight slot
///
/// Report exactly once with [`OutcomeLease::report_success`] or
/// [`OutcomeLease::report_failure`]. A lease dropped without a report
/// releases a half-open trial without judging the backend.
#[derive(Debug)]
#[must_use = "report the outcome so the circuit breaker sees it"]
pub struct OutcomeLease {
    lane: String,
    admission: Admission,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<RouterMetrics>,
    reported: bool,
    in_flight_guard: InFlightGuard,
}

impl OutcomeLease {
    /// Lane the lease was issued for
    pub fn lane(&self) -> &str {
        &self.lane
    }

    /// Backend kind whose in-flight count this lease holds
    pub fn backend_kind(&self) -> BackendKind {
        self.in_flight_guard.kind()
    }

    /// Whether this request is the breaker's half-open trial
    pub fn is_trial(&self) -> bool {
        self.admission == Admission::Trial
    }

    /// The backend answered successfully
    pub fn report_success(mut self) {
        self.reported = true;
        self.metrics.successes.inc();
        self.breaker.record_success(&self.lane, self.admission);
    }

    /// The backend call failed
    pub fn report_failure(mut self, kind: FailureKind) {
        self.reported = true;
        self.metrics.failures.inc();
        self.breaker.record_failure(&self.lane, kind, self.admission);
    }
}

impl Drop for OutcomeLease {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        self.metrics.abandoned.inc();
        if self.admission == Admission::Trial {
            self.breaker.abandon_trial(&self.lane);
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a request was not routed
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RouterError {
    /// The lane could not be resolved to a backend
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The lane's breaker refused the request
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The burst queue of a paused kind is full
    #[error("Backend kind '{kind}' is paused for a burst and its queue is full ({depth} waiting)")]
    BackendPaused { kind: BackendKind, depth: usize },

    /// The request waited in the burst queue for its whole timeout
    #[error("Request for lane '{lane}' timed out after {}ms in the burst queue", waited.as_millis())]
    QueueTimeout { lane: String, waited: Duration },

    /// The router no longer accepts requests
    #[error("Router is shutting down")]
    ShuttingDown,
}

// ============================================================================
// Router
// ============================================================================

/// Routes requests to lanes
pub struct RequestRouter {
    resolver: LaneResolver,
    breaker: Arc<CircuitBreaker>,
    groups: Arc<BackendGroups>,
    config: RouterConfig,
    metrics: Arc<RouterMetrics>,
    events: Option<EventBus>,
    shutting_down: AtomicBool,
}

impl RequestRouter {
    pub fn new(
        resolver: LaneResolver,
        breaker: Arc<CircuitBreaker>,
        groups: Arc<BackendGroups>,
        config: RouterConfig,
    ) -> Self {
        Self {
            resolver,
            breaker,
            groups,
            config,
            metrics: Arc::new(RouterMetrics::new()),
            events: None,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Publish queue rejections and timeouts on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn resolver(&self) -> &LaneResolver {
        &self.resolver
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Route a request for `requested_lane`
    ///
    /// May wait while the resolved backend kind is paused by a burst. All
    /// other outcomes are decided without waiting.
    ///
    /// # Errors
    ///
    /// See [`RouterError`].
    pub async fn route(
        &self,
        requested_lane: &str,
        meta: RequestMeta,
    ) -> Result<RoutingDecision, RouterError> {
        self.metrics.requests.inc();
        if self.is_shutting_down() {
            return Err(RouterError::ShuttingDown);
        }

        let target = self.resolver.resolve(requested_lane).map_err(|e| {
            self.metrics.resolve_failures.inc();
            e
        })?;

        if let Err(e) = self.breaker.check(&target.lane_name) {
            self.metrics.circuit_open_rejections.inc();
            return Err(e.into());
        }

        let kind = target.backend_kind;
        let queue_timeout = meta.queue_timeout.unwrap_or(self.config.queue_timeout);
        let (in_flight, queued_for) = match self
            .groups
            .admit(kind, self.config.queue_depth, queue_timeout)
            .await
        {
            Ok(admitted) => admitted,
            Err(GateError::Full { depth }) => {
                self.metrics.paused_rejections.inc();
                tracing::warn!(
                    lane = %target.lane_name,
                    kind = %kind,
                    depth,
                    "Burst queue full, rejecting request"
                );
                self.publish(RoutingEvent::QueueRejected {
                    lane: target.lane_name.clone(),
                    kind,
                    depth,
                });
                return Err(RouterError::BackendPaused { kind, depth });
            }
            Err(GateError::TimedOut { waited }) => {
                self.metrics.queue_timeouts.inc();
                self.metrics.queue_wait.record(waited);
                tracing::warn!(
                    lane = %target.lane_name,
                    kind = %kind,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "Request timed out in burst queue"
                );
                self.publish(RoutingEvent::QueueTimedOut {
                    lane: target.lane_name.clone(),
                    kind,
                    waited,
                });
                return Err(RouterError::QueueTimeout {
                    lane: target.lane_name,
                    waited,
                });
            }
        };

        if !queued_for.is_zero() {
            self.metrics.queued.inc();
            self.metrics.queue_wait.record(queued_for);
        }

        if self.is_shutting_down() {
            return Err(RouterError::ShuttingDown);
        }

        // Dropping `in_flight` on refusal releases the slot
        let admission = match self.breaker.try_acquire(&target.lane_name) {
            Ok(admission) => admission,
            Err(e) => {
                self.metrics.circuit_open_rejections.inc();
                return Err(e.into());
            }
        };

        self.metrics.routed.inc();
        if target.used_fallback() {
            self.metrics.fallback_resolved.inc();
        }

        let request_id = Uuid::new_v4();
        tracing::debug!(
            request_id = %request_id,
            requested = requested_lane,
            lane = %target.lane_name,
            kind = %kind,
            label = meta.label.as_deref().unwrap_or(""),
            trial = admission == Admission::Trial,
            "Request routed"
        );

        Ok(RoutingDecision {
            request_id,
            lease: OutcomeLease {
                lane: target.lane_name.clone(),
                admission,
                breaker: Arc::clone(&self.breaker),
                metrics: Arc::clone(&self.metrics),
                reported: false,
                in_flight_guard: in_flight,
            },
            target,
            queued_for,
        })
    }

    /// Refuse all new requests
    ///
    /// Requests already routed keep their leases.
    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::info!("Request router shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn publish(&self, event: RoutingEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}
