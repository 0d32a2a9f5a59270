//! Burst Mode Coordination
//!
//! Temporarily pauses one backend kind so a large job on the peer kind can
//! borrow its memory.
//!
//! # Lifecycle
//!
//! ```text
//! begin_burst(job, kind)
//!     │  pause gate (router starts queuing)            cancel_burst / drop
//!     v                                             ┌──────────────────────> Cancelled
//! Draining ── in-flight == 0 or grace elapsed ──> Active
//!                                                   │ end_burst
//!                                                   v
//!                                  restore gate + ledger, verify
//!                                      │ ok                │ mismatch
//!                                      v                   v
//!                                  Completed             Failed (retained)
//! ```
//!
//! At most one session per backend kind is Draining or Active.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::events::{duration_millis, EventBus, RoutingEvent};
use super::groups::BackendGroups;
use super::lane::{BackendKind, PerKind};
use super::registry::Registry;

/// Closed sessions kept for [`BurstCoordinator::session`] lookups
const MAX_SESSION_HISTORY: usize = 64;

// ============================================================================
// Configuration
// ============================================================================

/// Burst coordinator tuning
#[derive(Clone, Debug)]
pub struct BurstConfig {
    /// How long to wait for in-flight requests before forcing the burst
    pub drain_grace: Duration,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Burst session state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstStatus {
    /// Gate closed, waiting for in-flight requests
    Draining,
    /// Drained; memory lent to the peer kind
    Active,
    /// Ended and fully restored
    Completed,
    /// Cancelled before the drain finished
    Cancelled,
    /// Restoration failed; needs manual intervention
    Failed,
}

impl BurstStatus {
    /// Whether the session still holds the gate
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Draining | Self::Active)
    }
}

/// How the drain phase finished
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every in-flight request finished
    Drained {
        /// Drain duration
        #[serde(with = "duration_millis")]
        waited: Duration,
    },
    /// The grace period elapsed with requests still running
    Forced {
        /// Drain duration (the grace period)
        #[serde(with = "duration_millis")]
        waited: Duration,
        /// Requests still running when forced
        in_flight: usize,
    },
}

/// One burst, from trigger to close
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BurstSession {
    /// Session id
    pub id: Uuid,
    /// External job that triggered the burst
    pub triggering_job_id: String,
    /// Kind whose lanes are paused
    pub paused_backend_kind: BackendKind,
    /// Memory lent to the peer kind (sum of the paused lanes' budgets)
    pub reserved_memory_mb: u64,
    /// When the burst was triggered
    pub started_at: DateTime<Utc>,
    /// When the session closed; `None` while Draining or Active
    pub ended_at: Option<DateTime<Utc>>,
    /// Current status
    pub status: BurstStatus,
    /// Drain result, once known
    pub drain: Option<DrainOutcome>,
    /// Why restoration failed
    pub failure: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Burst coordination failures
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BurstError {
    /// A session for this kind is already Draining or Active
    #[error("Burst already active for {kind} (session {session_id})")]
    AlreadyActive {
        /// Contended kind
        kind: BackendKind,
        /// Session holding it
        session_id: Uuid,
    },

    /// No session with this id is known
    #[error("Unknown burst session {0}")]
    UnknownSession(Uuid),

    /// The session was cancelled before its drain finished
    #[error("Burst session {0} was cancelled")]
    Cancelled(Uuid),

    /// The session is already closed
    #[error("Burst session {session_id} is not active (status {status:?})")]
    NotActive {
        /// Session id
        session_id: Uuid,
        /// Its final status
        status: BurstStatus,
    },

    /// Pre-burst state could not be restored exactly
    #[error("Burst session {session_id} failed to restore: {reason}")]
    RestoreFailed {
        /// Session id
        session_id: Uuid,
        /// Description of the mismatch
        reason: String,
    },
}

// ============================================================================
// Coordinator State
// ============================================================================

struct OpenSession {
    session: BurstSession,
    cancel: Arc<Notify>,
    /// What the paused kind lent before this session
    baseline_lent_mb: u64,
}

#[derive(Default)]
struct BurstState {
    open: PerKind<Option<OpenSession>>,
    /// Memory each kind currently lends to its peer
    lent_mb: PerKind<u64>,
    history: VecDeque<BurstSession>,
    failed: Vec<BurstSession>,
}

impl BurstState {
    fn find_open(&self, session_id: Uuid) -> Option<BackendKind> {
        BackendKind::ALL.into_iter().find(|kind| {
            self.open[*kind]
                .as_ref()
                .is_some_and(|open| open.session.id == session_id)
        })
    }

    fn find_closed(&self, session_id: Uuid) -> Option<&BurstSession> {
        self.history
            .iter()
            .chain(self.failed.iter())
            .find(|s| s.id == session_id)
    }

    fn archive(&mut self, session: BurstSession) {
        if self.history.len() >= MAX_SESSION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(session);
    }

    fn missing(&self, session_id: Uuid) -> BurstError {
        match self.find_closed(session_id) {
            Some(session) => BurstError::NotActive {
                session_id,
                status: session.status,
            },
            None => BurstError::UnknownSession(session_id),
        }
    }
}

/// Cancels a draining session if `begin_burst` is dropped mid-drain
struct DrainGuard<'a> {
    coordinator: &'a BurstCoordinator,
    session_id: Uuid,
    armed: bool,
}

impl DrainGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(session_id = %self.session_id, "Burst trigger dropped while draining");
            let _ = self.coordinator.cancel_draining(self.session_id);
        }
    }
}

// ============================================================================
// Burst Coordinator
// ============================================================================

/// Pauses and restores backend groups for oversized jobs
pub struct BurstCoordinator {
    config: BurstConfig,
    registry: Arc<Registry>,
    groups: Arc<BackendGroups>,
    state: Mutex<BurstState>,
    events: Option<EventBus>,
}

impl BurstCoordinator {
    /// Create a coordinator over the shared backend groups
    #[must_use]
    pub fn new(config: BurstConfig, registry: Arc<Registry>, groups: Arc<BackendGroups>) -> Self {
        Self {
            config,
            registry,
            groups,
            state: Mutex::new(BurstState::default()),
            events: None,
        }
    }

    /// Publish lifecycle events on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn publish(&self, event: RoutingEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Pause `kind`, drain it and lend its memory to the peer kind
    ///
    /// Resolves once external reallocation is safe: every in-flight request of
    /// `kind` finished, or the drain grace elapsed (recorded as
    /// [`DrainOutcome::Forced`]). Dropping the returned future before then
    /// cancels the session and reopens the gate.
    ///
    /// # Errors
    ///
    /// [`BurstError::AlreadyActive`] if `kind` already has an open session,
    /// [`BurstError::Cancelled`] if the session was cancelled while draining.
    pub async fn begin_burst(
        &self,
        triggering_job_id: impl Into<String>,
        kind: BackendKind,
    ) -> Result<BurstSession, BurstError> {
        let triggering_job_id = triggering_job_id.into();
        let session_id = Uuid::new_v4();
        let reserved_memory_mb = self.registry.memory_budget_mb(kind);

        let cancel = {
            let mut state = self.state.lock();
            if let Some(open) = &state.open[kind] {
                return Err(BurstError::AlreadyActive {
                    kind,
                    session_id: open.session.id,
                });
            }
            if let Err(holder) = self.groups.pause(kind, session_id) {
                return Err(BurstError::AlreadyActive {
                    kind,
                    session_id: holder,
                });
            }

            let cancel = Arc::new(Notify::new());
            let baseline_lent_mb = state.lent_mb[kind];
            state.open[kind] = Some(OpenSession {
                session: BurstSession {
                    id: session_id,
                    triggering_job_id: triggering_job_id.clone(),
                    paused_backend_kind: kind,
                    reserved_memory_mb,
                    started_at: Utc::now(),
                    ended_at: None,
                    status: BurstStatus::Draining,
                    drain: None,
                    failure: None,
                },
                cancel: Arc::clone(&cancel),
                baseline_lent_mb,
            });
            cancel
        };

        tracing::info!(
            session_id = %session_id,
            kind = %kind,
            job_id = %triggering_job_id,
            in_flight = self.groups.in_flight(kind),
            "Burst started, draining backend group"
        );
        self.publish(RoutingEvent::BurstStarted {
            session_id,
            kind,
            job_id: triggering_job_id,
        });

        let mut guard = DrainGuard {
            coordinator: self,
            session_id,
            armed: true,
        };

        let started = Instant::now();
        let drain = tokio::select! {
            biased;
            () = cancel.notified() => {
                guard.disarm();
                return Err(BurstError::Cancelled(session_id));
            }
            drained = tokio::time::timeout(self.config.drain_grace, self.groups.wait_drained(kind)) => {
                match drained {
                    Ok(()) => DrainOutcome::Drained { waited: started.elapsed() },
                    Err(_) => {
                        let in_flight = self.groups.in_flight(kind);
                        tracing::warn!(
                            session_id = %session_id,
                            kind = %kind,
                            in_flight,
                            grace_ms = u64::try_from(self.config.drain_grace.as_millis()).unwrap_or(u64::MAX),
                            "Drain grace elapsed, forcing burst with requests in flight"
                        );
                        DrainOutcome::Forced { waited: started.elapsed(), in_flight }
                    }
                }
            }
        };

        let session = {
            let mut state = self.state.lock();
            let lent = state.lent_mb[kind] + reserved_memory_mb;
            let Some(open) = state.open[kind]
                .as_mut()
                .filter(|open| open.session.id == session_id && open.session.status == BurstStatus::Draining)
            else {
                guard.disarm();
                return Err(BurstError::Cancelled(session_id));
            };
            open.session.status = BurstStatus::Active;
            open.session.drain = Some(drain);
            let session = open.session.clone();
            state.lent_mb[kind] = lent;
            session
        };
        guard.disarm();

        tracing::info!(
            session_id = %session_id,
            kind = %kind,
            lent_mb = reserved_memory_mb,
            peer = %kind.peer(),
            "Burst ready, memory lent to peer group"
        );
        self.publish(RoutingEvent::BurstReady {
            session_id,
            kind,
            drain,
        });

        Ok(session)
    }

    /// Cancel a session
    ///
    /// A draining session is closed as Cancelled and its gate reopened at
    /// once; the pending `begin_burst` returns [`BurstError::Cancelled`]. An
    /// active session is ended as by [`BurstCoordinator::end_burst`].
    ///
    /// # Errors
    ///
    /// [`BurstError::UnknownSession`], [`BurstError::NotActive`], or any error
    /// of `end_burst`.
    pub fn cancel_burst(&self, session_id: Uuid) -> Result<BurstSession, BurstError> {
        let status = {
            let state = self.state.lock();
            let kind = state
                .find_open(session_id)
                .ok_or_else(|| state.missing(session_id))?;
            state.open[kind]
                .as_ref()
                .map_or(BurstStatus::Draining, |open| open.session.status)
        };

        match status {
            BurstStatus::Active => self.end_burst(session_id),
            _ => self.cancel_draining(session_id),
        }
    }

    fn cancel_draining(&self, session_id: Uuid) -> Result<BurstSession, BurstError> {
        let (session, released) = {
            let mut state = self.state.lock();
            let kind = state
                .find_open(session_id)
                .ok_or_else(|| state.missing(session_id))?;
            let Some(open) = state.open[kind].take() else {
                return Err(BurstError::UnknownSession(session_id));
            };
            if open.session.status != BurstStatus::Draining {
                let status = open.session.status;
                state.open[kind] = Some(open);
                return Err(BurstError::NotActive { session_id, status });
            }

            let released = self.groups.resume(kind, session_id).unwrap_or(0);
            let mut session = open.session;
            session.status = BurstStatus::Cancelled;
            session.ended_at = Some(Utc::now());
            state.archive(session.clone());
            open.cancel.notify_one();
            (session, released)
        };

        tracing::info!(
            session_id = %session_id,
            kind = %session.paused_backend_kind,
            released,
            "Burst cancelled during drain, routing restored"
        );
        self.publish(RoutingEvent::BurstEnded {
            session_id,
            kind: session.paused_backend_kind,
            status: BurstStatus::Cancelled,
        });
        Ok(session)
    }

    /// End a session and restore pre-burst routing exactly
    ///
    /// Reopens the gate (queued requests are released in FIFO order) and
    /// returns the lent memory. A session that is still draining is cancelled
    /// instead.
    ///
    /// # Errors
    ///
    /// [`BurstError::UnknownSession`], [`BurstError::NotActive`] for closed
    /// sessions, [`BurstError::RestoreFailed`] when the gate or ledger does not
    /// match the pre-burst state; the session is then retained in
    /// [`BurstCoordinator::failed_sessions`].
    pub fn end_burst(&self, session_id: Uuid) -> Result<BurstSession, BurstError> {
        let (session, result) = {
            let mut state = self.state.lock();
            let kind = state
                .find_open(session_id)
                .ok_or_else(|| state.missing(session_id))?;

            let draining = state.open[kind]
                .as_ref()
                .is_some_and(|open| open.session.status == BurstStatus::Draining);
            if draining {
                drop(state);
                return self.cancel_draining(session_id);
            }

            let Some(open) = state.open[kind].take() else {
                return Err(BurstError::UnknownSession(session_id));
            };
            let mut session = open.session;
            session.ended_at = Some(Utc::now());

            let result = self.restore(&mut state, kind, &session, open.baseline_lent_mb);
            match &result {
                Ok(_) => {
                    session.status = BurstStatus::Completed;
                    state.archive(session.clone());
                }
                Err(reason) => {
                    session.status = BurstStatus::Failed;
                    session.failure = Some(reason.clone());
                    state.failed.push(session.clone());
                }
            }
            (session, result)
        };

        let kind = session.paused_backend_kind;
        match result {
            Ok(released) => {
                tracing::info!(
                    session_id = %session_id,
                    kind = %kind,
                    released,
                    "Burst ended, routing restored"
                );
                self.publish(RoutingEvent::BurstEnded {
                    session_id,
                    kind,
                    status: BurstStatus::Completed,
                });
                Ok(session)
            }
            Err(reason) => {
                tracing::error!(
                    session_id = %session_id,
                    kind = %kind,
                    reason = %reason,
                    "Burst restoration failed, manual intervention required"
                );
                self.publish(RoutingEvent::BurstFailed {
                    session_id,
                    kind,
                    reason: reason.clone(),
                });
                Err(BurstError::RestoreFailed { session_id, reason })
            }
        }
    }

    /// Undo the pause and the loan, then verify against the baseline
    fn restore(
        &self,
        state: &mut BurstState,
        kind: BackendKind,
        session: &BurstSession,
        baseline_lent_mb: u64,
    ) -> Result<usize, String> {
        let mut problems = Vec::new();

        match state.lent_mb[kind].checked_sub(session.reserved_memory_mb) {
            Some(remaining) => state.lent_mb[kind] = remaining,
            None => {
                problems.push(format!(
                    "ledger for {kind} holds {} MB, less than the {} MB lent",
                    state.lent_mb[kind], session.reserved_memory_mb
                ));
                state.lent_mb[kind] = 0;
            }
        }

        let released = match self.groups.resume(kind, session.id) {
            Some(released) => released,
            None => {
                problems.push(format!("gate for {kind} was not held by the session"));
                0
            }
        };

        if state.lent_mb[kind] != baseline_lent_mb {
            problems.push(format!(
                "ledger for {kind} holds {} MB, pre-burst {} MB",
                state.lent_mb[kind], baseline_lent_mb
            ));
        }
        if self.groups.is_paused(kind) {
            problems.push(format!("gate for {kind} is still paused"));
        }

        if problems.is_empty() {
            Ok(released)
        } else {
            Err(problems.join("; "))
        }
    }

    /// Open session for `kind`, if any
    #[must_use]
    pub fn active_session(&self, kind: BackendKind) -> Option<BurstSession> {
        self.state.lock().open[kind]
            .as_ref()
            .map(|open| open.session.clone())
    }

    /// Look up a session by id (open or recently closed)
    #[must_use]
    pub fn session(&self, session_id: Uuid) -> Option<BurstSession> {
        let state = self.state.lock();
        match state.find_open(session_id) {
            Some(kind) => state.open[kind].as_ref().map(|open| open.session.clone()),
            None => state.find_closed(session_id).cloned(),
        }
    }

    /// Sessions whose restoration failed
    #[must_use]
    pub fn failed_sessions(&self) -> Vec<BurstSession> {
        self.state.lock().failed.clone()
    }

    /// Whether routing to `kind` is paused
    #[must_use]
    pub fn is_paused(&self, kind: BackendKind) -> bool {
        self.groups.is_paused(kind)
    }

    /// Memory `kind` currently lends to its peer
    #[must_use]
    pub fn lent_memory_mb(&self, kind: BackendKind) -> u64 {
        self.state.lock().lent_mb[kind]
    }

    /// Capacity `kind` may use right now, including memory borrowed from its peer
    ///
    /// The base is the declared host capacity, or the sum of the kind's lane
    /// budgets when none is declared.
    #[must_use]
    pub fn effective_capacity_mb(&self, kind: BackendKind) -> u64 {
        let base = self
            .registry
            .host_capacity_mb(kind)
            .unwrap_or_else(|| self.registry.memory_budget_mb(kind));
        let state = self.state.lock();
        (base + state.lent_mb[kind.peer()]).saturating_sub(state.lent_mb[kind])
    }
}

impl std::fmt::Debug for BurstCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurstCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
