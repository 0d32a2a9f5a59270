//! Per-Lane Circuit Breaker
//!
//! Decides whether traffic may be sent to a lane, based on live call outcomes
//! reported by the router and on health signals from the monitor.
//!
//! ```text
//! +--------+   K failures / OOM /    +------+   cooldown elapsed   +-----------+
//! | Closed | ----------------------> | Open | -------------------> | Half-Open |
//! +--------+   probe Unavailable     +------+   (next acquire)     +-----------+
//!     ^                                 ^                                |
//!     |          trial success          |   trial failure                |
//!     +---------------------------------+--------------------------------+
//!                                        (cooldown * multiplier^n)
//! ```
//!
//! - **Closed**: requests flow; consecutive failures are counted
//! - **Open**: every request fast-fails with [`CircuitOpenError`]
//! - **Half-Open**: exactly one trial request is admitted
//!
//! # Thread Safety
//!
//! Each lane's state lives behind its own `parking_lot::Mutex`, and lanes are
//! held in a `DashMap`, so callers routing to different lanes never contend.
//! Locks are never held across an `.await`; events and logs are emitted after
//! the lock is released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use super::events::{EventBus, RoutingEvent};
use super::health::HealthStatus;

// ============================================================================
// States and Reasons
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Rejecting requests until the cooldown elapses
    Open,

    /// Admitting a single trial request
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Why a breaker changed state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Consecutive failures reached the threshold
    FailureThreshold,
    /// A call failed with an out-of-memory error
    OutOfMemory,
    /// The health monitor reported the lane unavailable
    HealthProbe,
    /// The cooldown elapsed and a trial was admitted
    CooldownElapsed,
    /// The half-open trial succeeded
    TrialSucceeded,
    /// The half-open trial failed
    TrialFailed,
    /// An operator forced the state
    Forced,
    /// An operator reset the breaker
    Reset,
}

/// Classification of a failed call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection refused or reset
    Connect,
    /// The call exceeded its deadline
    Timeout,
    /// The backend answered with a server error
    ServerError,
    /// The backend ran out of memory
    OutOfMemory,
}

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker tuning
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,

    /// Base open duration
    pub cooldown: Duration,

    /// Cooldown multiplier per consecutive reopening
    pub backoff_multiplier: f64,

    /// Cooldown ceiling
    pub max_cooldown: Duration,

    /// `retry_after` given to callers while a half-open trial is in flight
    pub trial_retry_after: Duration,

    /// Open immediately on [`FailureKind::OutOfMemory`]
    pub trip_on_out_of_memory: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
            trial_retry_after: Duration::from_secs(1),
            trip_on_out_of_memory: true,
        }
    }
}

impl BreakerConfig {
    /// Open duration after `reopen_count` consecutive failed trials
    #[must_use]
    pub fn cooldown_for(&self, reopen_count: u32) -> Duration {
        let exponent = i32::try_from(reopen_count).unwrap_or(i32::MAX);
        let secs = self.cooldown.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_cooldown.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_cooldown
        }
    }
}

// ============================================================================
// Errors and Admission
// ============================================================================

/// A request was refused because the lane's breaker is not admitting traffic
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("Circuit open for lane '{lane}', retry after {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    /// Lane whose breaker refused the request
    pub lane: String,
    /// How long the caller should wait before retrying (never zero)
    pub retry_after: Duration,
}

/// How a request was admitted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed
    Normal,
    /// The single half-open trial
    Trial,
}

// ============================================================================
// Lane Breaker
// ============================================================================

#[derive(Debug)]
struct LaneBreaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    consecutive_failures: u32,
    reopen_count: u32,
    trial_in_flight: bool,
    last_health: Option<HealthStatus>,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
}

impl LaneBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            next_probe_at: None,
            consecutive_failures: 0,
            reopen_count: 0,
            trial_in_flight: false,
            last_health: None,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
        }
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.next_probe_at = Some(now + cooldown);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.next_probe_at = None;
        self.consecutive_failures = 0;
        self.reopen_count = 0;
        self.trial_in_flight = false;
    }

    fn retry_after(&self, now: Instant, config: &BreakerConfig) -> Duration {
        let remaining = match self.state {
            CircuitState::Open => self
                .next_probe_at
                .map_or(config.cooldown, |at| at.saturating_duration_since(now)),
            _ => config.trial_retry_after,
        };
        remaining.max(Duration::from_millis(1))
    }
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
    reason: TransitionReason,
}

// ============================================================================
// Breaker Snapshot
// ============================================================================

/// Point-in-time view of one lane's breaker
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    /// Lane name
    pub lane: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub consecutive_failures: u32,
    /// Consecutive failed trials (drives the backoff)
    pub reopen_count: u32,
    /// Whether the half-open trial is outstanding
    pub trial_in_flight: bool,
    /// Time spent open so far
    pub open_for: Option<Duration>,
    /// Time until a trial will be admitted
    pub retry_after: Option<Duration>,
    /// Latest health signal received
    pub last_health: Option<HealthStatus>,
    /// Successful calls reported
    pub total_successes: u64,
    /// Failed calls reported
    pub total_failures: u64,
    /// Requests refused
    pub rejected: u64,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breakers for every lane
///
/// Breakers are created on first use, so lanes need no registration.
pub struct CircuitBreaker {
    config: BreakerConfig,
    lanes: DashMap<String, Arc<Mutex<LaneBreaker>>>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    /// Create a breaker set with `config`
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            lanes: DashMap::new(),
            events: None,
        }
    }

    /// Publish transitions on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lane(&self, lane: &str) -> Arc<Mutex<LaneBreaker>> {
        if let Some(existing) = self.lanes.get(lane) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.lanes
                .entry(lane.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(LaneBreaker::new())))
                .value(),
        )
    }

    /// Current state of `lane`
    #[must_use]
    pub fn state(&self, lane: &str) -> CircuitState {
        self.lanes
            .get(lane)
            .map_or(CircuitState::Closed, |b| b.value().lock().state)
    }

    /// Non-consuming admission check
    ///
    /// Succeeds when [`CircuitBreaker::try_acquire`] would currently admit a
    /// request, without taking the half-open trial.
    ///
    /// # Errors
    ///
    /// [`CircuitOpenError`] while open within the cooldown, or while a
    /// half-open trial is in flight.
    pub fn check(&self, lane: &str) -> Result<(), CircuitOpenError> {
        let Some(breaker) = self.lanes.get(lane).map(|b| Arc::clone(b.value())) else {
            return Ok(());
        };
        let now = Instant::now();
        let mut b = breaker.lock();

        let admits = match b.state {
            CircuitState::Closed => true,
            CircuitState::Open => b.next_probe_at.is_some_and(|at| now >= at),
            CircuitState::HalfOpen => !b.trial_in_flight,
        };
        if admits {
            Ok(())
        } else {
            b.rejected += 1;
            Err(CircuitOpenError {
                lane: lane.to_string(),
                retry_after: b.retry_after(now, &self.config),
            })
        }
    }

    /// Take an admission for one request
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and this
    /// caller becomes its trial.
    ///
    /// # Errors
    ///
    /// [`CircuitOpenError`] when the breaker refuses the request.
    pub fn try_acquire(&self, lane: &str) -> Result<Admission, CircuitOpenError> {
        let breaker = self.lane(lane);
        let now = Instant::now();

        let (result, transition) = {
            let mut b = breaker.lock();
            match b.state {
                CircuitState::Closed => (Ok(Admission::Normal), None),
                CircuitState::Open if b.next_probe_at.is_some_and(|at| now >= at) => {
                    b.state = CircuitState::HalfOpen;
                    b.trial_in_flight = true;
                    (
                        Ok(Admission::Trial),
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            reason: TransitionReason::CooldownElapsed,
                        }),
                    )
                }
                CircuitState::HalfOpen if !b.trial_in_flight => {
                    b.trial_in_flight = true;
                    (Ok(Admission::Trial), None)
                }
                CircuitState::Open | CircuitState::HalfOpen => {
                    b.rejected += 1;
                    let err = CircuitOpenError {
                        lane: lane.to_string(),
                        retry_after: b.retry_after(now, &self.config),
                    };
                    (Err(err), None)
                }
            }
        };

        self.emit(lane, transition);
        result
    }

    /// Report a successful call
    ///
    /// While half-open only the trial's report moves the state; a request
    /// admitted before the trip only counts toward the totals.
    pub fn record_success(&self, lane: &str, admission: Admission) {
        let breaker = self.lane(lane);
        let transition = {
            let mut b = breaker.lock();
            b.total_successes += 1;
            match b.state {
                CircuitState::Closed => {
                    b.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if admission == Admission::Trial => {
                    b.close();
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                        reason: TransitionReason::TrialSucceeded,
                    })
                }
                // Late report from a request admitted before the breaker opened
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.emit(lane, transition);
    }

    /// Report a failed call
    ///
    /// Same admission rule as [`CircuitBreaker::record_success`]: only the
    /// trial can reopen a half-open breaker.
    pub fn record_failure(&self, lane: &str, kind: FailureKind, admission: Admission) {
        let breaker = self.lane(lane);
        let now = Instant::now();
        let transition = {
            let mut b = breaker.lock();
            b.total_failures += 1;

            match b.state {
                CircuitState::Closed => {
                    b.consecutive_failures = b.consecutive_failures.saturating_add(1);
                    let reason = if kind == FailureKind::OutOfMemory
                        && self.config.trip_on_out_of_memory
                    {
                        Some(TransitionReason::OutOfMemory)
                    } else if b.consecutive_failures >= self.config.failure_threshold {
                        Some(TransitionReason::FailureThreshold)
                    } else {
                        None
                    };
                    reason.map(|reason| {
                        b.open(now, self.config.cooldown_for(0));
                        Transition {
                            from: CircuitState::Closed,
                            to: CircuitState::Open,
                            reason,
                        }
                    })
                }
                CircuitState::HalfOpen if admission == Admission::Trial => {
                    b.reopen_count = b.reopen_count.saturating_add(1);
                    let cooldown = self.config.cooldown_for(b.reopen_count);
                    b.open(now, cooldown);
                    Some(Transition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Open,
                        reason: TransitionReason::TrialFailed,
                    })
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.emit(lane, transition);
    }

    /// Release a half-open trial whose outcome will never be reported
    ///
    /// The state is left unchanged; the next caller becomes the trial.
    pub fn abandon_trial(&self, lane: &str) {
        if let Some(breaker) = self.lanes.get(lane).map(|b| Arc::clone(b.value())) {
            let mut b = breaker.lock();
            if b.state == CircuitState::HalfOpen && b.trial_in_flight {
                b.trial_in_flight = false;
                tracing::debug!(lane = %lane, "Half-open trial abandoned, slot released");
            }
        }
    }

    /// Feed a health monitor signal
    ///
    /// `Unavailable` opens a closed breaker. Other signals are recorded only;
    /// the breaker stays the authority over routing.
    pub fn observe_health(&self, lane: &str, status: HealthStatus) {
        let breaker = self.lane(lane);
        let now = Instant::now();
        let transition = {
            let mut b = breaker.lock();
            b.last_health = Some(status);
            if status == HealthStatus::Unavailable && b.state == CircuitState::Closed {
                b.open(now, self.config.cooldown_for(0));
                Some(Transition {
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                    reason: TransitionReason::HealthProbe,
                })
            } else {
                None
            }
        };
        self.emit(lane, transition);
    }

    /// Force a lane into `state` (admin/testing)
    pub fn force_state(&self, lane: &str, state: CircuitState) {
        let breaker = self.lane(lane);
        let now = Instant::now();
        let transition = {
            let mut b = breaker.lock();
            let from = b.state;
            match state {
                CircuitState::Closed => b.close(),
                CircuitState::Open => {
                    let cooldown = self.config.cooldown_for(b.reopen_count);
                    b.open(now, cooldown);
                }
                CircuitState::HalfOpen => {
                    b.state = CircuitState::HalfOpen;
                    b.trial_in_flight = false;
                }
            }
            (from != state).then_some(Transition {
                from,
                to: state,
                reason: TransitionReason::Forced,
            })
        };
        self.emit(lane, transition);
    }

    /// Return a lane to a fresh closed breaker
    pub fn reset(&self, lane: &str) {
        let Some(breaker) = self.lanes.get(lane).map(|b| Arc::clone(b.value())) else {
            return;
        };
        let transition = {
            let mut b = breaker.lock();
            let from = b.state;
            *b = LaneBreaker::new();
            (from != CircuitState::Closed).then_some(Transition {
                from,
                to: CircuitState::Closed,
                reason: TransitionReason::Reset,
            })
        };
        self.emit(lane, transition);
    }

    /// Snapshot of one lane's breaker
    #[must_use]
    pub fn snapshot(&self, lane: &str) -> Option<BreakerSnapshot> {
        let breaker = self.lanes.get(lane).map(|b| Arc::clone(b.value()))?;
        let b = breaker.lock();
        Some(self.snapshot_of(lane, &b))
    }

    /// Snapshots of every known lane, in name order
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .lanes
            .iter()
            .map(|entry| {
                let b = entry.value().lock();
                self.snapshot_of(entry.key(), &b)
            })
            .collect();
        snapshots.sort_by(|a, b| a.lane.cmp(&b.lane));
        snapshots
    }

    fn snapshot_of(&self, lane: &str, b: &LaneBreaker) -> BreakerSnapshot {
        let now = Instant::now();
        BreakerSnapshot {
            lane: lane.to_string(),
            state: b.state,
            consecutive_failures: b.consecutive_failures,
            reopen_count: b.reopen_count,
            trial_in_flight: b.trial_in_flight,
            open_for: b.opened_at.map(|at| now.saturating_duration_since(at)),
            retry_after: b
                .next_probe_at
                .filter(|_| b.state == CircuitState::Open)
                .map(|at| at.saturating_duration_since(now)),
            last_health: b.last_health,
            total_successes: b.total_successes,
            total_failures: b.total_failures,
            rejected: b.rejected,
        }
    }

    fn emit(&self, lane: &str, transition: Option<Transition>) {
        let Some(Transition { from, to, reason }) = transition else {
            return;
        };

        match to {
            CircuitState::Open => tracing::warn!(
                lane = %lane,
                from = %from,
                reason = ?reason,
                "Circuit breaker opened - lane fast-failing"
            ),
            CircuitState::HalfOpen => tracing::info!(
                lane = %lane,
                from = %from,
                reason = ?reason,
                "Circuit breaker half-open - admitting trial request"
            ),
            CircuitState::Closed => tracing::info!(
                lane = %lane,
                from = %from,
                reason = ?reason,
                "Circuit breaker closed - lane recovered"
            ),
        }

        if let Some(events) = &self.events {
            events.publish(RoutingEvent::BreakerTransition {
                lane: lane.to_string(),
                from,
                to,
                reason,
            });
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("lanes", &self.lanes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(30),
            ..Default::default()
        })
    }

    #[test]
    fn test_initial_state_closed() {
        let breaker = breaker(3);
        assert_eq!(breaker.state("x"), CircuitState::Closed);
        assert!(breaker.check("x").is_ok());
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(5);

        for _ in 0..4 {
            breaker.record_failure("x", FailureKind::ServerError, Admission::Normal);
        }
        assert_eq!(breaker.state("x"), CircuitState::Closed);

        breaker.record_failure("x", FailureKind::ServerError, Admission::Normal);
        assert_eq!(breaker.state("x"), CircuitState::Open);

        let err = breaker.try_acquire("x").unwrap_err();
        assert_eq!(err.lane, "x");
        assert!(err.retry_after > Duration::ZERO);
        assert!(err.retry_after <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3);

        breaker.record_failure("x", FailureKind::Timeout, Admission::Normal);
        breaker.record_failure("x", FailureKind::Timeout, Admission::Normal);
        breaker.record_success("x", Admission::Normal);
        breaker.record_failure("x", FailureKind::Timeout, Admission::Normal);

        assert_eq!(breaker.state("x"), CircuitState::Closed);
        assert_eq!(breaker.snapshot("x").unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let breaker = breaker(1);
        breaker.record_failure("x", FailureKind::Connect, Admission::Normal);

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(breaker.check("x").is_ok());
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Trial));
        assert_eq!(breaker.state("x"), CircuitState::HalfOpen);

        let err = breaker.try_acquire("x").unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(1));
        assert!(breaker.check("x").is_err());

        breaker.record_success("x", Admission::Trial);
        let snapshot = breaker.snapshot("x").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.reopen_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_backs_off() {
        let breaker = breaker(1);
        breaker.record_failure("x", FailureKind::Connect, Admission::Normal);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Trial));
        breaker.record_failure("x", FailureKind::Connect, Admission::Trial);

        let snapshot = breaker.snapshot("x").unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.reopen_count, 1);
        // 30s * 2^1
        assert_eq!(snapshot.retry_after, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.try_acquire("x").is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Trial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_normal_reports_leave_trial_in_charge() {
        let breaker = breaker(1);
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Normal));
        breaker.record_failure("x", FailureKind::Connect, Admission::Normal);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Trial));

        // Requests admitted before the trip finish while the trial is out
        breaker.record_success("x", Admission::Normal);
        breaker.record_failure("x", FailureKind::Timeout, Admission::Normal);

        let snapshot = breaker.snapshot("x").unwrap();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.reopen_count, 0);
        assert_eq!(snapshot.total_successes, 1);
        assert_eq!(snapshot.total_failures, 2);
        assert!(breaker.try_acquire("x").is_err());

        breaker.record_success("x", Admission::Trial);
        assert_eq!(breaker.state("x"), CircuitState::Closed);
    }

    #[test]
    fn test_cooldown_is_capped() {
        let config = BreakerConfig::default();
        assert_eq!(config.cooldown_for(0), Duration::from_secs(30));
        assert_eq!(config.cooldown_for(2), Duration::from_secs(120));
        assert_eq!(config.cooldown_for(10), Duration::from_secs(300));
        assert_eq!(config.cooldown_for(u32::MAX), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = breaker(1);
        breaker.record_failure("x", FailureKind::Connect, Admission::Normal);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Trial));
        breaker.abandon_trial("x");

        assert_eq!(breaker.state("x"), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Trial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_memory_trips_immediately() {
        let breaker = breaker(5);
        breaker.record_failure("x", FailureKind::OutOfMemory, Admission::Normal);
        assert_eq!(breaker.state("x"), CircuitState::Open);

        let lenient = CircuitBreaker::new(BreakerConfig {
            trip_on_out_of_memory: false,
            ..Default::default()
        });
        lenient.record_failure("x", FailureKind::OutOfMemory, Admission::Normal);
        assert_eq!(lenient.state("x"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_unavailable_opens_breaker() {
        let breaker = breaker(5);

        breaker.observe_health("x", HealthStatus::Degraded);
        assert_eq!(breaker.state("x"), CircuitState::Closed);

        breaker.observe_health("x", HealthStatus::Unavailable);
        assert_eq!(breaker.state("x"), CircuitState::Open);

        // Healthy signal does not close it; only a trial does
        breaker.observe_health("x", HealthStatus::Healthy);
        assert_eq!(breaker.state("x"), CircuitState::Open);
        assert_eq!(
            breaker.snapshot("x").unwrap().last_health,
            Some(HealthStatus::Healthy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let breaker = breaker(1).with_events(bus);

        breaker.record_failure("x", FailureKind::Timeout, Admission::Normal);

        assert_eq!(
            rx.recv().await.unwrap(),
            RoutingEvent::BreakerTransition {
                lane: "x".into(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
                reason: TransitionReason::FailureThreshold,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_state_and_reset() {
        let breaker = breaker(5);

        breaker.force_state("x", CircuitState::Open);
        assert!(breaker.try_acquire("x").is_err());

        breaker.reset("x");
        let snapshot = breaker.snapshot("x").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.rejected, 0);
        assert_eq!(breaker.try_acquire("x"), Ok(Admission::Normal));
    }

    #[test]
    fn test_all_snapshots_sorted() {
        let breaker = breaker(5);
        breaker.record_success("b", Admission::Normal);
        breaker.record_success("a", Admission::Normal);

        let lanes: Vec<_> = breaker.all_snapshots().into_iter().map(|s| s.lane).collect();
        assert_eq!(lanes, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_failures() {
        use std::thread;

        let breaker = Arc::new(breaker(1000));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || {
                    for _ in 0..50 {
                        breaker.record_failure("x", FailureKind::ServerError, Admission::Normal);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = breaker.snapshot("x").unwrap();
        assert_eq!(snapshot.total_failures, 500);
        assert_eq!(snapshot.consecutive_failures, 500);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }
}
