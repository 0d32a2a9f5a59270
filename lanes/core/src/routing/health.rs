//! Lane Health Monitoring
//!
//! One periodic probe task per explicitly configured lane. Each cycle issues a
//! bounded `GET <endpoint>/health` and updates the lane's cached health:
//!
//! ```text
//! +---------+   1 failure   +----------+   N failures   +-------------+
//! | Healthy | ------------> | Degraded | -------------> | Unavailable |
//! +---------+               +----------+                +-------------+
//!      ^                         |                             |
//!      +------- any success -----+-----------------------------+
//! ```
//!
//! Lanes resolved only through fallback are not probed; their effective
//! target is. Status transitions are forwarded to the [`CircuitBreaker`] as
//! an input signal. The breaker owns the routing decision.
//!
//! # Thread Safety
//!
//! Status and counters are atomics; `last_checked_at` sits behind a
//! `parking_lot::Mutex`. Each lane has a single writer (its probe task).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::breaker::CircuitBreaker;
use super::events::{EventBus, RoutingEvent};
use super::registry::Registry;

// ============================================================================
// Health Status
// ============================================================================

/// Probed health of a lane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Last probe succeeded
    #[default]
    Healthy,

    /// Recent probes failed, below the unavailable threshold
    Degraded,

    /// Consecutive failures reached the threshold
    Unavailable,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Degraded,
            2 => Self::Unavailable,
            _ => Self::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unavailable => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        })
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for health probing
#[derive(Clone, Debug)]
pub struct HealthConfig {
    /// Time between probes of the same lane
    pub probe_interval: Duration,

    /// Upper bound on a single probe
    pub probe_timeout: Duration,

    /// Consecutive failures before a lane is marked unavailable
    pub unavailable_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(5),
            unavailable_threshold: 3,
        }
    }
}

// ============================================================================
// Probe Interface
// ============================================================================

/// Why a probe failed
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum ProbeFailure {
    /// Non-2xx response
    #[error("health endpoint returned HTTP {0}")]
    Status(u16),

    /// No response within the probe timeout
    #[error("health probe timed out")]
    Timeout,

    /// Connection-level error
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Result of one health probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeResult {
    /// Backend is ready to serve
    Ok,
    /// Backend is not ready
    Failed(ProbeFailure),
}

/// Checks whether a backend endpoint is ready
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `endpoint` (the lane's root URL)
    async fn probe(&self, endpoint: &str) -> ProbeResult;
}

/// Probes `GET <endpoint>/health` over HTTP; any 2xx is healthy
#[derive(Clone, Debug)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Create a probe whose requests are bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Health URL for an endpoint root
    #[must_use]
    pub fn health_url(endpoint: &str) -> String {
        format!("{}/health", endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        let result = self
            .client
            .get(Self::health_url(endpoint))
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => ProbeResult::Ok,
            Ok(response) => ProbeResult::Failed(ProbeFailure::Status(response.status().as_u16())),
            Err(e) if e.is_timeout() => ProbeResult::Failed(ProbeFailure::Timeout),
            Err(e) => ProbeResult::Failed(ProbeFailure::Connect(e.to_string())),
        }
    }
}

// ============================================================================
// Lane Health
// ============================================================================

/// Cached health of one explicitly configured lane
pub struct LaneHealth {
    /// Lane name
    pub lane: String,

    /// Endpoint being probed
    pub endpoint: String,

    /// 0 = Healthy, 1 = Degraded, 2 = Unavailable
    status: AtomicU8,

    consecutive_failures: AtomicU32,
    total_probes: AtomicU64,
    cancelled_probes: AtomicU64,
    last_checked_at: Mutex<Option<Instant>>,
    last_failure: Mutex<Option<ProbeFailure>>,
}

type StatusChange = Option<(HealthStatus, HealthStatus)>;

impl LaneHealth {
    fn new(lane: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            lane: lane.into(),
            endpoint: endpoint.into(),
            status: AtomicU8::new(HealthStatus::Healthy.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            total_probes: AtomicU64::new(0),
            cancelled_probes: AtomicU64::new(0),
            last_checked_at: Mutex::new(None),
            last_failure: Mutex::new(None),
        }
    }

    /// Current status
    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Consecutive failed probes
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn set_status(&self, to: HealthStatus) -> StatusChange {
        let from = HealthStatus::from_u8(self.status.swap(to.as_u8(), Ordering::AcqRel));
        (from != to).then_some((from, to))
    }

    fn touch(&self) {
        self.total_probes.fetch_add(1, Ordering::Relaxed);
        *self.last_checked_at.lock() = Some(Instant::now());
    }

    fn record_success(&self) -> StatusChange {
        self.touch();
        self.consecutive_failures.store(0, Ordering::Release);
        *self.last_failure.lock() = None;
        self.set_status(HealthStatus::Healthy)
    }

    fn record_failure(&self, failure: Option<ProbeFailure>, threshold: u32) -> StatusChange {
        self.touch();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(failure) = failure {
            *self.last_failure.lock() = Some(failure);
        } else {
            self.cancelled_probes.fetch_add(1, Ordering::Relaxed);
        }

        let to = if failures >= threshold {
            HealthStatus::Unavailable
        } else {
            HealthStatus::Degraded
        };
        self.set_status(to)
    }

    /// Snapshot of the current state
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            lane: self.lane.clone(),
            endpoint: self.endpoint.clone(),
            status: self.status(),
            consecutive_failures: self.consecutive_failures(),
            total_probes: self.total_probes.load(Ordering::Relaxed),
            cancelled_probes: self.cancelled_probes.load(Ordering::Relaxed),
            since_last_check: self.last_checked_at.lock().map(|at| at.elapsed()),
            last_failure: self.last_failure.lock().clone(),
        }
    }
}

impl fmt::Debug for LaneHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneHealth")
            .field("lane", &self.lane)
            .field("status", &self.status())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

/// Immutable snapshot of a lane's health
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// Lane name
    pub lane: String,
    /// Endpoint probed
    pub endpoint: String,
    /// Current status
    pub status: HealthStatus,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Probes completed or cancelled
    pub total_probes: u64,
    /// Probes cancelled by shutdown
    pub cancelled_probes: u64,
    /// Time since the last probe finished
    pub since_last_check: Option<Duration>,
    /// Most recent failure, cleared on success
    pub last_failure: Option<ProbeFailure>,
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Probes every explicitly configured lane
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<Registry>,
    probe: Arc<dyn HealthProbe>,
    lanes: BTreeMap<String, Arc<LaneHealth>>,
    breaker: Option<Arc<CircuitBreaker>>,
    events: Option<EventBus>,
}

impl HealthMonitor {
    /// Create a monitor for the explicit lanes of `registry`
    pub fn new(config: HealthConfig, registry: Arc<Registry>, probe: Arc<dyn HealthProbe>) -> Self {
        let lanes = registry
            .explicit_lanes()
            .filter_map(|lane| {
                let endpoint = lane.config.endpoint.as_deref()?;
                Some((
                    lane.name.clone(),
                    Arc::new(LaneHealth::new(lane.name.clone(), endpoint)),
                ))
            })
            .collect();

        Self {
            config,
            registry,
            probe,
            lanes,
            breaker: None,
            events: None,
        }
    }

    /// The registry whose lanes are probed
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Forward status transitions to `breaker`
    #[must_use]
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Publish status transitions on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Names of the probed lanes
    pub fn probed_lanes(&self) -> impl Iterator<Item = &str> {
        self.lanes.keys().map(String::as_str)
    }

    /// Current status of `lane`; `None` for lanes that are not probed
    #[must_use]
    pub fn status(&self, lane: &str) -> Option<HealthStatus> {
        self.lanes.get(lane).map(|h| h.status())
    }

    /// Snapshot of one lane
    #[must_use]
    pub fn snapshot(&self, lane: &str) -> Option<HealthSnapshot> {
        self.lanes.get(lane).map(|h| h.snapshot())
    }

    /// Snapshots of every probed lane, in name order
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<HealthSnapshot> {
        self.lanes.values().map(|h| h.snapshot()).collect()
    }

    /// Run one bounded probe cycle for `lane`
    ///
    /// Returns the status after the probe, or `None` if the lane is not probed.
    pub async fn probe_lane(&self, lane: &str) -> Option<HealthStatus> {
        let health = self.lanes.get(lane)?;

        let result =
            match tokio::time::timeout(self.config.probe_timeout, self.probe.probe(&health.endpoint))
                .await
            {
                Ok(result) => result,
                Err(_) => ProbeResult::Failed(ProbeFailure::Timeout),
            };

        let change = match result {
            ProbeResult::Ok => {
                tracing::debug!(lane = %lane, endpoint = %health.endpoint, "Health probe succeeded");
                health.record_success()
            }
            ProbeResult::Failed(failure) => {
                let change =
                    health.record_failure(Some(failure.clone()), self.config.unavailable_threshold);
                tracing::warn!(
                    lane = %lane,
                    endpoint = %health.endpoint,
                    error = %failure,
                    consecutive_failures = health.consecutive_failures(),
                    "Health probe failed"
                );
                change
            }
        };

        self.publish(lane, change);
        Some(health.status())
    }

    /// Book a probe that was interrupted by shutdown as a failure
    fn record_cancelled(&self, lane: &str) {
        let Some(health) = self.lanes.get(lane) else {
            return;
        };
        let change = health.record_failure(None, self.config.unavailable_threshold);
        tracing::info!(
            lane = %lane,
            consecutive_failures = health.consecutive_failures(),
            "Health probe cancelled"
        );
        self.publish(lane, change);
    }

    fn publish(&self, lane: &str, change: StatusChange) {
        let Some((from, to)) = change else {
            return;
        };

        if to == HealthStatus::Healthy {
            tracing::info!(lane = %lane, from = %from, "Lane healthy again");
        } else {
            tracing::warn!(lane = %lane, from = %from, to = %to, "Lane health degraded");
        }

        if let Some(breaker) = &self.breaker {
            breaker.observe_health(lane, to);
        }
        if let Some(events) = &self.events {
            events.publish(RoutingEvent::HealthChanged {
                lane: lane.to_string(),
                from,
                to,
            });
        }
    }

    /// Start one probe task per lane
    ///
    /// The first probe runs immediately, then every `probe_interval`.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> HealthMonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = self
            .lanes
            .keys()
            .map(|lane| {
                let monitor = Arc::clone(self);
                let lane = lane.clone();
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    monitor.run_lane(&lane, &mut shutdown).await;
                })
            })
            .collect();

        tracing::info!(
            lanes = self.lanes.len(),
            interval_ms = u64::try_from(self.config.probe_interval.as_millis()).unwrap_or(u64::MAX),
            "Health monitor started"
        );

        HealthMonitorHandle { shutdown_tx, tasks }
    }

    async fn run_lane(&self, lane: &str, shutdown: &mut watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.record_cancelled(lane);
                    break;
                }
                _ = self.probe_lane(lane) => {}
            }
        }

        tracing::debug!(lane = %lane, "Health probe task stopped");
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("lanes", &self.lanes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Handle to the running probe tasks
#[derive(Debug)]
pub struct HealthMonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitorHandle {
    /// Number of probe tasks
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every probe task and wait for them to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Health probe task panicked");
            }
        }
        tracing::info!("Health monitor stopped");
    }
}
