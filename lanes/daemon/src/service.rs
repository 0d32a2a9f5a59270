//! Lane Router Service
//!
//! Owns every routing component for the lifetime of the daemon and wires
//! them to one shared registry and event bus.
//!
//! The daemon itself only supervises health and logs events. The
//! [`RequestRouter`] and [`BurstCoordinator`] are hosted here for an
//! embedding caller that drives `route`, `begin_burst` and `end_burst`;
//! the daemon touches them at shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lane_router_core::{
    BackendGroups, BackendKind, BurstCoordinator, CircuitBreaker, EventBus, HealthMonitor,
    HealthProbe, HttpHealthProbe, LaneResolver, LaneRouterConfig, Registry, RequestRouter,
    ResolvedTarget,
};

/// One line of the resolution table printed by `--check`
#[derive(Debug, Serialize)]
pub struct ResolutionRow {
    pub lane: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ResolvedTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl std::fmt::Display for ResolutionRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.target, &self.error) {
            (Some(target), _) => write!(
                f,
                "{:<16} {} => {} ({}) [{}]",
                self.lane,
                target.resolved_via.join(" -> "),
                target.endpoint,
                target.model_name,
                target.backend_kind
            ),
            (None, Some(error)) => write!(f, "{:<16} ERROR: {error}", self.lane),
            (None, None) => write!(f, "{:<16} ?", self.lane),
        }
    }
}

/// Resolve every lane of `registry`
#[must_use]
pub fn resolution_rows(registry: Arc<Registry>) -> Vec<ResolutionRow> {
    LaneResolver::new(registry)
        .resolution_table()
        .into_iter()
        .map(|(lane, result)| match result {
            Ok(target) => ResolutionRow {
                lane,
                target: Some(target),
                error: None,
            },
            Err(e) => ResolutionRow {
                lane,
                target: None,
                error: Some(e.to_string()),
            },
        })
        .collect()
}

/// Running lane router
pub struct LaneRouterService {
    registry: Arc<Registry>,
    events: EventBus,
    breaker: Arc<CircuitBreaker>,
    router: Arc<RequestRouter>,
    burst: Arc<BurstCoordinator>,
    monitor: Arc<HealthMonitor>,
}

impl LaneRouterService {
    /// Build the service with HTTP health probes
    pub fn new(config: &LaneRouterConfig) -> Result<Self> {
        let probe = HttpHealthProbe::new(config.health.probe_timeout)
            .context("Failed to build health probe HTTP client")?;
        Self::with_probe(config, Arc::new(probe))
    }

    /// Build the service around an existing probe implementation
    pub fn with_probe(config: &LaneRouterConfig, probe: Arc<dyn HealthProbe>) -> Result<Self> {
        let registry = Arc::new(
            config
                .build_registry()
                .context("Invalid lane configuration")?,
        );
        let events = EventBus::default();

        let breaker =
            Arc::new(CircuitBreaker::new(config.breaker.clone()).with_events(events.clone()));
        let groups = Arc::new(BackendGroups::new());
        let resolver = LaneResolver::new(Arc::clone(&registry)).with_events(events.clone());
        let router = Arc::new(
            RequestRouter::new(
                resolver,
                Arc::clone(&breaker),
                Arc::clone(&groups),
                config.router.clone(),
            )
            .with_events(events.clone()),
        );
        let burst = Arc::new(
            BurstCoordinator::new(config.burst.clone(), Arc::clone(&registry), groups)
                .with_events(events.clone()),
        );
        let monitor = Arc::new(
            HealthMonitor::new(config.health.clone(), Arc::clone(&registry), probe)
                .with_breaker(Arc::clone(&breaker))
                .with_events(events.clone()),
        );

        Ok(Self {
            registry,
            events,
            breaker,
            router,
            burst,
            monitor,
        })
    }

    #[cfg(test)]
    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[cfg(test)]
    fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Log what is about to be served
    pub fn log_summary(&self) {
        let default_lane = &self.registry.default_lane().name;
        info!(
            lanes = self.registry.len(),
            explicit = self.registry.explicit_lanes().count(),
            default_lane = %default_lane,
            "Lane registry ready"
        );
        for row in resolution_rows(Arc::clone(&self.registry)) {
            match (&row.target, &row.error) {
                (Some(target), _) => info!(
                    lane = %row.lane,
                    via = %target.resolved_via.join(" -> "),
                    endpoint = %target.endpoint,
                    model = %target.model_name,
                    kind = %target.backend_kind,
                    "Lane resolves"
                ),
                (None, error) => warn!(
                    lane = %row.lane,
                    error = error.as_deref().unwrap_or("unknown"),
                    "Lane does not resolve"
                ),
            }
        }
        for kind in BackendKind::ALL {
            info!(
                kind = %kind,
                budget_mb = self.registry.memory_budget_mb(kind),
                capacity_mb = ?self.registry.host_capacity_mb(kind),
                "Backend group"
            );
        }
    }

    /// Run until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let health = self.monitor.spawn();
        info!(tasks = health.task_count(), "Health monitor started");

        let forwarder = self.spawn_event_forwarder();

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Shutting down lane router");
        self.router.shutdown();
        for kind in BackendKind::ALL {
            if let Some(session) = self.burst.active_session(kind) {
                match self.burst.cancel_burst(session.id) {
                    Ok(closed) => info!(session_id = %closed.id, kind = %kind, "Burst closed at shutdown"),
                    Err(e) => warn!(session_id = %session.id, error = %e, "Failed to close burst at shutdown"),
                }
            }
        }
        health.shutdown().await;

        let metrics = self.router.metrics().snapshot();
        info!(
            routed = metrics.routed,
            fallback_resolved = metrics.fallback_resolved,
            circuit_open_rejections = metrics.circuit_open_rejections,
            paused_rejections = metrics.paused_rejections,
            queue_timeouts = metrics.queue_timeouts,
            "Final routing metrics"
        );
        for snapshot in self.breaker.all_snapshots() {
            debug!(lane = %snapshot.lane, state = %snapshot.state, rejected = snapshot.rejected, "Breaker at shutdown");
        }

        forwarder.abort();
        Ok(())
    }

    fn spawn_event_forwarder(&self) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => info!(target: "lane_router::events", event = %json, "Routing event"),
                        Err(e) => warn!(error = %e, "Failed to encode routing event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lane_router_core::routing::health::ProbeResult;
    use lane_router_core::{parse_config_str, RequestMeta};

    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _endpoint: &str) -> ProbeResult {
            ProbeResult::Ok
        }
    }

    const CONFIG: &str = r#"
[lanes.orchestrator]
endpoint = "http://127.0.0.1:8000"
model_name = "qwen"

[lanes.coder]
fallback = "orchestrator"
"#;

    fn service() -> LaneRouterService {
        let config = parse_config_str(CONFIG).unwrap();
        LaneRouterService::with_probe(&config, Arc::new(AlwaysUp)).unwrap()
    }

    #[test]
    fn test_resolution_rows() {
        let service = service();
        let rows = resolution_rows(Arc::clone(service.registry()));

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].lane, "coder");
        let target = rows[0].target.as_ref().unwrap();
        assert_eq!(target.lane_name, "orchestrator");
        assert!(rows[0].to_string().contains("coder -> orchestrator"));

        let json = serde_json::to_value(&rows[1]).unwrap();
        assert_eq!(json["target"]["endpoint"], "http://127.0.0.1:8000");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_invalid_lanes_fail_to_build() {
        let config = parse_config_str("[lanes.a]\nfallback = \"a\"\n").unwrap();
        let err = LaneRouterService::with_probe(&config, Arc::new(AlwaysUp))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("Fallback cycle"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let service = service();
        let (tx, rx) = watch::channel(false);

        let routed = service.router().route("coder", RequestMeta::new()).await.unwrap();
        routed.lease.report_success();

        tx.send(true).unwrap();
        service.run(rx).await.unwrap();

        assert!(service.router().is_shutting_down());
        assert!(service.router().route("coder", RequestMeta::new()).await.is_err());
    }
}
