//! Lane Router Core - Lane-Based Routing for Local Inference Backends
//!
//! Routes requests addressed to logical lanes onto a small set of inference
//! backends, following each lane's fallback chain until it reaches an
//! explicitly configured backend.
//!
//! # Architecture
//!
//! ```text
//!        caller
//!          │ route("coder", meta)
//!          v
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      RequestRouter                           │
//! │  resolve ──> breaker ──> burst gate ──> RoutingDecision       │
//! └──────┬──────────────────────┬─────────────────────┬──────────┘
//!        │                      │                     │
//! ┌──────┴──────┐   ┌───────────┴──────────┐   ┌──────┴───────────┐
//! │  Registry   │   │   CircuitBreaker     │   │  BackendGroups   │
//! │ (fallbacks) │   │ ^ HealthMonitor      │   │ ^ BurstCoordinator│
//! └─────────────┘   └──────────────────────┘   └──────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Registry`]: Validated, immutable lane set with its fallback DAG
//! - [`RequestRouter`]: Turns a lane name into a [`RoutingDecision`]
//! - [`CircuitBreaker`]: Per-lane Closed / Open / Half-Open state
//! - [`HealthMonitor`]: Periodic `/health` probes, one task per backend
//! - [`BurstCoordinator`]: Temporarily pauses one backend kind
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lane_router_core::{
//!     load_config, BackendGroups, CircuitBreaker, LaneResolver, RequestMeta, RequestRouter,
//! };
//!
//! let config = load_config()?;
//! let registry = Arc::new(config.build_registry()?);
//! let router = RequestRouter::new(
//!     LaneResolver::new(Arc::clone(&registry)),
//!     Arc::new(CircuitBreaker::new(config.breaker.clone())),
//!     Arc::new(BackendGroups::new()),
//!     config.router.clone(),
//! );
//!
//! let decision = router.route("coder", RequestMeta::new()).await?;
//! // forward to decision.target.endpoint / decision.target.model_name ...
//! decision.lease.report_success();
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod routing;

// Routing exports
pub use routing::{
    BackendGroups, BackendKind, BreakerConfig, BurstConfig, BurstCoordinator, BurstError,
    BurstSession, BurstStatus, CircuitBreaker, CircuitOpenError, CircuitState, DrainOutcome,
    EventBus, FailureKind, HealthConfig, HealthMonitor, HealthProbe, HealthStatus,
    HttpHealthProbe, Lane, LaneConfig, LaneResolver, OutcomeLease, PerKind, Registry,
    RequestMeta, RequestRouter, ResolveError, ResolvedTarget, RouterConfig, RouterError,
    RoutingDecision, RoutingEvent,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, parse_config_str, ConfigError,
    ConfigOverrides, ConfigSource, LaneRouterConfig, LaneRouterToml,
};
