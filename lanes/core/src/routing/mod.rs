#![allow(missing_docs)]
//! Lane Routing
//!
//! Maps logical lanes (orchestrator, coder, deep, ...) to concrete inference
//! backends and keeps traffic away from backends that are failing or
//! temporarily reallocated.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |  RequestRouter   |  <-- Entry point for every request
//! +--------+---------+
//!          |
//!          v
//! +------------------+        +------------------+
//! |   LaneResolver   | -----> |     Registry     |  <-- Immutable lanes + fallback DAG
//! +--------+---------+        +------------------+
//!          |
//!          v
//! +------------------+        +------------------+
//! |  CircuitBreaker  | <----- |  HealthMonitor   |  <-- One probe task per explicit lane
//! +--------+---------+        +------------------+
//!          |
//!          v
//! +------------------+        +------------------+
//! |  BackendGroups   | <----- | BurstCoordinator |  <-- Pauses a backend kind on demand
//! +------------------+        +------------------+
//! ```
//!
//! Every component publishes [`RoutingEvent`]s on a shared [`EventBus`].

pub mod breaker;
pub mod burst;
pub mod events;
pub mod groups;
pub mod health;
pub mod lane;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod router;

#[cfg(test)]
pub mod test_utils;

pub use breaker::{
    Admission, BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState,
    FailureKind, TransitionReason,
};
pub use burst::{BurstConfig, BurstCoordinator, BurstError, BurstSession, BurstStatus, DrainOutcome};
pub use events::{EventBus, RoutingEvent};
pub use groups::{BackendGroups, GateSnapshot};
pub use health::{
    HealthConfig, HealthMonitor, HealthMonitorHandle, HealthProbe, HealthSnapshot, HealthStatus,
    HttpHealthProbe, ProbeFailure, ProbeResult,
};
pub use lane::{BackendKind, Lane, LaneConfig, PerKind};
pub use metrics::{MetricsSnapshot, RouterMetrics};
pub use registry::Registry;
pub use resolver::{LaneResolver, ResolveError, ResolvedTarget};
pub use router::{
    OutcomeLease, RequestMeta, RequestRouter, RouterConfig, RouterError, RoutingDecision,
};
