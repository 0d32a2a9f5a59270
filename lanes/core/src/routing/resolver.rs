//! Lane Resolution
//!
//! Turns a requested lane name into a concrete backend target by walking the
//! fallback graph until a lane with explicit configuration is found.
//!
//! ```text
//! resolve("reviewer")
//!   reviewer (no config) ──> coder (no config) ──> orchestrator (explicit)
//!   => ResolvedTarget { lane_name: "orchestrator",
//!                       resolved_via: [reviewer, coder, orchestrator], .. }
//! ```
//!
//! Fallback traversal is the expected resolution path, not an error. The only
//! misconfiguration surfaced to callers is a chain that ends without an
//! explicit lane ([`ResolveError::Unconfigured`]).

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::events::{EventBus, RoutingEvent};
use super::lane::BackendKind;
use super::registry::Registry;

// ============================================================================
// Resolved Target
// ============================================================================

/// Concrete forwarding target for a request
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedTarget {
    /// Lane actually serving the request
    pub lane_name: String,
    /// Backend root URL
    pub endpoint: String,
    /// Model identifier
    pub model_name: String,
    /// Backend kind of the serving lane
    pub backend_kind: BackendKind,
    /// Lanes traversed, from the requested lane to `lane_name`
    pub resolved_via: Vec<String>,
}

impl ResolvedTarget {
    /// Whether resolution followed at least one fallback
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.resolved_via.len() > 1
    }

    /// Lane the caller originally asked for
    #[must_use]
    pub fn requested_lane(&self) -> &str {
        self.resolved_via
            .first()
            .map_or(self.lane_name.as_str(), String::as_str)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Resolution failures
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The requested lane does not exist
    #[error("Unknown lane '{0}'")]
    UnknownLane(String),

    /// The fallback chain ended without an explicitly configured lane
    #[error("Lane '{requested}' is unconfigured: fallback chain {} has no endpoint/model", chain.join(" -> "))]
    Unconfigured {
        /// Lane the caller asked for
        requested: String,
        /// Every lane attempted
        chain: Vec<String>,
    },

    /// The fallback chain revisited a lane
    #[error("Fallback cycle while resolving: {}", chain.join(" -> "))]
    CycleDetected {
        /// Lanes visited, ending with the repeated lane
        chain: Vec<String>,
    },
}

// ============================================================================
// Resolver
// ============================================================================

/// Walks the fallback graph of a [`Registry`]
#[derive(Clone, Debug)]
pub struct LaneResolver {
    registry: Arc<Registry>,
    events: Option<EventBus>,
}

impl LaneResolver {
    /// Create a resolver over `registry`
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            events: None,
        }
    }

    /// Publish fallback traversals on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// The registry this resolver reads
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolve `lane_name` to a concrete target
    ///
    /// # Errors
    ///
    /// [`ResolveError::UnknownLane`] for names not in the registry,
    /// [`ResolveError::Unconfigured`] when the chain ends at the default lane
    /// without explicit config, [`ResolveError::CycleDetected`] if the chain
    /// revisits a lane.
    pub fn resolve(&self, lane_name: &str) -> Result<ResolvedTarget, ResolveError> {
        let mut lane = self
            .registry
            .lane(lane_name)
            .ok_or_else(|| ResolveError::UnknownLane(lane_name.to_string()))?;

        let mut chain = vec![lane.name.clone()];
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(lane.name.as_str());

        loop {
            if let (true, Some(endpoint), Some(model_name)) = (
                lane.is_explicit(),
                lane.config.endpoint.as_deref(),
                lane.config.model_name.as_deref(),
            ) {
                return Ok(ResolvedTarget {
                    lane_name: lane.name.clone(),
                    endpoint: endpoint.to_string(),
                    model_name: model_name.to_string(),
                    backend_kind: lane.config.kind(),
                    resolved_via: chain,
                });
            }

            let Some(next_name) = lane.fallback.as_deref() else {
                return Err(ResolveError::Unconfigured {
                    requested: lane_name.to_string(),
                    chain,
                });
            };

            // Registry validation guarantees the target exists
            let next = self.registry.lane(next_name).ok_or_else(|| ResolveError::Unconfigured {
                requested: lane_name.to_string(),
                chain: chain.clone(),
            })?;

            chain.push(next.name.clone());
            if !visited.insert(next.name.as_str()) {
                tracing::error!(lane = %lane_name, chain = ?chain, "Fallback cycle during resolution");
                return Err(ResolveError::CycleDetected { chain });
            }

            tracing::info!(
                requested = %lane_name,
                from = %lane.name,
                to = %next.name,
                "Lane has no explicit config, following fallback"
            );
            if let Some(events) = &self.events {
                events.publish(RoutingEvent::FallbackTraversed {
                    requested: lane_name.to_string(),
                    from: lane.name.clone(),
                    to: next.name.clone(),
                });
            }

            lane = next;
        }
    }

    /// Resolve every lane in name order
    #[must_use]
    pub fn resolution_table(&self) -> Vec<(String, Result<ResolvedTarget, ResolveError>)> {
        self.registry
            .lanes()
            .map(|lane| (lane.name.clone(), self.resolve(&lane.name)))
            .collect()
    }
}
