//! Lane Registry
//!
//! The validated, immutable lane table. Built once at startup and shared as
//! `Arc<Registry>` with the resolver, health monitor, burst coordinator and
//! router.
//!
//! # Validation
//!
//! ```text
//! lanes ──> non-empty ──> fallback targets exist ──> no cycles
//!                                                       │
//!                 capacity per kind <── one default <───┘
//! ```
//!
//! Every violation is a [`ConfigError`]; the process must not start with an
//! invalid registry.

use std::collections::{BTreeMap, HashSet};

use crate::config::{CapacityToml, ConfigError, LaneToml};

use super::lane::{BackendKind, Lane, PerKind};

// ============================================================================
// Registry
// ============================================================================

/// Validated lane table
#[derive(Clone, Debug)]
pub struct Registry {
    /// Lanes keyed by name (deterministic order)
    lanes: BTreeMap<String, Lane>,

    /// Name of the single lane without a fallback
    default_lane: String,

    /// Declared host capacity per kind
    host_capacity_mb: PerKind<Option<u64>>,

    /// Sum of explicit lane budgets per kind
    memory_budget_mb: PerKind<u64>,
}

impl Registry {
    /// Build a registry from the `[lanes]` and `[capacity]` TOML sections
    ///
    /// # Errors
    ///
    /// See [`Registry::from_lanes`].
    pub fn load(
        lanes: &BTreeMap<String, LaneToml>,
        capacity: &CapacityToml,
    ) -> Result<Self, ConfigError> {
        let lanes = lanes
            .iter()
            .map(|(name, lane)| lane.to_lane(name))
            .collect();
        Self::from_lanes(lanes, capacity.to_per_kind())
    }

    /// Validate `lanes` and build the registry
    ///
    /// # Errors
    ///
    /// Checks run in this order and the first violation is returned:
    /// [`ConfigError::NoLanes`], duplicate names
    /// ([`ConfigError::ValidationError`]), [`ConfigError::DanglingFallback`]
    /// (a self-fallback is a [`ConfigError::FallbackCycle`] of one lane),
    /// [`ConfigError::FallbackCycle`], [`ConfigError::MissingDefault`] /
    /// [`ConfigError::MultipleDefaults`], [`ConfigError::CapacityExceeded`].
    pub fn from_lanes(
        lanes: Vec<Lane>,
        host_capacity_mb: PerKind<Option<u64>>,
    ) -> Result<Self, ConfigError> {
        if lanes.is_empty() {
            return Err(ConfigError::NoLanes);
        }

        let mut table = BTreeMap::new();
        for lane in lanes {
            if table.contains_key(&lane.name) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate lane '{}'",
                    lane.name
                )));
            }
            table.insert(lane.name.clone(), lane);
        }

        check_fallback_targets(&table)?;
        check_cycles(&table)?;
        let default_lane = find_default(&table)?;

        let memory_budget_mb = PerKind::from_fn(|kind| {
            table
                .values()
                .filter(|lane| lane.is_explicit() && lane.config.kind() == kind)
                .filter_map(|lane| lane.config.memory_budget_mb)
                .sum()
        });

        for (kind, capacity) in host_capacity_mb.iter() {
            if let Some(capacity_mb) = *capacity {
                let requested_mb = memory_budget_mb[kind];
                if requested_mb > capacity_mb {
                    return Err(ConfigError::CapacityExceeded {
                        kind,
                        requested_mb,
                        capacity_mb,
                    });
                }
            }
        }

        tracing::info!(
            lanes = table.len(),
            default_lane = %default_lane,
            explicit = table.values().filter(|l| l.is_explicit()).count(),
            "Lane registry loaded"
        );

        Ok(Self {
            lanes: table,
            default_lane,
            host_capacity_mb,
            memory_budget_mb,
        })
    }

    /// Look up a lane by name
    #[must_use]
    pub fn lane(&self, name: &str) -> Option<&Lane> {
        self.lanes.get(name)
    }

    /// All lanes in name order
    pub fn lanes(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.values()
    }

    /// The terminal lane every fallback chain ends at
    #[must_use]
    pub fn default_lane(&self) -> &Lane {
        // Present by construction
        &self.lanes[&self.default_lane]
    }

    /// Lanes carrying an explicit backend binding
    pub fn explicit_lanes(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.values().filter(|lane| lane.is_explicit())
    }

    /// Explicit lanes served by `kind`
    pub fn lanes_of_kind(&self, kind: BackendKind) -> impl Iterator<Item = &Lane> {
        self.explicit_lanes()
            .filter(move |lane| lane.config.kind() == kind)
    }

    /// Sum of the memory budgets of the explicit lanes of `kind`
    #[must_use]
    pub fn memory_budget_mb(&self, kind: BackendKind) -> u64 {
        self.memory_budget_mb[kind]
    }

    /// Declared host capacity of `kind`, if any
    #[must_use]
    pub fn host_capacity_mb(&self, kind: BackendKind) -> Option<u64> {
        self.host_capacity_mb[kind]
    }

    /// Number of lanes
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    /// Always false for a built registry
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }
}

// ============================================================================
// Validation Helpers
// ============================================================================

fn check_fallback_targets(lanes: &BTreeMap<String, Lane>) -> Result<(), ConfigError> {
    for lane in lanes.values() {
        let Some(target) = lane.fallback.as_deref() else {
            continue;
        };
        if target == lane.name {
            return Err(ConfigError::FallbackCycle {
                lanes: vec![lane.name.clone()],
            });
        }
        if !lanes.contains_key(target) {
            return Err(ConfigError::DanglingFallback {
                lane: lane.name.clone(),
                target: target.to_string(),
            });
        }
    }
    Ok(())
}

/// DFS over the fallback relation with a per-traversal path set
///
/// Each lane has at most one outgoing edge, so the traversal from a lane is a
/// single walk. Lanes already proven acyclic are skipped.
fn check_cycles(lanes: &BTreeMap<String, Lane>) -> Result<(), ConfigError> {
    let mut finished: HashSet<&str> = HashSet::new();

    for start in lanes.keys() {
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut current = Some(start.as_str());

        while let Some(name) = current {
            if finished.contains(name) {
                break;
            }
            if !on_path.insert(name) {
                let pos = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[pos..].iter().map(|n| (*n).to_string()).collect();
                let smallest = cycle
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1.cmp(b.1))
                    .map_or(0, |(i, _)| i);
                cycle.rotate_left(smallest);
                return Err(ConfigError::FallbackCycle { lanes: cycle });
            }
            path.push(name);
            current = lanes.get(name).and_then(|lane| lane.fallback.as_deref());
        }

        finished.extend(path);
    }

    Ok(())
}

fn find_default(lanes: &BTreeMap<String, Lane>) -> Result<String, ConfigError> {
    let defaults: Vec<String> = lanes
        .values()
        .filter(|lane| lane.is_default())
        .map(|lane| lane.name.clone())
        .collect();

    match defaults.len() {
        0 => Err(ConfigError::MissingDefault),
        1 => Ok(defaults.into_iter().next().unwrap_or_default()),
        _ => Err(ConfigError::MultipleDefaults { lanes: defaults }),
    }
}
