//! Shared fixtures for routing unit tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::health::{HealthProbe, ProbeFailure, ProbeResult};
use super::lane::{BackendKind, Lane, LaneConfig, PerKind};
use super::registry::Registry;

/// Registry with one lane per role:
///
/// - `orchestrator`: fast-gpu, `http://orchestrator:8000`, 16 GB, default
/// - `coder`: falls back to `orchestrator`
/// - `deep`: long-context, `http://deep:9000`, 40 GB, falls back to `orchestrator`
pub fn fixture_registry() -> Arc<Registry> {
    let lanes = vec![
        Lane::explicit(
            "orchestrator",
            LaneConfig::explicit("http://orchestrator:8000", "qwen-14b").with_memory_budget_mb(16_000),
        )
        .with_intents(["chat"]),
        Lane::fallback_to("coder", "orchestrator").with_intents(["code"]),
        Lane::explicit(
            "deep",
            LaneConfig::explicit("http://deep:9000", "long-128k")
                .with_kind(BackendKind::LongContext)
                .with_memory_budget_mb(40_000),
        )
        .with_fallback("orchestrator"),
    ];
    let capacity = PerKind {
        fast_gpu: Some(24_000),
        long_context: Some(48_000),
    };
    Arc::new(Registry::from_lanes(lanes, capacity).expect("fixture registry is valid"))
}

/// Health probe driven by a per-endpoint script
///
/// Endpoints answer healthy unless failures were queued with
/// [`ScriptedProbe::fail_next`] or the endpoint was told to [`ScriptedProbe::hang`].
#[derive(Default)]
pub struct ScriptedProbe {
    queued: Mutex<HashMap<String, VecDeque<ProbeFailure>>>,
    hanging: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, endpoint: &str, failure: ProbeFailure, times: usize) {
        let mut queued = self.queued.lock();
        let queue = queued.entry(endpoint.to_string()).or_default();
        queue.extend(std::iter::repeat(failure).take(times));
    }

    pub fn hang(&self, endpoint: &str) {
        self.hanging.lock().insert(endpoint.to_string());
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls.lock().get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, endpoint: &str) -> ProbeResult {
        *self.calls.lock().entry(endpoint.to_string()).or_default() += 1;

        let hang = self.hanging.lock().contains(endpoint);
        if hang {
            std::future::pending::<()>().await;
        }

        let next = self
            .queued
            .lock()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        match next {
            Some(failure) => ProbeResult::Failed(failure),
            None => ProbeResult::Ok,
        }
    }
}
