//! Lane Data Model
//!
//! Static description of routing lanes: which backend kind serves them, which
//! endpoint and model they are bound to, and where they fall back to when they
//! carry no explicit configuration.

use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

// ============================================================================
// Backend Kind
// ============================================================================

/// The runtime family a lane is served by
///
/// Lanes of the same kind share one host memory budget, and burst mode pauses
/// a whole kind at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// High-throughput GPU server for short-context work
    FastGpu,
    /// Long-context server for deep-document analysis
    LongContext,
}

impl BackendKind {
    /// Every backend kind, in a stable order
    pub const ALL: [BackendKind; 2] = [BackendKind::FastGpu, BackendKind::LongContext];

    /// Configuration name of this kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastGpu => "fast-gpu",
            Self::LongContext => "long-context",
        }
    }

    /// The other backend kind (the group that borrows memory during a burst)
    #[must_use]
    pub fn peer(&self) -> BackendKind {
        match self {
            Self::FastGpu => Self::LongContext,
            Self::LongContext => Self::FastGpu,
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::FastGpu
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Per-Kind Storage
// ============================================================================

/// One value per backend kind, indexed by [`BackendKind`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerKind<T> {
    /// Value for [`BackendKind::FastGpu`]
    pub fast_gpu: T,
    /// Value for [`BackendKind::LongContext`]
    pub long_context: T,
}

impl<T> PerKind<T> {
    /// Build by calling `f` once per kind
    pub fn from_fn(mut f: impl FnMut(BackendKind) -> T) -> Self {
        Self {
            fast_gpu: f(BackendKind::FastGpu),
            long_context: f(BackendKind::LongContext),
        }
    }

    /// Iterate `(kind, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (BackendKind, &T)> {
        [
            (BackendKind::FastGpu, &self.fast_gpu),
            (BackendKind::LongContext, &self.long_context),
        ]
        .into_iter()
    }
}

impl<T> Index<BackendKind> for PerKind<T> {
    type Output = T;

    fn index(&self, kind: BackendKind) -> &T {
        match kind {
            BackendKind::FastGpu => &self.fast_gpu,
            BackendKind::LongContext => &self.long_context,
        }
    }
}

impl<T> IndexMut<BackendKind> for PerKind<T> {
    fn index_mut(&mut self, kind: BackendKind) -> &mut T {
        match kind {
            BackendKind::FastGpu => &mut self.fast_gpu,
            BackendKind::LongContext => &mut self.long_context,
        }
    }
}

// ============================================================================
// Lane Configuration
// ============================================================================

/// Backend binding of a lane
///
/// All fields are optional: a lane without endpoint and model is served by its
/// fallback chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Root URL of the backend (e.g. `http://10.0.0.4:8000`)
    pub endpoint: Option<String>,
    /// Model identifier as the backend knows it
    pub model_name: Option<String>,
    /// Runtime family; explicit lanes without one are `fast-gpu`
    pub backend_kind: Option<BackendKind>,
    /// Share of the backend host memory this lane keeps resident
    pub memory_budget_mb: Option<u64>,
}

impl LaneConfig {
    /// Create an explicit configuration
    pub fn explicit(endpoint: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            model_name: Some(model_name.into()),
            ..Default::default()
        }
    }

    /// Set the backend kind
    #[must_use]
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.backend_kind = Some(kind);
        self
    }

    /// Set the memory budget
    #[must_use]
    pub fn with_memory_budget_mb(mut self, mb: u64) -> Self {
        self.memory_budget_mb = Some(mb);
        self
    }

    /// Whether both endpoint and model name are present and non-blank
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        non_blank(self.endpoint.as_deref()) && non_blank(self.model_name.as_deref())
    }

    /// Effective backend kind
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.backend_kind.unwrap_or_default()
    }
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

// ============================================================================
// Lane
// ============================================================================

/// A named routing target
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lane {
    /// Lane identity
    pub name: String,
    /// Intent tags this lane is meant for (informational)
    pub intents: Vec<String>,
    /// Lane to use when this one has no explicit config; `None` marks the default lane
    pub fallback: Option<String>,
    /// Backend binding
    pub config: LaneConfig,
}

impl Lane {
    /// Create a lane with explicit configuration and no fallback
    pub fn explicit(name: impl Into<String>, config: LaneConfig) -> Self {
        Self {
            name: name.into(),
            intents: Vec::new(),
            fallback: None,
            config,
        }
    }

    /// Create an unconfigured lane that falls back to `target`
    pub fn fallback_to(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            intents: Vec::new(),
            fallback: Some(target.into()),
            config: LaneConfig::default(),
        }
    }

    /// Set the fallback lane
    #[must_use]
    pub fn with_fallback(mut self, target: impl Into<String>) -> Self {
        self.fallback = Some(target.into());
        self
    }

    /// Set the intent tags
    #[must_use]
    pub fn with_intents<I, S>(mut self, intents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intents = intents.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this lane is the terminal/default lane
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.fallback.is_none()
    }

    /// Whether this lane carries an explicit backend binding
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        self.config.is_explicit()
    }
}
