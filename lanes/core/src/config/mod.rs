//! TOML Configuration File Support
//!
//! Loads the lane table and the tuning knobs of the health monitor, circuit
//! breaker, burst queue and burst coordinator from a TOML file at
//! `~/.config/lane-router/lanes.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! Lanes themselves only come from the file. They are read once at startup;
//! changing them requires a restart.
//!
//! # Example Configuration
//!
//! ```toml
//! [lanes.orchestrator]
//! endpoint = "http://127.0.0.1:8000"
//! model_name = "qwen2.5-14b-instruct"
//! backend_kind = "fast-gpu"
//! memory_budget_mb = 16000
//!
//! [lanes.coder]
//! fallback = "orchestrator"
//! intents = ["code"]
//!
//! [capacity]
//! fast_gpu_mb = 24000
//! long_context_mb = 48000
//!
//! [health]
//! probe_interval_secs = 15
//! probe_timeout_ms = 5000
//! unavailable_threshold = 3
//!
//! [breaker]
//! failure_threshold = 5
//! cooldown_secs = 30
//!
//! [burst]
//! queue_depth = 50
//! queue_timeout_secs = 30
//! drain_grace_secs = 30
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::breaker::BreakerConfig;
use crate::routing::burst::BurstConfig;
use crate::routing::health::HealthConfig;
use crate::routing::lane::{BackendKind, Lane, LaneConfig, PerKind};
use crate::routing::registry::Registry;
use crate::routing::router::RouterConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration or building the lane registry
///
/// Every variant is fatal: the process must not start with an invalid registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// No lanes were configured at all
    #[error("No lanes configured")]
    NoLanes,

    /// No lane is free of a fallback, so there is no default lane
    #[error("No default lane: every lane declares a fallback")]
    MissingDefault,

    /// More than one lane has no fallback
    #[error("Multiple default lanes (exactly one lane may omit `fallback`): {}", lanes.join(", "))]
    MultipleDefaults {
        /// Lanes without a fallback
        lanes: Vec<String>,
    },

    /// The fallback relation contains a cycle
    #[error("Fallback cycle detected: {}", lanes.join(" -> "))]
    FallbackCycle {
        /// Every lane on the cycle, in traversal order
        lanes: Vec<String>,
    },

    /// A lane falls back to a lane that does not exist
    #[error("Lane '{lane}' falls back to unknown lane '{target}'")]
    DanglingFallback {
        /// Lane declaring the fallback
        lane: String,
        /// Missing fallback target
        target: String,
    },

    /// Lane memory budgets exceed the host capacity of their backend kind
    #[error("Lanes of kind {kind} reserve {requested_mb} MB but the host provides {capacity_mb} MB")]
    CapacityExceeded {
        /// Backend kind whose budget is exceeded
        kind: BackendKind,
        /// Sum of lane budgets
        requested_mb: u64,
        /// Declared host capacity
        capacity_mb: u64,
    },
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// One `[lanes.<name>]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaneToml {
    /// Backend root URL
    pub endpoint: Option<String>,

    /// Model identifier
    pub model_name: Option<String>,

    /// `fast-gpu` or `long-context`
    pub backend_kind: Option<BackendKind>,

    /// Resident memory budget in MB
    pub memory_budget_mb: Option<u64>,

    /// Lane to fall back to; omitted on the default lane
    pub fallback: Option<String>,

    /// Intent tags
    pub intents: Vec<String>,
}

impl LaneToml {
    /// Build the lane named `name` from this table
    #[must_use]
    pub fn to_lane(&self, name: &str) -> Lane {
        Lane {
            name: name.to_string(),
            intents: self.intents.clone(),
            fallback: self.fallback.clone(),
            config: LaneConfig {
                endpoint: self.endpoint.clone(),
                model_name: self.model_name.clone(),
                backend_kind: self.backend_kind,
                memory_budget_mb: self.memory_budget_mb,
            },
        }
    }
}

/// Host capacity section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityToml {
    /// Memory available to `fast-gpu` lanes in MB
    pub fast_gpu_mb: Option<u64>,

    /// Memory available to `long-context` lanes in MB
    pub long_context_mb: Option<u64>,
}

impl CapacityToml {
    /// Declared capacities indexed by backend kind
    #[must_use]
    pub fn to_per_kind(&self) -> PerKind<Option<u64>> {
        PerKind {
            fast_gpu: self.fast_gpu_mb,
            long_context: self.long_context_mb,
        }
    }
}

/// Health monitor section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Seconds between probes of the same lane
    pub probe_interval_secs: Option<u64>,

    /// Probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,

    /// Consecutive failures before a lane is marked unavailable
    pub unavailable_threshold: Option<u32>,
}

/// Circuit breaker section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerToml {
    /// Consecutive failed calls before the breaker opens
    pub failure_threshold: Option<u32>,

    /// Base cooldown in seconds
    pub cooldown_secs: Option<u64>,

    /// Cooldown multiplier applied per consecutive reopening
    pub backoff_multiplier: Option<f64>,

    /// Cooldown ceiling in seconds
    pub max_cooldown_secs: Option<u64>,

    /// Whether an out-of-memory failure opens the breaker at once
    pub trip_on_out_of_memory: Option<bool>,
}

/// Burst mode section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstToml {
    /// Requests that may wait on a paused backend kind
    pub queue_depth: Option<usize>,

    /// Seconds a queued request waits before failing
    pub queue_timeout_secs: Option<u64>,

    /// Seconds to wait for in-flight requests before forcing a burst
    pub drain_grace_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneRouterToml {
    /// Lane table keyed by lane name
    pub lanes: BTreeMap<String, LaneToml>,

    /// Host capacities
    pub capacity: CapacityToml,

    /// Health monitor tuning
    pub health: HealthToml,

    /// Circuit breaker tuning
    pub breaker: BreakerToml,

    /// Burst queue and drain tuning
    pub burst: BurstToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Fully resolved configuration
///
/// Use [`load_config`] to load it with proper priority handling, then
/// [`LaneRouterConfig::build_registry`] to validate the lanes.
#[derive(Clone, Debug)]
pub struct LaneRouterConfig {
    /// Lanes in name order
    pub lanes: Vec<Lane>,

    /// Declared host capacity per backend kind (MB)
    pub host_capacity_mb: PerKind<Option<u64>>,

    /// Health monitor settings
    pub health: HealthConfig,

    /// Circuit breaker settings
    pub breaker: BreakerConfig,

    /// Router queue settings
    pub router: RouterConfig,

    /// Burst coordinator settings
    pub burst: BurstConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for LaneRouterConfig {
    fn default() -> Self {
        Self {
            lanes: Vec::new(),
            host_capacity_mb: PerKind::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            router: RouterConfig::default(),
            burst: BurstConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl LaneRouterConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Validate the lanes and build the immutable registry
    ///
    /// # Errors
    ///
    /// Returns the first lane-table violation found (see [`Registry::from_lanes`]).
    pub fn build_registry(&self) -> Result<Registry, ConfigError> {
        Registry::from_lanes(self.lanes.clone(), self.host_capacity_mb.clone())
    }

    /// Check numeric settings for values that would make the router misbehave
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.backoff_multiplier < 1.0 {
            return invalid("breaker.backoff_multiplier must be >= 1.0");
        }
        if self.breaker.cooldown.is_zero() {
            return invalid("breaker.cooldown_secs must be non-zero");
        }
        if self.health.unavailable_threshold == 0 {
            return invalid("health.unavailable_threshold must be at least 1");
        }
        if self.health.probe_interval.is_zero() || self.health.probe_timeout.is_zero() {
            return invalid("health probe interval and timeout must be non-zero");
        }
        if self.router.queue_depth == 0 {
            return invalid("burst.queue_depth must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/lane-router/lanes.toml` or
/// `~/.config/lane-router/lanes.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lane-router").join("lanes.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if a
/// value fails validation. A missing config file is not an error here; the
/// empty lane table is rejected later by the registry.
pub fn load_config() -> Result<LaneRouterConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<LaneRouterConfig, ConfigError> {
    let mut config = LaneRouterConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: LaneRouterToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                lanes = config.lanes.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Parse configuration from TOML text (no environment overrides)
///
/// # Errors
///
/// Returns an error if the text is not valid TOML for this schema or fails
/// validation.
pub fn parse_config_str(toml_content: &str) -> Result<LaneRouterConfig, ConfigError> {
    let mut config = LaneRouterConfig::default();
    let toml_config: LaneRouterToml = toml::from_str(toml_content)?;
    apply_toml_config(&mut config, toml_config);
    config.source = ConfigSource::File;
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut LaneRouterConfig, toml: LaneRouterToml) {
    config.lanes = toml
        .lanes
        .iter()
        .map(|(name, lane)| lane.to_lane(name))
        .collect();
    config.host_capacity_mb = toml.capacity.to_per_kind();

    // Health settings
    if let Some(secs) = toml.health.probe_interval_secs {
        config.health.probe_interval = Duration::from_secs(secs);
    }
    if let Some(ms) = toml.health.probe_timeout_ms {
        config.health.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(threshold) = toml.health.unavailable_threshold {
        config.health.unavailable_threshold = threshold;
    }

    // Breaker settings
    if let Some(threshold) = toml.breaker.failure_threshold {
        config.breaker.failure_threshold = threshold;
    }
    if let Some(secs) = toml.breaker.cooldown_secs {
        config.breaker.cooldown = Duration::from_secs(secs);
    }
    if let Some(multiplier) = toml.breaker.backoff_multiplier {
        config.breaker.backoff_multiplier = multiplier;
    }
    if let Some(secs) = toml.breaker.max_cooldown_secs {
        config.breaker.max_cooldown = Duration::from_secs(secs);
    }
    if let Some(trip) = toml.breaker.trip_on_out_of_memory {
        config.breaker.trip_on_out_of_memory = trip;
    }

    // Burst settings
    if let Some(depth) = toml.burst.queue_depth {
        config.router.queue_depth = depth;
    }
    if let Some(secs) = toml.burst.queue_timeout_secs {
        config.router.queue_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.burst.drain_grace_secs {
        config.burst.drain_grace = Duration::from_secs(secs);
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut LaneRouterConfig) {
    if let Some(secs) = env_parse::<u64>("LANE_ROUTER_PROBE_INTERVAL") {
        config.health.probe_interval = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("LANE_ROUTER_PROBE_TIMEOUT") {
        config.health.probe_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(threshold) = env_parse::<u32>("LANE_ROUTER_FAILURE_THRESHOLD") {
        config.breaker.failure_threshold = threshold;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("LANE_ROUTER_COOLDOWN") {
        config.breaker.cooldown = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(depth) = env_parse::<usize>("LANE_ROUTER_QUEUE_DEPTH") {
        config.router.queue_depth = depth;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("LANE_ROUTER_QUEUE_TIMEOUT") {
        config.router.queue_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("LANE_ROUTER_DRAIN_GRACE") {
        config.burst.drain_grace = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Probe interval override (seconds)
    pub probe_interval_secs: Option<u64>,

    /// Breaker failure threshold override
    pub failure_threshold: Option<u32>,

    /// Burst queue depth override
    pub queue_depth: Option<usize>,

    /// Drain grace override (seconds)
    pub drain_grace_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set probe interval override
    #[must_use]
    pub fn with_probe_interval_secs(mut self, secs: u64) -> Self {
        self.probe_interval_secs = Some(secs);
        self
    }

    /// Set failure threshold override
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set queue depth override
    #[must_use]
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    /// Set drain grace override
    #[must_use]
    pub fn with_drain_grace_secs(mut self, secs: u64) -> Self {
        self.drain_grace_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if an override leaves the
    /// configuration invalid.
    pub fn apply(&self, config: &mut LaneRouterConfig) -> Result<(), ConfigError> {
        if self.probe_interval_secs.is_some()
            || self.failure_threshold.is_some()
            || self.queue_depth.is_some()
            || self.drain_grace_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(secs) = self.probe_interval_secs {
            config.health.probe_interval = Duration::from_secs(secs);
        }
        if let Some(threshold) = self.failure_threshold {
            config.breaker.failure_threshold = threshold;
        }
        if let Some(depth) = self.queue_depth {
            config.router.queue_depth = depth;
        }
        if let Some(secs) = self.drain_grace_secs {
            config.burst.drain_grace = Duration::from_secs(secs);
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[lanes.orchestrator]
endpoint = "http://127.0.0.1:8000"
model_name = "qwen2.5-14b-instruct"
backend_kind = "fast-gpu"
memory_budget_mb = 16000
intents = ["chat"]

[lanes.coder]
fallback = "orchestrator"
intents = ["code"]

[lanes.deep]
endpoint = "http://127.0.0.1:9000"
model_name = "long-128k"
backend_kind = "long-context"
memory_budget_mb = 40000
fallback = "orchestrator"

[capacity]
fast_gpu_mb = 24000
long_context_mb = 48000

[health]
probe_interval_secs = 10
probe_timeout_ms = 2000
unavailable_threshold = 4

[breaker]
failure_threshold = 7
cooldown_secs = 45
backoff_multiplier = 3.0

[burst]
queue_depth = 20
queue_timeout_secs = 12
drain_grace_secs = 8
"#;

    #[test]
    fn test_default_config() {
        let config = LaneRouterConfig::default();

        assert!(config.lanes.is_empty());
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.router.queue_depth, 50);
        assert_eq!(config.router.queue_timeout, Duration::from_secs(30));
        assert_eq!(config.health.unavailable_threshold, 3);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.to_string_lossy().contains("lane-router"));
            assert!(p.to_string_lossy().ends_with("lanes.toml"));
        }
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config_str(SAMPLE).unwrap();

        assert_eq!(config.lanes.len(), 3);
        // BTreeMap keeps lanes in name order
        assert_eq!(config.lanes[0].name, "coder");
        assert_eq!(config.lanes[0].fallback.as_deref(), Some("orchestrator"));
        assert_eq!(config.lanes[1].name, "deep");
        assert_eq!(
            config.lanes[1].config.backend_kind,
            Some(BackendKind::LongContext)
        );
        assert_eq!(config.lanes[2].intents, vec!["chat".to_string()]);

        assert_eq!(config.host_capacity_mb.fast_gpu, Some(24000));
        assert_eq!(config.health.probe_interval, Duration::from_secs(10));
        assert_eq!(config.health.probe_timeout, Duration::from_millis(2000));
        assert_eq!(config.health.unavailable_threshold, 4);
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.breaker.cooldown, Duration::from_secs(45));
        assert!((config.breaker.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.router.queue_depth, 20);
        assert_eq!(config.router.queue_timeout, Duration::from_secs(12));
        assert_eq!(config.burst.drain_grace, Duration::from_secs(8));

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.default_lane().name, "orchestrator");
    }

    #[test]
    fn test_unknown_lane_field_rejected() {
        let result = parse_config_str(
            r#"
[lanes.a]
endpoint = "http://a"
modle_name = "typo"
"#,
        );
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_backend_kind_rejected() {
        let result = parse_config_str(
            r#"
[lanes.a]
endpoint = "http://a"
model_name = "m"
backend_kind = "tpu"
"#,
        );
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let result = parse_config_str(
            r#"
[breaker]
failure_threshold = 0
"#,
        );
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(config.lanes.len(), 3);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config =
            load_config_from_path(Some(PathBuf::from("/nonexistent/lane-router/lanes.toml")))
                .unwrap();

        assert!(config.lanes.is_empty());
        assert!(config.config_file_path.is_none());
        assert!(matches!(config.build_registry(), Err(ConfigError::NoLanes)));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"[lanes.a\nendpoint = ").unwrap();

        let result = load_config_from_path(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = parse_config_str(SAMPLE).unwrap();

        ConfigOverrides::new()
            .with_failure_threshold(2)
            .with_queue_depth(3)
            .with_probe_interval_secs(1)
            .with_drain_grace_secs(4)
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.router.queue_depth, 3);
        assert_eq!(config.health.probe_interval, Duration::from_secs(1));
        assert_eq!(config.burst.drain_grace, Duration::from_secs(4));
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_invalid_cli_override_rejected() {
        let mut config = LaneRouterConfig::default();
        let result = ConfigOverrides::new().with_queue_depth(0).apply(&mut config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = LaneRouterConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }

    #[test]
    fn test_error_messages() {
        let err = ConfigError::FallbackCycle {
            lanes: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(err.to_string(), "Fallback cycle detected: a -> b -> c");

        let err = ConfigError::DanglingFallback {
            lane: "coder".into(),
            target: "ghost".into(),
        };
        assert!(err.to_string().contains("ghost"));
    }
}
