use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub intel: IntelConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Per-run pipeline toggles
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Execution environment: "mock" or "real"
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Overrides environment: always use the mock executor
    #[serde(default)]
    pub force_mock: bool,
    /// Permit learning-state updates from mock episodes
    #[serde(default)]
    pub learn_from_mock: bool,
    /// RNG seed; absent means generated per run
    #[serde(default)]
    pub seed: Option<u64>,
    /// Base directory for runs/<run_id>/episodes/<episode_id>/
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Agent version string stamped into every artifact
    #[serde(default = "default_agent_version")]
    pub agent_version: String,
    /// Default trading pair when a proposal does not carry one
    #[serde(default = "default_pair")]
    pub default_pair: String,
    /// Default pool address for proposals
    #[serde(default)]
    pub default_pool: Option<String>,
}

/// Intelligence layer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IntelConfig {
    /// Analytics backend: "mock" or "dune"
    #[serde(default = "default_intel_source")]
    pub source: String,
    /// Path to the quality-KV cache file
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    /// Path to the scheduler trigger log (append-only JSONL)
    #[serde(default = "default_trigger_file")]
    pub trigger_file: String,
    /// Base URL of the hosted analytics provider (intel.source = "dune")
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
}

/// Background refresh scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrent refresh workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Maximum pools tracked in the active set
    #[serde(default = "default_pool_cap")]
    pub pool_cap: usize,
    /// Seconds between refresh ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Per-job wall timeout for backend calls
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Shutdown grace period for in-flight workers
    #[serde(default = "default_drain_secs")]
    pub drain_secs: u64,
    /// Triggers older than this are discarded at tick boundaries
    #[serde(default = "default_trigger_horizon_secs")]
    pub trigger_horizon_secs: i64,
    /// Expensive-class refreshes allowed per tick
    #[serde(default = "default_expensive_budget")]
    pub expensive_budget: usize,
    /// "hard": P0 items are exempt from the expensive budget.
    /// "soft": P0 items consume budget first.
    #[serde(default = "default_expensive_budget_mode")]
    pub expensive_budget_mode: String,
    /// Explicit active pools (overrides discovery from recent episodes)
    #[serde(default)]
    pub active_pools: Vec<String>,
}

/// Live gateway configuration (real mode only)
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub base_url: String,
    /// Quote gas estimates above this ceiling are rejected
    #[serde(default = "default_gas_ceiling")]
    pub gas_ceiling: u64,
    /// Degrade to the mock executor when the gateway is unhealthy
    #[serde(default)]
    pub allow_mock_fallback: bool,
    /// Testing escape hatch: skip real-mode pool validation
    #[serde(default)]
    pub disable_pool_validation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            force_mock: false,
            learn_from_mock: false,
            seed: None,
            base_dir: default_base_dir(),
            agent_version: default_agent_version(),
            default_pair: default_pair(),
            default_pool: None,
        }
    }
}

impl Default for IntelConfig {
    fn default() -> Self {
        Self {
            source: default_intel_source(),
            cache_file: default_cache_file(),
            trigger_file: default_trigger_file(),
            backend_url: default_backend_url(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            pool_cap: default_pool_cap(),
            tick_interval_secs: default_tick_interval_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            drain_secs: default_drain_secs(),
            trigger_horizon_secs: default_trigger_horizon_secs(),
            expensive_budget: default_expensive_budget(),
            expensive_budget_mode: default_expensive_budget_mode(),
            active_pools: Vec::new(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            gas_ceiling: default_gas_ceiling(),
            allow_mock_fallback: false,
            disable_pool_validation: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            intel: IntelConfig::default(),
            scheduler: SchedulerConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn default_environment() -> String {
    "mock".to_string()
}

fn default_base_dir() -> String {
    "data".to_string()
}

fn default_agent_version() -> String {
    "v1.0".to_string()
}

fn default_pair() -> String {
    "WETH-USDC".to_string()
}

fn default_intel_source() -> String {
    "mock".to_string()
}

fn default_cache_file() -> String {
    "data/intel_cache.json".to_string()
}

fn default_trigger_file() -> String {
    "data/intel_triggers.jsonl".to_string()
}

fn default_backend_url() -> String {
    "https://api.dune.com/api/v1".to_string()
}

fn default_worker_count() -> usize {
    3
}

fn default_pool_cap() -> usize {
    3
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_job_timeout_secs() -> u64 {
    30
}

fn default_drain_secs() -> u64 {
    30
}

fn default_trigger_horizon_secs() -> i64 {
    600
}

fn default_expensive_budget() -> usize {
    1
}

fn default_expensive_budget_mode() -> String {
    "hard".to_string()
}

fn default_gateway_url() -> String {
    "http://localhost:15888".to_string()
}

fn default_gas_ceiling() -> u64 {
    1_000_000
}

impl AppConfig {
    /// Load configuration from a file plus CLMM_LAB_* environment overrides.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("CLMM_LAB")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate config invariants. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !matches!(self.pipeline.environment.as_str(), "mock" | "real") {
            errors.push(format!(
                "pipeline.environment must be \"mock\" or \"real\", got \"{}\"",
                self.pipeline.environment
            ));
        }
        if !matches!(self.intel.source.as_str(), "mock" | "dune") {
            errors.push(format!(
                "intel.source must be \"mock\" or \"dune\", got \"{}\"",
                self.intel.source
            ));
        }
        if self.scheduler.worker_count == 0 {
            errors.push("scheduler.worker_count must be > 0".to_string());
        }
        if self.scheduler.pool_cap == 0 {
            errors.push("scheduler.pool_cap must be > 0".to_string());
        }
        if self.scheduler.tick_interval_secs == 0 {
            errors.push("scheduler.tick_interval_secs must be > 0".to_string());
        }
        if !matches!(
            self.scheduler.expensive_budget_mode.as_str(),
            "hard" | "soft"
        ) {
            errors.push(format!(
                "scheduler.expensive_budget_mode must be \"hard\" or \"soft\", got \"{}\"",
                self.scheduler.expensive_budget_mode
            ));
        }
        errors
    }

    /// Effective execution mode after the force_mock override.
    pub fn exec_environment(&self) -> &str {
        if self.pipeline.force_mock {
            "mock"
        } else {
            self.pipeline.environment.as_str()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_empty());
        assert_eq!(cfg.scheduler.worker_count, 3);
        assert_eq!(cfg.scheduler.pool_cap, 3);
        assert_eq!(cfg.scheduler.tick_interval_secs, 60);
        assert_eq!(cfg.scheduler.expensive_budget, 1);
    }

    #[test]
    fn force_mock_overrides_environment() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.environment = "real".to_string();
        assert_eq!(cfg.exec_environment(), "real");
        cfg.pipeline.force_mock = true;
        assert_eq!(cfg.exec_environment(), "mock");
    }

    #[test]
    fn bad_toggles_are_reported() {
        let mut cfg = AppConfig::default();
        cfg.pipeline.environment = "paper".to_string();
        cfg.scheduler.expensive_budget_mode = "advisory".to_string();
        cfg.scheduler.worker_count = 0;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 3);
    }
}
