//! shardline.toml configuration.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! usable single-instance configuration. The policy knobs
//! `parallel_efficiency_factor` and `calibration_constant` are
//! approximations used by the stats engine, not measured quantities.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Instances spawned per run unless the start request overrides it.
    pub instance_count: u32,
    /// Shards per run unless the start request overrides it.
    pub shard_count: u32,
    /// Resource sampling cadence.
    pub sample_interval_ms: u64,
    /// How long `stop()` waits after a graceful terminate before force-killing.
    pub grace_timeout_ms: u64,
    /// Expected fraction of linear scaling when running several instances.
    /// Speedup is estimated as `instances * parallel_efficiency_factor`.
    pub parallel_efficiency_factor: f64,
    /// Requests/s per CPU percent that maps to an efficiency score of 1.0.
    /// A tuning knob, not a physical invariant.
    pub calibration_constant: f64,
    /// How per-instance memory at the final tick is combined.
    pub memory_aggregation: MemoryAggregation,
    pub worker: WorkerConfig,
    pub simulation: SimulationConfig,
}

/// Combination policy for per-instance memory readings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAggregation {
    #[default]
    Sum,
    Average,
}

/// Command launched once per instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Synthetic load parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated processing cost of one request.
    pub base_latency_ms: f64,
    /// Uniform jitter in `[0, jitter_ms)` added to each latency.
    pub jitter_ms: f64,
    /// Seed for the latency PRNG.
    pub seed: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            instance_count: 1,
            shard_count: 1,
            sample_interval_ms: 100,
            grace_timeout_ms: 2000,
            parallel_efficiency_factor: 0.7,
            calibration_constant: 10.0,
            memory_aggregation: MemoryAggregation::Sum,
            worker: WorkerConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        // Idle placeholder worker for runs that only measure orchestration.
        Self {
            program: "sleep".to_string(),
            args: vec!["86400".to_string()],
            env: HashMap::new(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 5.0,
            jitter_ms: 2.0,
            seed: 42,
        }
    }
}

impl OrchestratorConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: OrchestratorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that counts, intervals and policy knobs are usable.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_counts(self.instance_count, self.shard_count)?;
        if self.sample_interval_ms == 0 {
            return Err(invalid("sample_interval_ms must be greater than zero"));
        }
        if !is_positive(self.parallel_efficiency_factor) {
            return Err(invalid("parallel_efficiency_factor must be a positive number"));
        }
        if !is_positive(self.calibration_constant) {
            return Err(invalid("calibration_constant must be a positive number"));
        }
        if self.worker.program.trim().is_empty() {
            return Err(invalid("worker.program must not be empty"));
        }
        let sim = &self.simulation;
        if !sim.base_latency_ms.is_finite() || sim.base_latency_ms < 0.0 {
            return Err(invalid("simulation.base_latency_ms must be zero or positive"));
        }
        if !sim.jitter_ms.is_finite() || sim.jitter_ms < 0.0 {
            return Err(invalid("simulation.jitter_ms must be zero or positive"));
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Both counts must be at least one.
pub fn validate_counts(instance_count: u32, shard_count: u32) -> ConfigResult<()> {
    if instance_count == 0 {
        return Err(invalid("instance_count must be greater than zero"));
    }
    if shard_count == 0 {
        return Err(invalid("shard_count must be greater than zero"));
    }
    Ok(())
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
