//! shardline-core — shared types for the shardline workload orchestrator.
//!
//! Holds the run data model (instances, shard assignment, resource
//! samples, request records, `RunStats`), the orchestrator configuration
//! and its TOML loader, and the duration parser shared by the config and
//! the CLI.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{
    validate_counts, MemoryAggregation, OrchestratorConfig, SimulationConfig, WorkerConfig,
};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
