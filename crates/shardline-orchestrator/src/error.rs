//! Orchestrator error types.

use thiserror::Error;

use shardline_core::{ConfigError, Phase};
use shardline_metrics::RecordError;
use shardline_runtime::RuntimeError;

/// Errors returned by the orchestrator control surface.
///
/// State-machine violations leave the orchestrator untouched; a failed
/// start leaves it `Idle` with nothing running.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a run is already active (phase: {phase})")]
    AlreadyRunning { phase: Phase },

    #[error("no run is active (phase: {phase})")]
    NotRunning { phase: Phase },

    #[error(
        "start failed: {spawned} of {requested} instances spawned, {failed} failed; \
         all spawned instances were torn down: {reason}"
    )]
    PartialStartFailure {
        requested: u32,
        spawned: u32,
        failed: u32,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("request rejected: {0}")]
    Record(#[from] RecordError),

    #[error("no live instance left in the active run")]
    NoLiveInstances,

    #[error("{operation} did not complete: {reason}")]
    TaskFailed {
        operation: &'static str,
        reason: String,
    },
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::PartialStart {
                requested,
                spawned,
                failed,
                reason,
            } => OrchestratorError::PartialStartFailure {
                requested,
                spawned,
                failed,
                reason,
            },
            RuntimeError::AlreadyStarted => OrchestratorError::AlreadyRunning {
                phase: Phase::Starting,
            },
            RuntimeError::InvalidLayout(e) => OrchestratorError::InvalidConfig(e),
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
