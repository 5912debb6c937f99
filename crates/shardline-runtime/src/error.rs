//! Runtime error types.

use thiserror::Error;

use shardline_core::ConfigError;

/// Errors raised by the instance supervisor.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(
        "started {spawned} of {requested} instances, {failed} failed or were aborted; \
         spawned instances were torn down: {reason}"
    )]
    PartialStart {
        requested: u32,
        spawned: u32,
        failed: u32,
        reason: String,
    },

    #[error("supervisor already owns live instances")]
    AlreadyStarted,

    #[error(transparent)]
    InvalidLayout(#[from] ConfigError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
