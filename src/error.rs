//! Orchestrator-level error taxonomy and its process exit-code mapping.

use crate::machine::AgentError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InputError(String),

    #[error("{dataset} has no snapshots on the destination and --init was not given")]
    NotInitialized { dataset: String },

    #[error("{src} and {dst} have diverged: no common snapshot guid")]
    Diverged { src: String, dst: String },

    #[error("transfer of snapshot at index {index} failed")]
    TransferFailed { index: usize },

    #[error("refusing to prune {dataset}: the keep set would be empty")]
    RefuseDestroyAll { dataset: String },

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Maps a failure kind to this tool's process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::InputError(_) => 2,
            AppError::NotInitialized { .. }
            | AppError::Diverged { .. }
            | AppError::RefuseDestroyAll { .. } => 3,
            AppError::Interrupted => 130,
            AppError::TransferFailed { .. } | AppError::Agent(_) | AppError::Other(_) => 1,
        }
    }
}
