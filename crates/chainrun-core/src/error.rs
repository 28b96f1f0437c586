//! Core domain errors.

use thiserror::Error;

/// Core domain errors for ChainRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid processing options.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}
