//! Error types for the takeover engine.
//!
//! Only setup failures are hard errors. "Didn't work this time" outcomes
//! travel as fields on the result records instead (see `PanelState`,
//! `SendOutcome`, `ResponseOutcome`, `SpawnOutcome`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TakeoverError {
    /// Endpoint unreachable, or no document present at connect time
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("panel {index} not found ({total} panels present)")]
    PanelNotFound { index: usize, total: usize },

    #[error(transparent)]
    Mount(#[from] MountFailure),

    #[error("document operation failed: {0}")]
    Document(String),
}

/// A mount attempt that did not reach the mounted state.
///
/// The mount record was not created and every document mutation the attempt
/// had applied was reversed before this was returned.
#[derive(Debug, Error)]
#[error("mount failed during {stage}: {message}")]
pub struct MountFailure {
    pub stage: &'static str,
    pub message: String,
    /// Backtrace captured at the point of failure
    pub trace: String,
    /// Mutations that could not be reversed during rollback
    pub rollback_errors: Vec<String>,
}

impl MountFailure {
    pub fn new(stage: &'static str, err: &anyhow::Error) -> Self {
        Self {
            stage,
            message: format!("{:#}", err),
            trace: std::backtrace::Backtrace::force_capture().to_string(),
            rollback_errors: Vec::new(),
        }
    }
}
