//! Error types for the evaluation engine.

use chrono::NaiveDate;
use riskflow_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("View compilation failed: {message}")]
    CompilationFailure { message: String },

    #[error("Cycle execution failed: {message}")]
    CycleExecutionFailure {
        valuation_date: Option<NaiveDate>,
        message: String,
    },

    #[error("Duplicate result for {requirement} on {date}")]
    DuplicateResult { requirement: String, date: NaiveDate },

    #[error("View process terminated before completion (interrupted: {interrupted})")]
    ProcessTerminated { interrupted: bool },

    #[error("View client shut down before the job completed: {message}")]
    ClientShutdown { message: String },

    #[error("Reinitialization of function repository {repository} failed: {message}")]
    Reinitialization { repository: String, message: String },

    #[error(transparent)]
    Persistence(#[from] DbError),

    #[error("Config store error: {0}")]
    ConfigStore(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Result channel closed before the job reported an outcome")]
    ResultChannelClosed,
}

impl EngineError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn config_store(err: impl std::fmt::Display) -> Self {
        Self::ConfigStore(err.to_string())
    }

    /// Short label for structured logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompilationFailure { .. } => "compilation_failure",
            Self::CycleExecutionFailure { .. } => "cycle_execution_failure",
            Self::DuplicateResult { .. } => "duplicate_result",
            Self::ProcessTerminated { .. } => "process_terminated",
            Self::ClientShutdown { .. } => "client_shutdown",
            Self::Reinitialization { .. } => "reinitialization",
            Self::Persistence(_) => "persistence",
            Self::ConfigStore(_) => "config_store",
            Self::Collaborator(_) => "collaborator",
            Self::InvalidState(_) => "invalid_state",
            Self::ResultChannelClosed => "result_channel_closed",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
