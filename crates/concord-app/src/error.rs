//! Application-level error type shared across the binary and services.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::AppConfigError;
use crate::paths::PathError;
use crate::server::ServerError;
use crate::services::arbitration::ArbitrationError;
use crate::services::complexity::ComplexityError;
use crate::services::coordinator::CoordinatorError;
use crate::services::jobs::TrackerError;
use crate::services::orchestrator::OrchestratorError;
use crate::services::reaper::ReaperError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Store(#[from] Box<StoreError>),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Tracker(#[from] Box<TrackerError>),
    #[error(transparent)]
    Coordinator(#[from] Box<CoordinatorError>),
    #[error(transparent)]
    Orchestrator(#[from] Box<OrchestratorError>),
    #[error(transparent)]
    Arbitration(#[from] Box<ArbitrationError>),
    #[error(transparent)]
    Complexity(#[from] Box<ComplexityError>),
    #[error(transparent)]
    Reaper(#[from] ReaperError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Store(Box::new(e))
    }
}

impl From<TrackerError> for AppError {
    fn from(e: TrackerError) -> Self {
        AppError::Tracker(Box::new(e))
    }
}

impl From<CoordinatorError> for AppError {
    fn from(e: CoordinatorError) -> Self {
        AppError::Coordinator(Box::new(e))
    }
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        AppError::Orchestrator(Box::new(e))
    }
}

impl From<ArbitrationError> for AppError {
    fn from(e: ArbitrationError) -> Self {
        AppError::Arbitration(Box::new(e))
    }
}

impl From<ComplexityError> for AppError {
    fn from(e: ComplexityError) -> Self {
        AppError::Complexity(Box::new(e))
    }
}
