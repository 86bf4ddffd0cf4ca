use std::path::PathBuf;

use thiserror::Error;

use crate::core::domain::Phase;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint stored at {0}")]
    NotFound(PathBuf),

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed checkpoint at {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum RelaxError {
    #[error("Calculation at {location} did not complete successfully")]
    ExecutionFailure { location: PathBuf },

    #[error("Could not converge {phase} in {iterations} iterations")]
    ConvergenceFailure { phase: Phase, iterations: usize },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Executor failed at {location}: {source}")]
    Executor {
        location: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("Result at {location} carries no total energy")]
    MissingEnergy { location: PathBuf },

    #[error("Controller protocol violated: {0}")]
    Protocol(&'static str),
}

pub type Result<T, E = RelaxError> = std::result::Result<T, E>;
