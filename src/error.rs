//! Error types for the server-mode reader

use std::path::PathBuf;

use crate::io::ProcessError;
use crate::server::correlator::CorrelatorError;
use crate::server::message::RequestKind;

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// Starting or talking to the cmake process failed
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("CMake server connection lost: {0}")]
    Transport(String),

    /// The server answered a request with an error
    #[error("CMake server {step} request failed: {message}")]
    Protocol { step: RequestKind, message: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error("Operation {operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("No parameters set; call set_parameters() first")]
    NoParameters,

    #[error("Invalid build directory {path}: {source}")]
    BuildDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache argument {argument:?}: expected KEY[:TYPE]=VALUE")]
    InvalidConfigItem { argument: String },

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReaderError {
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        ReaderError::InvalidState {
            operation,
            state: format!("{state:?}"),
        }
    }
}
