//! Error types for the core library

use std::path::PathBuf;

use thiserror::Error;

use crate::run::RunState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    DuplicateRun(String),

    #[error("Invalid state transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunState,
        to: RunState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error at {path}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("Invalid safety patterns: {}", .0.join("; "))]
    InvalidPatterns(Vec<String>),
}

impl Error {
    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }
}
