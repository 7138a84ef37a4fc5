use std::path::PathBuf;

use thiserror::Error;

use crate::plugin::PluginError;

#[derive(Error, Debug)]
pub enum DropzoneError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watch error on {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("Invalid pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DropzoneError {
    pub(crate) fn watch(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        DropzoneError::Watch {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DropzoneError>;
