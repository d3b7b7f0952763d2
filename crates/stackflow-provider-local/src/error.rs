//! Local provider error types

use stackflow_engine::ProviderError;
use std::io::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocalError {
    #[error("Unsupported resource type: {0}")]
    UnsupportedType(String),

    #[error("{resource_type} requires attribute '{attribute}'")]
    MissingAttribute {
        resource_type: String,
        attribute: String,
    },

    #[error("Invalid value for '{attribute}': {message}")]
    InvalidAttribute { attribute: String, message: String },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Directory is not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LocalError>;

impl From<LocalError> for ProviderError {
    fn from(err: LocalError) -> Self {
        let message = err.to_string();
        match &err {
            LocalError::NotFound(_) => ProviderError::not_found(message),
            LocalError::IoError(io) => match io.kind() {
                ErrorKind::NotFound => ProviderError::not_found(message),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                    ProviderError::transient(message)
                }
                _ => ProviderError::permanent(message),
            },
            _ => ProviderError::permanent(message),
        }
    }
}
