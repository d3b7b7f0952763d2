use stackflow_engine::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Error inside a `${...}` expression, with the byte offset it was found at
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (at offset {offset})")]
pub struct ExpressionError {
    pub offset: usize,
    pub message: String,
}

impl ExpressionError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StackError {
    #[error("KDL parse error: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("Failed to read stack file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid expression in {location}: {source}")]
    Expression {
        location: String,
        #[source]
        source: ExpressionError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(
        "Project root not found\nSearched from: {0}\nHint: run inside a directory containing stack.kdl"
    )]
    ProjectRootNotFound(PathBuf),
}

pub type Result<T> = std::result::Result<T, StackError>;
