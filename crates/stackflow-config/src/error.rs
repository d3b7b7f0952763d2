use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "Stack file not found. Looked for:\n\
        - current directory: stack.local.kdl, stack.kdl\n\
        - ./.stackflow/ directory: stack.local.kdl, stack.kdl\n\
        Set STACKFLOW_CONFIG_PATH to point at a file directly"
    )]
    StackFileNotFound,

    #[error("Invalid settings file {path}: {source}")]
    InvalidSettings {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
