//! Engine error types

use crate::provider::ProviderError;
use crate::state::LockInfo;
use thiserror::Error;

/// Fatal configuration problems. Raised before any mutation happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Dependency cycle between: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Unresolved reference in {from}: {reference}")]
    UnresolvedReference { from: String, reference: String },

    #[error("Invalid instance index in {from}: {reference}")]
    InvalidIndex { from: String, reference: String },

    #[error("{from} uses {expression} but declares no matching count/for_each")]
    IterationOutsideRepetition { from: String, expression: String },

    #[error("Duplicate resource declaration: {0}")]
    DuplicateResource(String),

    #[error("Invalid expression in {from}: {message}")]
    InvalidExpression { from: String, message: String },

    #[error("{address} has prevent_destroy set but the plan would {action} it")]
    PreventDestroy { address: String, action: String },
}

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("{}", lock_busy_message(.info, .possibly_stale))]
    LockBusy {
        info: LockInfo,
        possibly_stale: bool,
    },

    #[error("Lock {0} is not held by this process")]
    LockNotHeld(String),

    #[error("No lock with id {0}")]
    LockNotFound(String),

    #[error(
        "State changed since it was loaded (expected serial {expected}, found {found}); reload and plan again"
    )]
    StaleState { expected: u64, found: u64 },

    #[error("State lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch { expected: String, found: String },

    #[error("Unsupported state format version {0}")]
    UnsupportedFormatVersion(u32),

    #[error("Saved plan no longer matches the current configuration and state")]
    StalePlan,

    #[error("Resource not found in state: {0}")]
    StateNotFound(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Ambiguous real-world state: {0}")]
    AmbiguousState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn lock_busy_message(info: &LockInfo, possibly_stale: &bool) -> String {
    let mut message = format!(
        "State is locked by {} ({}) since {} [lock id {}]",
        info.owner, info.operation, info.acquired_at, info.id
    );
    if *possibly_stale {
        message.push_str(
            "; the lock may be stale. If its holder is gone, break it with `force-unlock <lock id>`",
        );
    }
    message
}

impl EngineError {
    /// Whether the caller may simply retry the operation later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::LockBusy { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
