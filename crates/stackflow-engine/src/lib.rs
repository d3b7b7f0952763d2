//! StackFlow reconciliation engine
//!
//! Reconciles a declared set of resources with the real world through a
//! provider, keeping a lockable, versioned record of what exists.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ ResourceSet  │   │  StateStore  │ load / lock / commit
//! └──────┬───────┘   └──────┬───────┘
//!        │ graph            │
//! ┌──────▼───────┐          │
//! │ResourceGraph ├──────────▼──┐
//! └──────────────┘    diff     │
//!                 ┌────────────▼┐
//!                 │  DiffEntry  │
//!                 └──────┬──────┘
//!                        │ plan (partial order, checksum)
//!                 ┌──────▼──────┐
//!                 │    Plan     │
//!                 └──────┬──────┘
//!                        │ execute (bounded parallelism)
//!                 ┌──────▼──────┐    ┌──────────┐
//!                 │  Executor   ├────► Provider │
//!                 └─────────────┘    └──────────┘
//! ```

pub mod backend;
pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod plan;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod state;

// Re-exports
pub use backend::{LocalStateStore, MemoryStateStore};
pub use diff::{Action, DiffEntry, PlannedAttributes, ReplaceOrder, diff};
pub use engine::{ApplyOutcome, Engine, EngineOptions, PlanOutcome, evaluate_outputs};
pub use error::{ConfigError, EngineError, Result};
pub use executor::{
    ApplyReport, CancelHandle, EntryResult, ExecuteOptions, Executor, Outcome, StepEvent,
    StepResult, StepStatus,
};
pub use expr::{Expr, Function, IterationRef, PlannedValue, Reference};
pub use graph::{ResourceGraph, ResourceNode};
pub use plan::{Plan, PlanArtifact, PlanStep, PlanSummary, StepId, StepKind};
pub use provider::{
    AttributeDelta, AttributeSchema, CollectionSemantics, CreatedResource, Operation, Provider,
    ProviderError, ProviderErrorKind, ProviderResult, ResourceSchema, RetryConfig,
    UpdateSemantics, retry_transient,
};
pub use refresh::{Drift, RefreshReport};
pub use resource::{
    Attributes, DataConfig, DataValues, InstanceAddress, InstanceKey, Lifecycle, Repetition,
    ResourceConfig, ResourceId, ResourceSet,
};
pub use state::{
    FORMAT_VERSION, Lock, LockInfo, LockPolicy, StateFile, StateRecord, StateStore,
    UNREADABLE_LOCK_ID, acquire_lock_with_policy, default_lock_owner,
};
