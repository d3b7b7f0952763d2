//! Local filesystem provider for StackFlow
//!
//! Implements the engine's `Provider` trait for resources that live on the
//! local machine. Useful on its own for generated files, and as a reference
//! provider for tests and demos.
//!
//! # Resource types
//!
//! - `local_file`: `path` (forces replacement), `content`; computes `sha256`, `size`
//! - `local_directory`: `path` (forces replacement)
//! - `random_id`: `byte_length`, `keepers` (both force replacement); computes `hex`, `dec`
//!
//! # Data sources
//!
//! - `local_file`: `path`; returns `content`, `sha256`, `size`
//!
//! # Example
//!
//! ```ignore
//! use stackflow_provider_local::LocalProvider;
//! use stackflow_engine::Provider;
//!
//! let provider = LocalProvider::new("/srv/site");
//! let created = provider.create("local_directory", &attributes).await?;
//! ```

pub mod error;
pub mod provider;
pub mod registry;

pub use error::{LocalError, Result};
pub use provider::{LOCAL_DIRECTORY, LOCAL_FILE, LocalProvider, RANDOM_ID};
pub use registry::{ObjectRecord, ObjectRegistry};
