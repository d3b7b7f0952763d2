//! Provider interface
//!
//! Providers own the per-type CRUD calls and the diff hints the differ needs.
//! Retrying transient failures is the provider's business; the engine treats
//! every call as atomic.

use crate::resource::Attributes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// How a changed attribute is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSemantics {
    #[default]
    InPlace,
    ForcesReplacement,
}

/// How collection-valued attributes are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionSemantics {
    #[default]
    Ordered,
    Unordered,
}

/// Provider operation kinds, used to look up per-operation timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Read => write!(f, "read"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Declared behavior of one attribute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeSchema {
    pub update: UpdateSemantics,
    pub collection: CollectionSemantics,
    /// Set by the provider, never by configuration
    pub computed: bool,
}

impl AttributeSchema {
    pub fn in_place() -> Self {
        Self::default()
    }

    pub fn forces_replacement() -> Self {
        Self {
            update: UpdateSemantics::ForcesReplacement,
            ..Self::default()
        }
    }

    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Self::default()
        }
    }

    pub fn unordered(mut self) -> Self {
        self.collection = CollectionSemantics::Unordered;
        self
    }
}

/// Schema of a resource type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    pub version: u32,
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl ResourceSchema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            attributes: BTreeMap::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedResource {
    pub id: String,
    /// Full attribute set, computed attributes included
    pub attributes: Attributes,
    /// Opaque payload stored alongside the record
    pub private: Option<serde_json::Value>,
}

/// Input of an in-place update
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDelta {
    pub prior: Attributes,
    pub desired: Attributes,
    pub changed: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Eligible for provider-side retry (rate limits, flaky network)
    Transient,
    Permanent,
    NotFound,
    Timeout,
    /// The real-world effect of the call is unknown
    Ambiguous,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Transient => write!(f, "transient"),
            ProviderErrorKind::Permanent => write!(f, "permanent"),
            ProviderErrorKind::NotFound => write!(f, "not found"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Ambiguous => write!(f, "ambiguous"),
        }
    }
}

/// Error returned by a provider call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Ambiguous, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Provider abstraction trait
///
/// One provider serves every resource type the configuration uses. The diff
/// hints default to the answers found in [`Provider::schema`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider name (e.g., "local")
    fn name(&self) -> &str;

    /// Schema of a resource type, `None` if the type is unsupported
    fn schema(&self, resource_type: &str) -> Option<ResourceSchema>;

    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<CreatedResource>;

    /// `Ok(None)` when the object no longer exists
    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<Attributes>>;

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        delta: &AttributeDelta,
    ) -> ProviderResult<Attributes>;

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()>;

    /// Resolve a data lookup
    async fn read_data(&self, data_type: &str, _query: &Attributes) -> ProviderResult<Attributes> {
        Err(ProviderError::permanent(format!(
            "provider '{}' has no data source '{}'",
            self.name(),
            data_type
        )))
    }

    /// Attributes whose change forces replacement
    fn replacement_attributes(&self, resource_type: &str) -> BTreeSet<String> {
        self.schema(resource_type)
            .map(|s| {
                s.attributes
                    .into_iter()
                    .filter(|(_, a)| a.update == UpdateSemantics::ForcesReplacement)
                    .map(|(name, _)| name)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn update_semantics(&self, resource_type: &str, attribute: &str) -> UpdateSemantics {
        if self.replacement_attributes(resource_type).contains(attribute) {
            UpdateSemantics::ForcesReplacement
        } else {
            UpdateSemantics::InPlace
        }
    }

    fn collection_semantics(&self, resource_type: &str, attribute: &str) -> CollectionSemantics {
        self.schema(resource_type)
            .and_then(|s| s.attributes.get(attribute).map(|a| a.collection))
            .unwrap_or_default()
    }

    fn is_computed(&self, resource_type: &str, attribute: &str) -> bool {
        self.schema(resource_type)
            .and_then(|s| s.attributes.get(attribute).map(|a| a.computed))
            .unwrap_or(false)
    }

    fn schema_version(&self, resource_type: &str) -> u32 {
        self.schema(resource_type).map(|s| s.version).unwrap_or(0)
    }

    /// Per-operation timeout; `None` falls back to the engine default
    fn operation_timeout(&self, _resource_type: &str, _operation: Operation) -> Option<Duration> {
        None
    }
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying transient errors with exponential backoff.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = config.delay_for(attempt);
                tracing::debug!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying transient provider error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
