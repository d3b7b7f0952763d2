//! State store
//!
//! The state file is the record of which resource instances are believed to
//! exist and what the provider last reported about them. Writes are guarded by
//! an explicit [`Lock`] and by optimistic concurrency on `serial`.

use crate::error::{EngineError, Result};
use crate::resource::{Attributes, InstanceAddress, InstanceKey, ResourceId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The only state layout this build reads or writes
pub const FORMAT_VERSION: u32 = 1;

/// Persisted state document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    pub format_version: u32,

    /// Fixed at creation for the life of the file
    pub lineage: String,

    /// Incremented by every successful commit
    pub serial: u64,

    pub resources: Vec<StateRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFile {
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            lineage: uuid::Uuid::new_v4().to_string(),
            serial: 0,
            resources: Vec::new(),
        }
    }

    /// Current (non-deposed) record of an instance
    pub fn get(&self, address: &InstanceAddress) -> Option<&StateRecord> {
        self.resources
            .iter()
            .find(|r| r.deposed.is_none() && r.address() == *address)
    }

    pub fn get_mut(&mut self, address: &InstanceAddress) -> Option<&mut StateRecord> {
        self.resources
            .iter_mut()
            .find(|r| r.deposed.is_none() && r.address() == *address)
    }

    /// Record with an exact `(address, deposed)` identity
    pub fn find(&self, address: &InstanceAddress, deposed: Option<&str>) -> Option<&StateRecord> {
        self.resources
            .iter()
            .find(|r| r.deposed.as_deref() == deposed && r.address() == *address)
    }

    /// Insert or replace the record with the same address and deposed key.
    pub fn upsert(&mut self, record: StateRecord) {
        let address = record.address();
        match self
            .resources
            .iter_mut()
            .find(|r| r.deposed == record.deposed && r.address() == address)
        {
            Some(existing) => *existing = record,
            None => self.resources.push(record),
        }
        self.resources.sort_by(|a, b| {
            (a.address(), a.deposed.as_deref()).cmp(&(b.address(), b.deposed.as_deref()))
        });
    }

    pub fn remove(&mut self, address: &InstanceAddress, deposed: Option<&str>) -> Option<StateRecord> {
        let pos = self
            .resources
            .iter()
            .position(|r| r.deposed.as_deref() == deposed && r.address() == *address)?;
        Some(self.resources.remove(pos))
    }

    pub fn records(&self) -> impl Iterator<Item = &StateRecord> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Parse a state document, rejecting unknown format versions before
    /// looking at anything else.
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(content)?;
        let version = raw
            .get("formatVersion")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if version != u64::from(FORMAT_VERSION) {
            return Err(EngineError::UnsupportedFormatVersion(
                u32::try_from(version).unwrap_or(u32::MAX),
            ));
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Last-known attributes of one resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_key: Option<InstanceKey>,

    #[serde(default)]
    pub schema_version: u32,

    pub attributes: Attributes,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_private_data: Option<serde_json::Value>,

    /// Instances this record depended on when it was written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<InstanceAddress>,

    /// Set on an old object kept after a failed create-before-destroy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
}

impl StateRecord {
    pub fn new(address: &InstanceAddress, attributes: Attributes) -> Self {
        Self {
            resource_type: address.resource.resource_type.clone(),
            name: address.resource.name.clone(),
            instance_key: address.key.clone(),
            schema_version: 0,
            attributes,
            provider_private_data: None,
            dependencies: Vec::new(),
            deposed: None,
        }
    }

    pub fn address(&self) -> InstanceAddress {
        InstanceAddress::new(
            ResourceId::new(self.resource_type.clone(), self.name.clone()),
            self.instance_key.clone(),
        )
    }

    /// Provider-assigned id, stored as the `id` attribute
    pub fn id(&self) -> Option<&str> {
        self.attributes.get("id").and_then(|v| v.as_str())
    }
}

/// Id reported for a lock file that exists but cannot be parsed, as left by a
/// crash between creating and writing it. `force_unlock` accepts it.
pub const UNREADABLE_LOCK_ID: &str = "unreadable";

/// Lock holder metadata, persisted next to the state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub id: String,
    pub owner: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(owner: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            operation: operation.into(),
            acquired_at: Utc::now(),
        }
    }

    /// Placeholder for an unreadable lock file last written at `modified`
    pub fn unreadable(modified: DateTime<Utc>) -> Self {
        Self {
            id: UNREADABLE_LOCK_ID.to_string(),
            owner: "unknown".to_string(),
            operation: "unknown".to_string(),
            acquired_at: modified,
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_possibly_stale(&self, threshold: Duration) -> bool {
        self.age() >= threshold
    }
}

/// Proof of holding the state lock. Consumed by [`StateStore::release_lock`].
#[derive(Debug)]
pub struct Lock {
    info: LockInfo,
}

impl Lock {
    pub fn new(info: LockInfo) -> Self {
        Self { info }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

/// Lock owner identity: `user@host`
pub fn default_lock_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{} (pid {})", user, host, std::process::id())
}

/// Persistent, lockable state storage
#[async_trait]
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when no state has been written yet
    async fn load(&self) -> Result<Option<StateFile>>;

    /// Take the lock or fail fast with [`EngineError::LockBusy`].
    async fn acquire_lock(&self, owner: &str, operation: &str) -> Result<Lock>;

    async fn release_lock(&self, lock: Lock) -> Result<()>;

    /// Persist `state` atomically as serial `state.serial + 1`.
    ///
    /// Fails with [`EngineError::StaleState`] when the stored serial is not
    /// `state.serial`, i.e. someone committed since `state` was loaded.
    async fn commit(&self, lock: &Lock, state: &StateFile) -> Result<StateFile>;

    /// Current lock holder, if any
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Break a lock by id. Operator action only; never called automatically.
    async fn force_unlock(&self, lock_id: &str) -> Result<LockInfo>;
}

/// Check a commit against the stored document and produce the next one.
pub(crate) fn next_state(stored: Option<&StateFile>, state: &StateFile) -> Result<StateFile> {
    let found = stored.map(|s| s.serial).unwrap_or(0);
    if let Some(stored) = stored
        && stored.lineage != state.lineage
    {
        return Err(EngineError::LineageMismatch {
            expected: stored.lineage.clone(),
            found: state.lineage.clone(),
        });
    }
    if found != state.serial {
        return Err(EngineError::StaleState {
            expected: state.serial,
            found,
        });
    }
    let mut next = state.clone();
    next.format_version = FORMAT_VERSION;
    next.serial = state.serial + 1;
    Ok(next)
}

/// How long to wait for a busy lock
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    /// Zero fails fast
    pub wait: Duration,
    pub poll_interval: Duration,
    /// Age past which a held lock is reported as possibly stale
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::ZERO,
            poll_interval: Duration::from_millis(500),
            stale_after: Duration::from_secs(3600),
        }
    }
}

/// Acquire the lock, polling for up to `policy.wait`. A stale-looking lock is
/// reported, never broken.
pub async fn acquire_lock_with_policy(
    store: &dyn StateStore,
    owner: &str,
    operation: &str,
    policy: &LockPolicy,
) -> Result<Lock> {
    let deadline = tokio::time::Instant::now() + policy.wait;
    loop {
        match store.acquire_lock(owner, operation).await {
            Ok(lock) => {
                tracing::debug!(lock_id = %lock.id(), operation, "Acquired state lock");
                return Ok(lock);
            }
            Err(EngineError::LockBusy { info, .. }) => {
                let possibly_stale = info.is_possibly_stale(policy.stale_after);
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    if possibly_stale {
                        tracing::warn!(
                            lock_id = %info.id,
                            owner = %info.owner,
                            age_secs = info.age().as_secs(),
                            "State lock looks stale"
                        );
                    }
                    return Err(EngineError::LockBusy {
                        info,
                        possibly_stale,
                    });
                }
                tracing::debug!(owner = %info.owner, "State is locked, waiting");
                tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
