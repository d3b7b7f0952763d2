//! In-memory state store, for tests and dry runs

use crate::error::{EngineError, Result};
use crate::state::{Lock, LockInfo, StateFile, StateStore, next_state};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    state: Option<StateFile>,
    lock: Option<LockInfo>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    commits: AtomicUsize,
    fail_commits: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StateFile) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: Some(state),
                lock: None,
            }),
            ..Self::default()
        }
    }

    /// Number of successful commits so far
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make every following commit fail with an I/O error
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Option<StateFile> {
        self.inner.lock().await.state.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateFile>> {
        Ok(self.inner.lock().await.state.clone())
    }

    async fn acquire_lock(&self, owner: &str, operation: &str) -> Result<Lock> {
        let mut inner = self.inner.lock().await;
        if let Some(holder) = &inner.lock {
            return Err(EngineError::LockBusy {
                info: holder.clone(),
                possibly_stale: false,
            });
        }
        let info = LockInfo::new(owner, operation);
        inner.lock = Some(info.clone());
        Ok(Lock::new(info))
    }

    async fn release_lock(&self, lock: Lock) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match &inner.lock {
            Some(holder) if holder.id == lock.id() => {
                inner.lock = None;
                Ok(())
            }
            _ => Err(EngineError::LockNotHeld(lock.id().to_string())),
        }
    }

    async fn commit(&self, lock: &Lock, state: &StateFile) -> Result<StateFile> {
        let mut inner = self.inner.lock().await;
        if inner.lock.as_ref().map(|l| l.id.as_str()) != Some(lock.id()) {
            return Err(EngineError::LockNotHeld(lock.id().to_string()));
        }
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::other(
                "state backend unavailable",
            )));
        }
        let next = next_state(inner.state.as_ref(), state)?;
        inner.state = Some(next.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.inner.lock().await.lock.clone())
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut inner = self.inner.lock().await;
        match inner.lock.take() {
            Some(holder) if holder.id == lock_id => Ok(holder),
            other => {
                inner.lock = other;
                Err(EngineError::LockNotFound(lock_id.to_string()))
            }
        }
    }
}
