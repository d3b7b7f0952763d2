//! File-backed state store
//!
//! Layout under the state directory (`.stackflow/` by default):
//!
//! - `state.json`: current state
//! - `state.json.backup`: previous state
//! - `lock.json`: lock holder, created with exclusive-create semantics

use crate::error::{EngineError, Result};
use crate::state::{Lock, LockInfo, StateFile, StateStore, next_state};
use chrono::{DateTime, Utc};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TMP: &str = "state.json.tmp";
const LOCK_FILE: &str = "lock.json";

/// State store rooted at a local directory
pub struct LocalStateStore {
    state_dir: PathBuf,
}

impl LocalStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Get the state file path
    pub fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir.join(STATE_BACKUP)
    }

    fn tmp_path(&self) -> PathBuf {
        self.state_dir.join(STATE_TMP)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    /// Ensure the state directory exists
    async fn ensure_state_dir(&self) -> Result<()> {
        if !fs::try_exists(&self.state_dir).await? {
            fs::create_dir_all(&self.state_dir).await?;
            tracing::debug!("Created state directory: {}", self.state_dir.display());
        }
        Ok(())
    }

    /// Current lock holder. An empty or truncated lock file reads as
    /// [`LockInfo::unreadable`], aged by the file's modification time.
    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let path = self.lock_path();
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                let modified = match fs::metadata(&path).await {
                    Ok(metadata) => metadata.modified()?,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                tracing::warn!(error = %e, path = %path.display(), "Lock file is unreadable");
                Ok(Some(LockInfo::unreadable(DateTime::<Utc>::from(modified))))
            }
        }
    }

    async fn check_holder(&self, lock: &Lock) -> Result<()> {
        match self.read_lock().await? {
            Some(info) if info.id == lock.id() => Ok(()),
            _ => Err(EngineError::LockNotHeld(lock.id().to_string())),
        }
    }

    /// Write to a temp file, fsync, then rename over the state file so a
    /// reader sees either the old or the new document.
    async fn write_atomic(&self, content: &str) -> Result<()> {
        let path = self.state_path();
        let tmp = self.tmp_path();

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if fs::try_exists(&path).await? {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<StateFile>> {
        let content = match fs::read_to_string(self.state_path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("State file not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let state = StateFile::from_json(&content)?;
        tracing::debug!(
            serial = state.serial,
            resources = state.len(),
            "Loaded state"
        );
        Ok(Some(state))
    }

    async fn acquire_lock(&self, owner: &str, operation: &str) -> Result<Lock> {
        self.ensure_state_dir().await?;

        let info = LockInfo::new(owner, operation);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = match self.read_lock().await {
                    Ok(Some(holder)) => holder,
                    // Released in between, or the read failed
                    _ => LockInfo::unreadable(Utc::now()),
                };
                return Err(EngineError::LockBusy {
                    info: holder,
                    possibly_stale: false,
                });
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())
            .await?;
        file.sync_all().await?;
        Ok(Lock::new(info))
    }

    async fn release_lock(&self, lock: Lock) -> Result<()> {
        self.check_holder(&lock).await?;
        fs::remove_file(self.lock_path()).await?;
        tracing::debug!(lock_id = %lock.id(), "Released state lock");
        Ok(())
    }

    async fn commit(&self, lock: &Lock, state: &StateFile) -> Result<StateFile> {
        self.check_holder(lock).await?;
        let stored = self.load().await?;
        let next = next_state(stored.as_ref(), state)?;

        self.ensure_state_dir().await?;
        self.write_atomic(&next.to_json_pretty()?).await?;
        tracing::debug!(
            serial = next.serial,
            resources = next.len(),
            "Committed state"
        );
        Ok(next)
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock().await? {
            Some(info) if info.id == lock_id => {
                fs::remove_file(self.lock_path()).await?;
                tracing::warn!(lock_id, owner = %info.owner, "Force-released state lock");
                Ok(info)
            }
            _ => Err(EngineError::LockNotFound(lock_id.to_string())),
        }
    }
}
