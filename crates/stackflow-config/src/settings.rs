//! Engine settings
//!
//! Layers, lowest first: built-in defaults, the global
//! `~/.config/stackflow/settings.yaml`, the project `.stackflow/settings.yaml`,
//! then `STACKFLOW_*` environment variables. CLI flags are applied by the caller.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const SETTINGS_FILE: &str = "settings.yaml";
pub const ENV_PARALLELISM: &str = "STACKFLOW_PARALLELISM";
pub const ENV_LOCK_WAIT: &str = "STACKFLOW_LOCK_WAIT";
pub const ENV_STATE_DIR: &str = "STACKFLOW_STATE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum concurrent provider operations
    pub parallelism: usize,

    /// How long to wait for a busy lock; 0 fails fast
    pub lock_wait_secs: u64,

    /// Age past which a held lock is reported as possibly stale
    pub stale_lock_after_secs: u64,

    /// Default timeout for provider operations that declare none
    pub operation_timeout_secs: Option<u64>,

    /// State directory, relative to the project root unless absolute
    pub state_dir: PathBuf,

    /// Commit state after every completed step
    pub checkpoint: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: 10,
            lock_wait_secs: 0,
            stale_lock_after_secs: 3600,
            operation_timeout_secs: None,
            state_dir: PathBuf::from(".stackflow"),
            checkpoint: true,
        }
    }
}

/// One settings file. Absent keys leave the lower layer untouched.
#[derive(Debug, Clone, Default, Deserialize)]
struct SettingsLayer {
    parallelism: Option<usize>,
    lock_wait_secs: Option<u64>,
    stale_lock_after_secs: Option<u64>,
    operation_timeout_secs: Option<u64>,
    state_dir: Option<PathBuf>,
    checkpoint: Option<bool>,
}

/// `~/.config/stackflow/settings.yaml`
pub fn global_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stackflow").join(SETTINGS_FILE))
}

impl Settings {
    /// Load all layers for the project at `project_root`.
    pub fn load(project_root: &Path) -> Result<Self> {
        Self::load_layers(global_settings_path().as_deref(), project_root)
    }

    /// Load with an explicit global settings path.
    pub fn load_layers(global: Option<&Path>, project_root: &Path) -> Result<Self> {
        let mut settings = Settings::default();
        if let Some(global) = global {
            settings.merge_file(global)?;
        }
        settings.merge_file(&project_root.join(".stackflow").join(SETTINGS_FILE))?;
        settings.merge_env()?;
        debug!(?settings, "Loaded settings");
        Ok(settings)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(());
        }
        let layer: SettingsLayer =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::InvalidSettings {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "Merging settings file");
        self.merge(layer);
        Ok(())
    }

    fn merge(&mut self, layer: SettingsLayer) {
        if let Some(v) = layer.parallelism {
            self.parallelism = v;
        }
        if let Some(v) = layer.lock_wait_secs {
            self.lock_wait_secs = v;
        }
        if let Some(v) = layer.stale_lock_after_secs {
            self.stale_lock_after_secs = v;
        }
        if let Some(v) = layer.operation_timeout_secs {
            self.operation_timeout_secs = Some(v);
        }
        if let Some(v) = layer.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = layer.checkpoint {
            self.checkpoint = v;
        }
    }

    fn merge_env(&mut self) -> Result<()> {
        if let Some(v) = env_number::<usize>(ENV_PARALLELISM)? {
            self.parallelism = v;
        }
        if let Some(v) = env_number::<u64>(ENV_LOCK_WAIT)? {
            self.lock_wait_secs = v;
        }
        if let Ok(dir) = std::env::var(ENV_STATE_DIR)
            && !dir.is_empty()
        {
            self.state_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Parallelism is at least one.
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_after_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    /// Absolute state directory for a project
    pub fn state_path(&self, project_root: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            project_root.join(&self.state_dir)
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        _ => Ok(None),
    }
}
