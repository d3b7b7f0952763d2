//! Project loading and engine wiring

use anyhow::{Context, bail};
use serde_json::Value;
use stackflow_config::{ConfigError, Settings};
use stackflow_core::{Stack, Variables};
use stackflow_engine::{
    Engine, EngineOptions, ExecuteOptions, LocalStateStore, LockPolicy, default_lock_owner,
};
use stackflow_provider_local::LocalProvider;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A located project: its root, stack file and effective settings.
pub struct Project {
    pub root: PathBuf,
    pub stack_file: PathBuf,
    pub settings: Settings,
}

impl Project {
    /// Locate the project. An explicit `--file` wins over discovery.
    pub fn locate(file: Option<&Path>) -> anyhow::Result<Self> {
        let stack_file = match file {
            Some(file) => {
                if !file.is_file() {
                    bail!("Stack file not found: {}", file.display());
                }
                file.to_path_buf()
            }
            None => match stackflow_config::find_stack_file() {
                Ok(path) => path,
                Err(ConfigError::StackFileNotFound) => {
                    let root = stackflow_core::find_project_root()?;
                    stackflow_config::find_stack_file_in(&root)?
                }
                Err(e) => return Err(e.into()),
            },
        };

        let root = stackflow_core::project_root_for(&stack_file);
        let settings = Settings::load(&root)
            .with_context(|| format!("Failed to load settings for {}", root.display()))?;
        tracing::debug!(
            root = %root.display(),
            stack_file = %stack_file.display(),
            "Located project"
        );
        Ok(Self {
            root,
            stack_file,
            settings,
        })
    }

    /// Parse the stack file with `--var` overrides applied.
    pub fn stack(&self, vars: &[String]) -> anyhow::Result<Stack> {
        let overrides = parse_vars(vars)?;
        let stack = stackflow_core::parse_stack_file(&self.stack_file, &overrides)
            .with_context(|| format!("Failed to parse {}", self.stack_file.display()))?;
        Ok(stack)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.settings.state_path(&self.root)
    }

    /// Engine over the project's state directory and the local provider.
    /// `parallelism` overrides the settings value.
    pub fn engine(&self, parallelism: Option<usize>) -> Engine {
        let state_dir = self.state_dir();
        let store = Arc::new(LocalStateStore::new(&state_dir));
        let provider =
            Arc::new(LocalProvider::new(&self.root).with_registry_dir(state_dir.join("objects")));

        let options = EngineOptions {
            owner: default_lock_owner(),
            lock: LockPolicy {
                wait: self.settings.lock_wait(),
                stale_after: self.settings.stale_lock_after(),
                ..LockPolicy::default()
            },
            execute: ExecuteOptions {
                parallelism: parallelism.unwrap_or(self.settings.parallelism).max(1),
                default_timeout: self.settings.operation_timeout(),
                checkpoint: self.settings.checkpoint,
            },
        };
        Engine::new(store, provider, options)
    }
}

/// `KEY=VALUE` pairs. Values that parse as JSON keep their type; anything
/// else is a string.
pub fn parse_vars(vars: &[String]) -> anyhow::Result<Variables> {
    let mut parsed = Variables::new();
    for var in vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("Invalid --var '{}': expected KEY=VALUE", var);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid --var '{}': empty key", var);
        }
        let value = serde_json::from_str::<Value>(value)
            .ok()
            .filter(|v| !v.is_object() && !v.is_array())
            .unwrap_or_else(|| Value::String(value.to_string()));
        parsed.insert(key.to_string(), value);
    }
    Ok(parsed)
}
