pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{Settings, global_settings_path};

use std::path::{Path, PathBuf};

const CANDIDATES: [&str; 2] = ["stack.local.kdl", "stack.kdl"];

/// Find the project's stack file from the current directory.
///
/// Search order:
/// 1. `STACKFLOW_CONFIG_PATH` (direct path)
/// 2. current directory: stack.local.kdl, stack.kdl
/// 3. ./.stackflow/: the same order
pub fn find_stack_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("STACKFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "STACKFLOW_CONFIG_PATH does not exist, searching");
    }

    find_stack_file_in(&std::env::current_dir()?)
}

/// Find the stack file inside `dir` or `dir/.stackflow`.
pub fn find_stack_file_in(dir: &Path) -> Result<PathBuf> {
    for base in [dir.to_path_buf(), dir.join(".stackflow")] {
        for filename in CANDIDATES {
            let path = base.join(filename);
            if path.is_file() {
                return Ok(path);
            }
        }
    }
    Err(ConfigError::StackFileNotFound)
}
