//! Project root discovery
//!
//! A project root is a directory holding `stack.kdl` or `.stackflow/stack.kdl`.

use crate::error::{Result, StackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STACK_FILE: &str = "stack.kdl";
const STACK_DIR: &str = ".stackflow";

fn is_project_root(dir: &Path) -> bool {
    dir.join(STACK_FILE).exists() || dir.join(STACK_DIR).join(STACK_FILE).exists()
}

/// Locate the project root.
///
/// Search order:
/// 1. `STACKFLOW_PROJECT_ROOT`, when it points at a project root
/// 2. the current directory and its ancestors
#[tracing::instrument]
pub fn find_project_root() -> Result<PathBuf> {
    if let Ok(root) = std::env::var("STACKFLOW_PROJECT_ROOT") {
        let path = PathBuf::from(&root);
        debug!(env_root = %root, "Checking STACKFLOW_PROJECT_ROOT");
        if is_project_root(&path) {
            info!(project_root = %path.display(), "Found project root from environment variable");
            return Ok(path);
        }
        warn!(env_root = %root, "STACKFLOW_PROJECT_ROOT has no stack.kdl, ignoring");
    }

    find_project_root_from(&std::env::current_dir()?)
}

/// Walk up from `start` until a project root is found.
pub fn find_project_root_from(start: &Path) -> Result<PathBuf> {
    let mut current = start.to_path_buf();
    debug!(start_dir = %start.display(), "Searching for project root");

    loop {
        if is_project_root(&current) {
            info!(project_root = %current.display(), "Found project root");
            return Ok(current);
        }
        if !current.pop() {
            break;
        }
    }

    warn!(start_dir = %start.display(), "Project root not found");
    Err(StackError::ProjectRootNotFound(start.to_path_buf()))
}

/// The project root a stack file belongs to: its directory, or the
/// directory above when the file lives in `.stackflow/`.
pub fn project_root_for(stack_file: &Path) -> PathBuf {
    let parent = stack_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if parent.file_name().is_some_and(|n| n == STACK_DIR) {
        parent
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf()
    } else {
        parent.to_path_buf()
    }
}
