use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_stack_kdl(&self, content: &str) {
        fs::write(self.root.path().join("stack.kdl"), content).unwrap();
    }

    #[allow(dead_code)]
    pub fn write_settings(&self, content: &str) {
        let dir = self.root.path().join(".stackflow");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("settings.yaml"), content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    #[allow(dead_code)]
    pub fn file(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    #[allow(dead_code)]
    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.file(relative)).unwrap()
    }

    /// `stackflow` running inside the project, isolated from the caller's
    /// environment.
    #[allow(deprecated)]
    pub fn cmd(&self) -> Command {
        command_in(self.root.path())
    }
}

#[allow(deprecated)]
pub fn command_in(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stackflow").unwrap();
    cmd.current_dir(dir)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .env_remove("STACKFLOW_CONFIG_PATH")
        .env_remove("STACKFLOW_PROJECT_ROOT")
        .env_remove("STACKFLOW_PARALLELISM")
        .env_remove("STACKFLOW_LOCK_WAIT")
        .env_remove("STACKFLOW_STATE_DIR");
    cmd
}

#[allow(dead_code)]
pub const SITE: &str = r#"
project "site"

variables {
    title "Hello"
}

resource "local_directory" "public" {
    path "public"
}

resource "local_file" "index" {
    path "${local_directory.public.path}/index.html"
    content "<h1>${var.title}</h1>"
}

resource "local_file" "page" {
    count 2
    path "${local_directory.public.path}/page-${count.index}.html"
    content "page ${count.index}"
}

output "index_path" {
    value "${local_file.index.path}"
}
"#;
