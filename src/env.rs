//! Process-scoped launch environment.
//!
//! Provisioning may discover binaries outside the inherited `PATH` (a module
//! directory, an unpacked static release). Those directories are collected
//! here and applied to every subprocess the orchestrator starts. The
//! orchestrator's own environment is never mutated.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LaunchEnv {
    extra_path: Vec<PathBuf>,
    scratch: Vec<TempDir>,
}

impl LaunchEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `dir` to the search path. Later calls take precedence.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if self.extra_path.first() == Some(&dir) {
            return;
        }
        debug!(dir = %dir.display(), "prepending to launch search path");
        self.extra_path.retain(|d| d != &dir);
        self.extra_path.insert(0, dir);
    }

    /// Keep a temporary directory alive for the rest of the run.
    pub fn hold(&mut self, dir: TempDir) {
        self.scratch.push(dir);
    }

    pub fn extra_path(&self) -> &[PathBuf] {
        &self.extra_path
    }

    /// The `PATH` value subprocesses should see.
    pub fn search_path(&self) -> OsString {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .extra_path
            .iter()
            .cloned()
            .chain(std::env::split_paths(&inherited));
        std::env::join_paths(dirs).unwrap_or(inherited)
    }

    pub fn apply(&self, cmd: &mut Command) {
        if !self.extra_path.is_empty() {
            cmd.env("PATH", self.search_path());
        }
    }

    /// Resolve `program` the way `execvp` would, using the launch search path.
    pub fn resolve(&self, program: &str) -> Option<PathBuf> {
        if program.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(program);
            return is_executable(&path).then_some(path);
        }
        std::env::split_paths(&self.search_path())
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
