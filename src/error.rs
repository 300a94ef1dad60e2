//! Error taxonomy.
//!
//! `Error` covers the conditions that abort a job before or around the
//! supervised run. `StrategyError` covers a single acquisition attempt; it is
//! recorded against the attempt and never aborts the fallback chain on its own.

use std::path::PathBuf;
use std::process::ExitStatus;

use crate::provision::Attempt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required capability exhausted its fallback chain.
    #[error("required capability `{capability}` is unavailable; {}", format_attempts(.attempts))]
    CapabilityUnsatisfiable {
        capability: String,
        attempts: Vec<Attempt>,
    },

    /// The pipeline entry point does not exist.
    #[error("pipeline entry point not found: {}", .path.display())]
    EntryPointMissing { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// Download of a release archive failed.
    #[error("download of {url} failed: {detail}")]
    NetworkAcquisitionFailure { url: String, detail: String },

    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: ExitStatus },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unpack {}: {detail}", .archive.display())]
    Unpack { archive: PathBuf, detail: String },

    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("`{binary}` not found under {}", .root.display())]
    BinaryNotFound { binary: String, root: PathBuf },

    #[error("{0}")]
    Other(String),
}

fn format_attempts(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no acquisition strategy is configured".to_string();
    }
    let listed = attempts
        .iter()
        .enumerate()
        .map(|(i, a)| format!("{}. {}: {}", i + 1, a.strategy, a.reason))
        .collect::<Vec<_>>()
        .join("; ");
    format!("attempted: {listed}")
}
