//! Concrete acquisition strategies.
//!
//! Ordered cheapest to most invasive: environment modules, a package manager,
//! and finally a static release downloaded into a scratch directory.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::Strategy;
use crate::env::LaunchEnv;
use crate::error::StrategyError;

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_READ_TIMEOUT: Duration = Duration::from_secs(300);
const FAILURE_EXCERPT_LINES: usize = 5;

/// Declarative form of a strategy, as written in `.runwarden/config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StrategySpec {
    /// `module load <module>` through environment modules.
    ModuleLoad {
        #[serde(default)]
        name: Option<String>,
        module: String,
    },
    /// `conda install -y [-c channel] packages...`
    CondaInstall {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        channel: Option<String>,
        packages: Vec<String>,
    },
    /// `<python> -m pip install packages...`
    PipInstall {
        #[serde(default)]
        name: Option<String>,
        packages: Vec<String>,
    },
    /// Any installer command.
    Command {
        #[serde(default)]
        name: Option<String>,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Download and unpack a static release, then put `binary` on the search path.
    StaticDownload {
        #[serde(default)]
        name: Option<String>,
        url: String,
        binary: String,
        #[serde(default)]
        sha256: Option<String>,
    },
}

impl StrategySpec {
    pub fn name(&self) -> &str {
        let (explicit, kind) = match self {
            Self::ModuleLoad { name, .. } => (name, "module-load"),
            Self::CondaInstall { name, .. } => (name, "conda-install"),
            Self::PipInstall { name, .. } => (name, "pip-install"),
            Self::Command { name, .. } => (name, "command"),
            Self::StaticDownload { name, .. } => (name, "static-download"),
        };
        explicit.as_deref().unwrap_or(kind)
    }

    /// Build the runnable strategy. `python` is the job interpreter.
    pub fn build(&self, python: &str) -> Box<dyn Strategy> {
        let name = self.name().to_string();
        match self {
            Self::ModuleLoad { module, .. } => Box::new(ModuleLoad {
                name,
                module: module.clone(),
            }),
            Self::CondaInstall {
                channel, packages, ..
            } => {
                let mut args = vec!["install".to_string(), "-y".to_string()];
                if let Some(channel) = channel {
                    args.push("-c".to_string());
                    args.push(channel.clone());
                }
                args.extend(packages.iter().cloned());
                Box::new(InstallCommand {
                    name,
                    program: "conda".to_string(),
                    args,
                })
            }
            Self::PipInstall { packages, .. } => {
                let mut args = vec!["-m".to_string(), "pip".to_string(), "install".to_string()];
                args.extend(packages.iter().cloned());
                Box::new(InstallCommand {
                    name,
                    program: python.to_string(),
                    args,
                })
            }
            Self::Command { program, args, .. } => Box::new(InstallCommand {
                name,
                program: program.clone(),
                args: args.clone(),
            }),
            Self::StaticDownload {
                url,
                binary,
                sha256,
                ..
            } => Box::new(StaticDownload {
                name,
                url: url.clone(),
                binary: binary.clone(),
                sha256: sha256.clone(),
            }),
        }
    }
}

fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Run a command to completion with captured output.
fn run_captured(
    mut cmd: Command,
    command_line: &str,
    env: &LaunchEnv,
) -> Result<String, StrategyError> {
    env.apply(&mut cmd);
    debug!(command = %command_line, "running acquisition command");
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| StrategyError::Spawn {
            command: command_line.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let excerpt = last_lines(&stderr, FAILURE_EXCERPT_LINES);
        if !excerpt.is_empty() {
            warn!(command = %command_line, "{excerpt}");
        }
        return Err(StrategyError::CommandFailed {
            command: command_line.to_string(),
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Loads an environment module in a login shell and adopts the `PATH`
/// entries it adds.
#[derive(Debug)]
pub struct ModuleLoad {
    name: String,
    module: String,
}

const MODULE_LOAD_SCRIPT: &str = r#"module load "$1" >&2 && printf '%s' "$PATH""#;

impl Strategy for ModuleLoad {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self, env: &mut LaunchEnv) -> Result<(), StrategyError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-lc")
            .arg(MODULE_LOAD_SCRIPT)
            .arg("bash")
            .arg(&self.module);
        let command_line = format!("module load {}", self.module);
        let loaded_path = run_captured(cmd, &command_line, env)?;

        let before = env.search_path();
        let known: Vec<PathBuf> = std::env::split_paths(&before).collect();
        let added: Vec<PathBuf> = std::env::split_paths(loaded_path.trim())
            .filter(|dir| !dir.as_os_str().is_empty() && !known.contains(dir))
            .collect();
        if added.is_empty() {
            debug!(module = %self.module, "module load added no search path entries");
        }
        for dir in added.into_iter().rev() {
            env.prepend_path(dir);
        }
        Ok(())
    }
}

/// Runs an installer (`conda`, `pip`, or anything configured).
#[derive(Debug)]
pub struct InstallCommand {
    name: String,
    program: String,
    args: Vec<String>,
}

impl Strategy for InstallCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self, env: &mut LaunchEnv) -> Result<(), StrategyError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let command_line = display_command(&self.program, &self.args);
        run_captured(cmd, &command_line, env).map(|_| ())
    }
}

/// Fetches a release archive into a scratch directory that lives for the rest
/// of the run.
#[derive(Debug)]
pub struct StaticDownload {
    name: String,
    url: String,
    binary: String,
    sha256: Option<String>,
}

impl Strategy for StaticDownload {
    fn name(&self) -> &str {
        &self.name
    }

    fn acquire(&self, env: &mut LaunchEnv) -> Result<(), StrategyError> {
        let scratch = tempfile::Builder::new()
            .prefix("runwarden-")
            .tempdir()
            .map_err(|e| StrategyError::Other(format!("failed to create scratch directory: {e}")))?;

        let file_name = archive_file_name(&self.url);
        let archive = scratch.path().join(&file_name);
        info!(url = %self.url, dest = %archive.display(), "downloading static release");
        let digest = download(&self.url, &archive)?;

        if let Some(expected) = &self.sha256 {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(StrategyError::ChecksumMismatch {
                    url: self.url.clone(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        let unpacked = scratch.path().join("unpacked");
        unpack(&archive, &unpacked)?;
        let found = find_binary(&unpacked, &self.binary)?;
        let bin_dir = found
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| unpacked.clone());

        info!(binary = %found.display(), "static release unpacked");
        env.prepend_path(bin_dir);
        env.hold(scratch);
        Ok(())
    }
}

fn archive_file_name(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("release.tar")
        .to_string()
}

/// Stream `url` into `dest`, returning the hex SHA-256 of what was written.
fn download(url: &str, dest: &Path) -> Result<String, StrategyError> {
    let network = |detail: String| StrategyError::NetworkAcquisitionFailure {
        url: url.to_string(),
        detail,
    };

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(DOWNLOAD_CONNECT_TIMEOUT)
        .timeout_read(DOWNLOAD_READ_TIMEOUT)
        .build();
    let response = agent.get(url).call().map_err(|e| network(e.to_string()))?;

    let mut reader = response.into_reader();
    let mut file = File::create(dest)
        .map_err(|e| StrategyError::Other(format!("failed to create {}: {e}", dest.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| network(e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .map_err(|e| StrategyError::Other(format!("failed to write {}: {e}", dest.display())))?;
        total += n as u64;
    }
    file.flush()
        .map_err(|e| StrategyError::Other(format!("failed to write {}: {e}", dest.display())))?;
    debug!(bytes = total, "download complete");

    Ok(format!("{:x}", hasher.finalize()))
}

/// Unpack a tar archive. Gzip and plain tar are handled in-process; other
/// compressions go through the system `tar`.
pub fn unpack(archive: &Path, dest: &Path) -> Result<(), StrategyError> {
    let unpack_err = |detail: String| StrategyError::Unpack {
        archive: archive.to_path_buf(),
        detail,
    };
    fs::create_dir_all(dest).map_err(|e| unpack_err(e.to_string()))?;

    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = File::open(archive).map_err(|e| unpack_err(e.to_string()))?;
        tar::Archive::new(flate2::read::GzDecoder::new(file))
            .unpack(dest)
            .map_err(|e| unpack_err(e.to_string()))
    } else if name.ends_with(".tar") {
        let file = File::open(archive).map_err(|e| unpack_err(e.to_string()))?;
        tar::Archive::new(file)
            .unpack(dest)
            .map_err(|e| unpack_err(e.to_string()))
    } else {
        let status = Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| unpack_err(format!("failed to run tar: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(unpack_err(format!("tar exited with {status}")))
        }
    }
}

/// Shallowest file named `binary` under `root`.
pub fn find_binary(root: &Path, binary: &str) -> Result<PathBuf, StrategyError> {
    walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == std::ffi::OsStr::new(binary))
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
        .ok_or_else(|| StrategyError::BinaryNotFound {
            binary: binary.to_string(),
            root: root.to_path_buf(),
        })
}
