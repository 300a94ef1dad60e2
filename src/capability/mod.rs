//! Capability probing.
//!
//! A capability is a named runtime requirement: an importable Python module
//! (optionally one symbol in it), a Python check expression, or an executable
//! on the launch search path. Probing never installs, never touches the
//! network, and never fails: anything that goes wrong reads as "absent".

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::env::LaunchEnv;
use crate::provision::strategy::StrategySpec;
use crate::supervisor;

/// Default bound on a single probe subprocess.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long to wait for a finished probe's output to close.
const PROBE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Imports `argv[1]`, resolves `argv[2]` on it when given, prints `__version__`.
const PYTHON_MODULE_PROBE: &str = r#"
import importlib, sys
m = importlib.import_module(sys.argv[1])
if len(sys.argv) > 2 and sys.argv[2]:
    getattr(m, sys.argv[2])
print(getattr(m, "__version__", ""))
"#;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bversion\s+v?(\d[^\s,]*)").unwrap());

/// How to tell whether a capability is already usable.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Probe {
    /// `import module` succeeds (and `module.attr` resolves, when given).
    PythonModule {
        module: String,
        #[serde(default)]
        attr: Option<String>,
    },
    /// The Python snippet exits 0.
    PythonCheck { code: String },
    /// `program` resolves on the search path and `program version_args` exits 0.
    Executable {
        program: String,
        #[serde(default = "default_version_args")]
        version_args: Vec<String>,
    },
}

fn default_version_args() -> Vec<String> {
    vec!["-version".to_string()]
}

impl Probe {
    /// Executable name the probe looks for, if any.
    pub fn binary(&self) -> Option<&str> {
        match self {
            Probe::Executable { program, .. } => Some(program),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Probe::PythonModule { module, attr: None } => format!("import {module}"),
            Probe::PythonModule {
                module,
                attr: Some(attr),
            } => format!("from {module} import {attr}"),
            Probe::PythonCheck { code } => format!("python: {code}"),
            Probe::Executable { program, .. } => format!("executable {program}"),
        }
    }
}

/// A declared runtime requirement and the ordered ways to acquire it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Capability {
    pub name: String,
    #[serde(default = "default_required")]
    pub required: bool,
    pub probe: Probe,
    #[serde(default, rename = "strategy")]
    pub strategies: Vec<StrategySpec>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    pub present: bool,
    pub version: Option<String>,
}

impl ProbeReport {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present(version: Option<String>) -> Self {
        Self {
            present: true,
            version: version.filter(|v| !v.is_empty()),
        }
    }
}

/// Checks capabilities against the current launch environment.
pub trait Prober {
    fn probe(&self, probe: &Probe, env: &LaunchEnv) -> ProbeReport;

    fn is_present(&self, probe: &Probe, env: &LaunchEnv) -> bool {
        self.probe(probe, env).present
    }
}

/// Probes the real system by running short-lived subprocesses.
#[derive(Debug, Clone)]
pub struct SystemProber {
    python: String,
    timeout: Duration,
}

impl SystemProber {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bound each probe subprocess; one that overruns reads as absent.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, mut cmd: Command, env: &LaunchEnv) -> Option<String> {
        env.apply(&mut cmd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        supervisor::own_process_group(&mut cmd);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!(command = ?cmd, "probe command could not start: {e}");
                return None;
            }
        };
        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let status = match supervisor::wait_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(
                    command = ?cmd,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "probe did not finish in time; treating as absent"
                );
                let _ = supervisor::kill_group(&mut child);
                return None;
            }
            Err(e) => {
                debug!(command = ?cmd, "failed to wait for probe: {e}");
                let _ = supervisor::kill_group(&mut child);
                return None;
            }
        };
        let stdout = stdout.recv_timeout(PROBE_DRAIN_TIMEOUT).unwrap_or_default();
        let stderr = stderr.recv_timeout(PROBE_DRAIN_TIMEOUT).unwrap_or_default();

        if status.success() {
            let mut text = String::from_utf8_lossy(&stdout).into_owned();
            if text.trim().is_empty() {
                text = String::from_utf8_lossy(&stderr).into_owned();
            }
            Some(text)
        } else {
            debug!(
                command = ?cmd,
                status = %status,
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "probe command failed"
            );
            None
        }
    }
}

/// Read a child stream to the end on a helper thread.
fn capture<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut stream) = stream {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

impl Prober for SystemProber {
    fn probe(&self, probe: &Probe, env: &LaunchEnv) -> ProbeReport {
        match probe {
            Probe::PythonModule { module, attr } => {
                let mut cmd = Command::new(&self.python);
                cmd.arg("-c").arg(PYTHON_MODULE_PROBE).arg(module);
                if let Some(attr) = attr {
                    cmd.arg(attr);
                }
                match self.run(cmd, env) {
                    Some(out) => ProbeReport::present(Some(out.trim().to_string())),
                    None => ProbeReport::absent(),
                }
            }
            Probe::PythonCheck { code } => {
                let mut cmd = Command::new(&self.python);
                cmd.arg("-c").arg(code);
                match self.run(cmd, env) {
                    Some(_) => ProbeReport::present(None),
                    None => ProbeReport::absent(),
                }
            }
            Probe::Executable {
                program,
                version_args,
            } => {
                let Some(resolved) = env.resolve(program) else {
                    debug!(program = %program, "executable not on search path");
                    return ProbeReport::absent();
                };
                let mut cmd = Command::new(&resolved);
                cmd.args(version_args);
                match self.run(cmd, env) {
                    Some(out) => ProbeReport::present(parse_version(&out)),
                    None => ProbeReport::absent(),
                }
            }
        }
    }
}

/// Extract a version from the first line of `--version` style output.
pub fn parse_version(output: &str) -> Option<String> {
    let first = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    if let Some(caps) = VERSION_RE.captures(first) {
        return Some(caps[1].to_string());
    }
    first
        .split_whitespace()
        .map(|t| t.trim_start_matches('v'))
        .find(|t| t.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_from_ffmpeg_banner() {
        let out = "ffmpeg version 6.0-static https://johnvansickle.com/ffmpeg/  Copyright (c) 2000-2023\nbuilt with gcc 8";
        assert_eq!(parse_version(out).as_deref(), Some("6.0-static"));
    }

    #[test]
    fn parse_version_from_bare_token() {
        assert_eq!(parse_version("conda 23.11.0\n").as_deref(), Some("23.11.0"));
        assert_eq!(parse_version("\n  node v20.1.0").as_deref(), Some("20.1.0"));
        assert_eq!(parse_version("no digits here"), None);
        assert_eq!(parse_version(""), None);
    }

    #[test]
    fn describe_probes() {
        let p = Probe::PythonModule {
            module: "diffusers".to_string(),
            attr: Some("StableVideoDiffusionPipeline".to_string()),
        };
        assert_eq!(p.describe(), "from diffusers import StableVideoDiffusionPipeline");
        let p = Probe::Executable {
            program: "ffmpeg".to_string(),
            version_args: default_version_args(),
        };
        assert_eq!(p.binary(), Some("ffmpeg"));
    }

    #[test]
    fn empty_version_is_dropped() {
        assert_eq!(ProbeReport::present(Some(String::new())).version, None);
    }

    #[test]
    fn missing_executable_is_absent() {
        let prober = SystemProber::new("python3");
        let probe = Probe::Executable {
            program: "definitely-missing-runwarden-test-binary".to_string(),
            version_args: vec![],
        };
        assert!(!prober.is_present(&probe, &LaunchEnv::new()));
    }

    #[cfg(unix)]
    #[test]
    fn executable_present_when_runnable() {
        let prober = SystemProber::new("python3");
        let probe = Probe::Executable {
            program: "sh".to_string(),
            version_args: vec!["-c".to_string(), "echo 'sh version 5.1'".to_string()],
        };
        let report = prober.probe(&probe, &LaunchEnv::new());
        assert!(report.present);
        assert_eq!(report.version.as_deref(), Some("5.1"));
    }

    #[cfg(unix)]
    #[test]
    fn executable_absent_when_version_check_fails() {
        let prober = SystemProber::new("python3");
        let probe = Probe::Executable {
            program: "sh".to_string(),
            version_args: vec!["-c".to_string(), "exit 3".to_string()],
        };
        assert!(!prober.is_present(&probe, &LaunchEnv::new()));
    }

    #[test]
    fn missing_interpreter_reads_as_absent() {
        let prober = SystemProber::new("definitely-missing-python-interpreter");
        let probe = Probe::PythonModule {
            module: "os".to_string(),
            attr: None,
        };
        assert_eq!(prober.probe(&probe, &LaunchEnv::new()), ProbeReport::absent());
    }

    #[cfg(unix)]
    #[test]
    fn hanging_probe_times_out_as_absent() {
        let prober = SystemProber::new("python3").with_timeout(Duration::from_millis(300));
        let probe = Probe::Executable {
            program: "sh".to_string(),
            version_args: vec!["-c".to_string(), "sleep 30 & wait".to_string()],
        };
        let started = std::time::Instant::now();
        assert_eq!(prober.probe(&probe, &LaunchEnv::new()), ProbeReport::absent());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
