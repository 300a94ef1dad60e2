//! Deadline-bounded pipeline supervision.
//!
//! Spawns the pipeline in its own process group with stdin closed, routes its
//! stdout and stderr through one shared pipe so the log holds a single ordered
//! interleaving, copies that stream to the run log and the orchestrator's
//! stdout, and enforces the wall-clock deadline by terminating the whole
//! process group.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::env::LaunchEnv;
use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long to wait for the output stream to close once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a supervised run ended. Exactly one variant holds per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionDisposition {
    CompletedOk,
    TimedOut { elapsed: Duration },
    Failed { exit_code: i32 },
}

impl ExecutionDisposition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CompletedOk => "completed_ok",
            Self::TimedOut { .. } => "timed_out",
            Self::Failed { .. } => "failed",
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match exit_code(status) {
            0 => Self::CompletedOk,
            code => Self::Failed { exit_code: code },
        }
    }
}

/// Everything needed to launch the pipeline.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    /// Script handed to `program` as its first argument. Must exist.
    pub entry_point: Option<PathBuf>,
    pub args: Vec<String>,
    /// Appended after `args` so the pipeline never waits on a prompt.
    pub non_interactive_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: PathBuf,
    pub deadline: Duration,
    /// Time between SIGTERM and SIGKILL when the deadline passes.
    pub kill_grace: Duration,
    /// Mirror the pipeline output on our stdout.
    pub echo: bool,
}

impl LaunchSpec {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(entry) = &self.entry_point {
            argv.push(entry.display().to_string());
        }
        argv.extend(self.args.iter().cloned());
        argv.extend(self.non_interactive_args.iter().cloned());
        argv
    }

    /// Fails with `EntryPointMissing` unless the script (and a path-style
    /// program) exists under `work_dir`.
    pub fn check_entry_point(&self) -> Result<(), Error> {
        if let Some(entry) = &self.entry_point {
            let path = self.work_dir.join(entry);
            if !path.is_file() {
                return Err(Error::EntryPointMissing { path });
            }
        }
        if self.program.contains(std::path::MAIN_SEPARATOR) {
            let path = self.work_dir.join(&self.program);
            if !path.is_file() {
                return Err(Error::EntryPointMissing { path });
            }
        }
        Ok(())
    }
}

/// Run the pipeline to completion or deadline.
///
/// Child failure is a disposition, not an error. `Err` is returned only when
/// the launch itself is impossible: missing entry point, unwritable log, or a
/// program that cannot be started.
pub fn supervise(
    spec: &LaunchSpec,
    env: &LaunchEnv,
    log_path: &Path,
) -> Result<ExecutionDisposition, Error> {
    spec.check_entry_point()?;

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}", parent.display()), e))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| Error::io(format!("failed to open {}", log_path.display()), e))?;

    let (reader, writer) =
        std::io::pipe().map_err(|e| Error::io("failed to create output pipe", e))?;
    let writer_err = writer
        .try_clone()
        .map_err(|e| Error::io("failed to duplicate output pipe", e))?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(spec.argv())
        .current_dir(&spec.work_dir)
        .stdin(Stdio::null())
        .stdout(writer)
        .stderr(writer_err);
    env.apply(&mut cmd);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    own_process_group(&mut cmd);

    info!(
        program = %spec.program,
        args = ?spec.argv(),
        work_dir = %spec.work_dir.display(),
        deadline_secs = spec.deadline.as_secs(),
        log = %log_path.display(),
        "launching pipeline"
    );
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io(format!("failed to launch {}", spec.program), e))?;
    // The command still holds our copies of the pipe's write end.
    drop(cmd);

    let (done_tx, done_rx) = mpsc::channel();
    let echo = spec.echo;
    thread::spawn(move || {
        let copied = copy_output(reader, log, echo);
        let _ = done_tx.send(copied);
    });

    let started = Instant::now();
    let disposition = loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(status = %status, elapsed_secs = started.elapsed().as_secs(), "pipeline exited");
                break ExecutionDisposition::from_status(status);
            }
            Ok(None) => {
                let elapsed = started.elapsed();
                if elapsed >= spec.deadline {
                    warn!(
                        deadline_secs = spec.deadline.as_secs(),
                        "pipeline exceeded its deadline; terminating process group"
                    );
                    match terminate(&mut child, spec.kill_grace) {
                        Ok(status) => debug!(status = %status, "pipeline terminated"),
                        Err(e) => warn!("failed to reap terminated pipeline: {e}"),
                    }
                    break ExecutionDisposition::TimedOut {
                        elapsed: spec.deadline,
                    };
                }
                thread::sleep(POLL_INTERVAL.min(spec.deadline - elapsed));
            }
            Err(e) => {
                warn!("failed to poll pipeline: {e}; terminating");
                let status = terminate(&mut child, Duration::ZERO)
                    .map_err(|e| Error::io("failed to reap pipeline", e))?;
                break ExecutionDisposition::from_status(status);
            }
        }
    };

    drain(&child, &done_rx);
    Ok(disposition)
}

/// Copy the child's combined output to the log and, optionally, our stdout.
/// Keeps reading after a log write error so the child never blocks on a full pipe.
fn copy_output(mut reader: impl Read, mut log: File, echo: bool) -> u64 {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    let mut log_ok = true;
    let mut stdout = std::io::stdout();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("pipeline output read error: {e}");
                break;
            }
        };
        let chunk = &buf[..n];
        total += n as u64;

        if log_ok {
            if let Err(e) = log.write_all(chunk).and_then(|_| log.flush()) {
                warn!("failed to write pipeline log: {e}; continuing without it");
                log_ok = false;
            }
        }
        if echo {
            let _ = stdout.write_all(chunk);
            let _ = stdout.flush();
        }
    }
    total
}

/// Wait for the output copier to finish. Stragglers that still hold the pipe
/// are killed; if the stream still does not close, the copier is abandoned.
fn drain(child: &Child, done_rx: &mpsc::Receiver<u64>) {
    match done_rx.recv_timeout(DRAIN_TIMEOUT) {
        Ok(bytes) => {
            debug!(bytes, "pipeline output drained");
            return;
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => return,
        Err(mpsc::RecvTimeoutError::Timeout) => {}
    }
    warn!("pipeline output still open after exit; killing leftover processes");
    signal_group(child, Signal::Kill);
    if done_rx.recv_timeout(DRAIN_TIMEOUT).is_err() {
        warn!("abandoning pipeline output stream held by an escaped process");
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL whatever is left.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    signal_group(child, Signal::Term);
    wait_timeout(child, grace)?;
    // Always sent: descendants may outlive the group leader.
    kill_group(child)
}

/// Poll until `child` exits or `timeout` passes. `None` means still running.
pub(crate) fn wait_timeout(
    child: &mut Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let until = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= until {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(until - now));
    }
}

/// SIGKILL the child's process group and reap the leader.
pub(crate) fn kill_group(child: &mut Child) -> std::io::Result<ExitStatus> {
    signal_group(child, Signal::Kill);
    child.wait()
}

/// Start the command as the leader of a new process group.
pub(crate) fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child was spawned with process_group(0), so its pid is the group id.
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, sig) };
    if rc != 0 {
        debug!(
            pgid,
            ?signal,
            "killpg failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(child: &Child, signal: Signal) {
    debug!(pid = child.id(), ?signal, "process groups unsupported; signal not sent");
}

/// Exit code, with death by signal `s` reported as `128 + s`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, work_dir: &Path, deadline: Duration) -> LaunchSpec {
        LaunchSpec {
            program: "sh".to_string(),
            entry_point: None,
            args: vec!["-c".to_string(), script.to_string()],
            non_interactive_args: vec![],
            env: vec![],
            work_dir: work_dir.to_path_buf(),
            deadline,
            kill_grace: Duration::from_millis(200),
            echo: false,
        }
    }

    #[test]
    fn zero_exit_is_completed_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("logs").join("pipeline_1.log");
        let spec = sh("echo generating", tmp.path(), Duration::from_secs(10));

        let disposition = supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(disposition, ExecutionDisposition::CompletedOk);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "generating\n");
    }

    #[test]
    fn nonzero_exit_is_failed_with_code() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        let spec = sh("echo boom >&2; exit 2", tmp.path(), Duration::from_secs(10));

        let disposition = supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(disposition, ExecutionDisposition::Failed { exit_code: 2 });
        assert!(std::fs::read_to_string(&log).unwrap().contains("boom"));
    }

    #[test]
    fn stdout_and_stderr_interleave_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        let spec = sh(
            "echo one; echo two >&2; echo three; echo four >&2",
            tmp.path(),
            Duration::from_secs(10),
        );

        supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "one\ntwo\nthree\nfour\n"
        );
    }

    #[test]
    fn stdin_is_closed_so_prompts_do_not_block() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        let spec = sh(
            "if read answer; then echo got; else echo eof; fi",
            tmp.path(),
            Duration::from_secs(10),
        );

        let disposition = supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(disposition, ExecutionDisposition::CompletedOk);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "eof\n");
    }

    #[test]
    fn deadline_yields_timed_out() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        let deadline = Duration::from_millis(300);
        let spec = sh("echo started; sleep 30", tmp.path(), deadline);

        let started = Instant::now();
        let disposition = supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(disposition, ExecutionDisposition::TimedOut { elapsed: deadline });
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(std::fs::read_to_string(&log).unwrap().contains("started"));
    }

    #[test]
    fn appends_to_existing_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        std::fs::write(&log, "earlier\n").unwrap();
        let spec = sh("echo later", tmp.path(), Duration::from_secs(10));

        supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "earlier\nlater\n");
    }

    #[test]
    fn missing_entry_point_fails_before_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        let mut spec = sh("true", tmp.path(), Duration::from_secs(10));
        spec.entry_point = Some(PathBuf::from("generate.py"));

        let err = supervise(&spec, &LaunchEnv::new(), &log).unwrap_err();
        assert!(matches!(err, Error::EntryPointMissing { .. }));
        assert!(!log.exists());
    }

    #[test]
    fn spec_env_and_args_reach_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("run.log");
        std::fs::write(tmp.path().join("job.sh"), "echo \"$RW_MODE:$1\"\n").unwrap();
        let spec = LaunchSpec {
            program: "sh".to_string(),
            entry_point: Some(PathBuf::from("job.sh")),
            args: vec![],
            non_interactive_args: vec!["--yes".to_string()],
            env: vec![("RW_MODE".to_string(), "batch".to_string())],
            work_dir: tmp.path().to_path_buf(),
            deadline: Duration::from_secs(10),
            kill_grace: Duration::from_millis(200),
            echo: false,
        };

        assert_eq!(spec.argv(), vec!["job.sh", "--yes"]);
        supervise(&spec, &LaunchEnv::new(), &log).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "batch:--yes\n");
    }

    #[test]
    fn disposition_labels_are_distinct() {
        let labels = [
            ExecutionDisposition::CompletedOk.label(),
            ExecutionDisposition::TimedOut {
                elapsed: Duration::from_secs(1),
            }
            .label(),
            ExecutionDisposition::Failed { exit_code: 1 }.label(),
        ];
        assert_eq!(labels, ["completed_ok", "timed_out", "failed"]);
    }
}
