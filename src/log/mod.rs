//! Structured execution log, one JSON object per line.
//!
//! Alongside the pipeline's own output, every run writes a `.jsonl` file with
//! the orchestrator's decisions: which capabilities were found, which
//! acquisition strategies were tried and how they ended, how the pipeline was
//! launched, and how it finished. Each line is a self-contained JSON object.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::debug;

/// A structured event in the execution log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp, UTC.
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        run_id: String,
        work_dir: String,
        partition: Option<String>,
        wall_clock: Option<String>,
    },
    /// One acquisition strategy changed state.
    ProvisionAttempt {
        capability: String,
        strategy: String,
        status: String,
        reason: Option<String>,
    },
    CapabilityResolved {
        capability: String,
        required: bool,
        satisfied: bool,
        by: Option<String>,
        version: Option<String>,
    },
    PipelineLaunched {
        program: String,
        args: Vec<String>,
        work_dir: String,
        deadline_secs: u64,
        log: String,
    },
    PipelineFinished {
        disposition: String,
        exit_code: Option<i32>,
        elapsed_secs: Option<u64>,
    },
    RunSummary {
        images: Option<usize>,
        videos: Option<usize>,
        logs: Option<usize>,
        warnings: Vec<String>,
    },
    /// The run stopped before or instead of executing the pipeline.
    RunAborted { reason: String },
}

/// Writer for JSON lines execution logs.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Open (append) the log at `path`, creating parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "execution log");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("execution log writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            event: LogEvent::ProvisionAttempt {
                capability: "ffmpeg".to_string(),
                strategy: "module-load".to_string(),
                status: "failed".to_string(),
                reason: Some("module not found".to_string()),
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"provision_attempt\""));
        assert!(json.contains("\"strategy\":\"module-load\""));
        assert!(json.contains("\"timestamp\":\"2026-01-01T00:00:00+00:00\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("logs").join("runwarden_1.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log(LogEvent::RunStarted {
            run_id: "1".to_string(),
            work_dir: "/work".to_string(),
            partition: Some("gpu".to_string()),
            wall_clock: None,
        })
        .unwrap();
        log.log(LogEvent::PipelineFinished {
            disposition: "timed_out".to_string(),
            exit_code: None,
            elapsed_secs: Some(10),
        })
        .unwrap();
        log.log(LogEvent::RunSummary {
            images: Some(4),
            videos: Some(0),
            logs: Some(1),
            warnings: vec![],
        })
        .unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("event").is_some());
            let ts = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        }
        assert!(lines[0].contains("\"event\":\"run_started\""));
        assert!(lines[1].contains("\"event\":\"pipeline_finished\""));
        assert!(lines[2].contains("\"images\":4"));
        assert_eq!(log.path(), log_path);
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("append.jsonl");

        for reason in ["first", "second"] {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::RunAborted {
                reason: reason.to_string(),
            })
            .unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
