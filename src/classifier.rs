//! Post-run classification.
//!
//! Turns a disposition plus the artifact roots on disk into a
//! [`ResultSummary`] and an operator-facing report. Successful and timed-out
//! runs are judged by what they produced; failed runs by the tail of their
//! logs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::supervisor::ExecutionDisposition;

/// Lines of the combined pipeline log shown for a failed run.
pub const MAIN_LOG_TAIL_LINES: usize = 30;
/// Lines of the separate error-stream log shown for a failed run.
pub const ERROR_LOG_TAIL_LINES: usize = 20;

const TAIL_BLOCK: u64 = 8 * 1024;

pub const NO_ARTIFACTS_WARNING: &str = "pipeline reported success but produced no artifacts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Image,
    Video,
    Log,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Image => "png",
            Self::Video => "mp4",
            Self::Log => "log",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRoot {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub recursive: bool,
    /// Files under the root that are never counted, such as our own logs.
    pub exclude: Vec<PathBuf>,
}

impl ArtifactRoot {
    pub fn new(kind: ArtifactKind, path: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            kind,
            path: path.into(),
            recursive,
            exclude: Vec::new(),
        }
    }

    pub fn excluding(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.exclude.extend(paths);
        self
    }

    /// Files directly (or, if recursive, anywhere) under the root with the
    /// kind's extension. A missing root counts as empty.
    pub fn count(&self) -> usize {
        let mut walker = walkdir::WalkDir::new(&self.path).min_depth(1);
        if !self.recursive {
            walker = walker.max_depth(1);
        }
        let ext = self.kind.extension();
        walker
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(root = %self.path.display(), "skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| !self.exclude.iter().any(|p| p == entry.path()))
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
            })
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArtifactCounts {
    pub images: usize,
    pub videos: usize,
    pub logs: usize,
}

impl ArtifactCounts {
    pub fn total(&self) -> usize {
        self.images + self.videos + self.logs
    }
}

pub fn count_artifacts(roots: &[ArtifactRoot]) -> ArtifactCounts {
    let mut counts = ArtifactCounts::default();
    for root in roots {
        let n = root.count();
        match root.kind {
            ArtifactKind::Image => counts.images += n,
            ArtifactKind::Video => counts.videos += n,
            ArtifactKind::Log => counts.logs += n,
        }
    }
    counts
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSummary {
    pub disposition: ExecutionDisposition,
    /// `None` for failed runs, whose artifacts are not enumerated.
    pub counts: Option<ArtifactCounts>,
    pub warnings: Vec<String>,
}

pub fn classify(disposition: &ExecutionDisposition, roots: &[ArtifactRoot]) -> ResultSummary {
    let mut warnings = Vec::new();
    let counts = match disposition {
        ExecutionDisposition::CompletedOk => {
            let counts = count_artifacts(roots);
            if counts.total() == 0 {
                warn!("{NO_ARTIFACTS_WARNING}");
                warnings.push(NO_ARTIFACTS_WARNING.to_string());
            }
            Some(counts)
        }
        ExecutionDisposition::TimedOut { .. } => Some(count_artifacts(roots)),
        ExecutionDisposition::Failed { .. } => None,
    };
    ResultSummary {
        disposition: *disposition,
        counts,
        warnings,
    }
}

/// Log excerpts shown for a failed run.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub main_log: PathBuf,
    pub main_tail: Option<Vec<String>>,
    pub error_log: Option<PathBuf>,
    pub error_tail: Option<Vec<String>>,
}

pub fn collect_diagnostics(main_log: &Path, error_log: Option<&Path>) -> Diagnostics {
    Diagnostics {
        main_log: main_log.to_path_buf(),
        main_tail: read_tail(main_log, MAIN_LOG_TAIL_LINES),
        error_log: error_log.map(Path::to_path_buf),
        error_tail: error_log.and_then(|p| read_tail(p, ERROR_LOG_TAIL_LINES)),
    }
}

/// Last `n` lines of `text`, ignoring a trailing newline.
pub fn tail_lines(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect()
}

/// Read only as much of the end of `path` as needed for `n` lines.
/// `None` when the file cannot be read.
pub fn read_tail(path: &Path, n: usize) -> Option<Vec<String>> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let mut start = len;
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        // One extra newline: the file's final one, or the boundary before the
        // first wanted line.
        if start == 0 || newlines > n {
            break;
        }
        let step = TAIL_BLOCK.min(start);
        start -= step;
        let mut block = vec![0u8; step as usize];
        file.seek(SeekFrom::Start(start)).ok()?;
        file.read_exact(&mut block).ok()?;
        block.extend_from_slice(&buf);
        buf = block;
    }
    let text = String::from_utf8_lossy(&buf);
    let mut lines = tail_lines(&text, n + 1);
    // The first line may be cut mid-way when we stopped before the start.
    if start > 0 && lines.len() > n {
        lines.remove(0);
    }
    let keep = lines.len().saturating_sub(n);
    Some(lines.split_off(keep))
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}

fn push_tail(out: &mut String, label: &str, path: &Path, tail: Option<&[String]>, n: usize) {
    match tail {
        Some(lines) if !lines.is_empty() => {
            out.push_str(&format!(
                "--- last {n} lines of {label} ({}) ---\n",
                path.display()
            ));
            for line in lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        Some(_) => out.push_str(&format!("--- {label} ({}) is empty ---\n", path.display())),
        None => out.push_str(&format!(
            "--- {label} ({}) not available ---\n",
            path.display()
        )),
    }
}

/// Human-readable report for the operator.
pub fn render_report(
    run_id: &str,
    summary: &ResultSummary,
    diagnostics: Option<&Diagnostics>,
) -> String {
    let mut out = String::new();
    match summary.disposition {
        ExecutionDisposition::CompletedOk => {
            out.push_str(&format!("Run {run_id}: pipeline completed successfully\n"));
        }
        ExecutionDisposition::TimedOut { elapsed } => {
            out.push_str(&format!(
                "Run {run_id}: pipeline exceeded its deadline of {} and was terminated; results are partial\n",
                format_duration(elapsed)
            ));
        }
        ExecutionDisposition::Failed { exit_code } => {
            out.push_str(&format!(
                "Run {run_id}: pipeline failed with exit code {exit_code}\n"
            ));
        }
    }

    if let Some(counts) = &summary.counts {
        out.push_str(&format!("  images  {}\n", counts.images));
        out.push_str(&format!("  videos  {}\n", counts.videos));
        out.push_str(&format!("  logs    {}\n", counts.logs));
    }
    for warning in &summary.warnings {
        out.push_str(&format!("warning: {warning}\n"));
    }

    if let Some(diag) = diagnostics {
        push_tail(
            &mut out,
            "pipeline log",
            &diag.main_log,
            diag.main_tail.as_deref(),
            MAIN_LOG_TAIL_LINES,
        );
        if let Some(error_log) = &diag.error_log {
            push_tail(
                &mut out,
                "error log",
                error_log,
                diag.error_tail.as_deref(),
                ERROR_LOG_TAIL_LINES,
            );
        }
    }
    out
}
