use std::path::{Path, PathBuf};

use crate::config::RUN_ID_PLACEHOLDER;

/// Restrict a run id to characters that are safe in a file name.
pub fn sanitize_run_id(run_id: &str) -> String {
    let slug: String = run_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let slug = slug.trim_matches('.').to_string();
    if slug.is_empty() {
        "run".to_string()
    } else {
        slug
    }
}

/// Combined stdout/stderr of the pipeline for one run.
pub fn pipeline_log_path(logs_root: &Path, run_id: &str) -> PathBuf {
    logs_root.join(format!("pipeline_{}.log", sanitize_run_id(run_id)))
}

/// Orchestrator event log for one run.
pub fn event_log_path(logs_root: &Path, run_id: &str) -> PathBuf {
    logs_root.join(format!("runwarden_{}.jsonl", sanitize_run_id(run_id)))
}

/// Expand `{run_id}` in a configured path and anchor it at `root`.
pub fn expand_run_path(root: &Path, template: &str, run_id: &str) -> PathBuf {
    root.join(template.replace(RUN_ID_PLACEHOLDER, &sanitize_run_id(run_id)))
}
