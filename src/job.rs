//! The `run` pipeline: resolve dependencies, supervise the pipeline, classify
//! the result, and map it to the orchestrator's exit code.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::capability::{Capability, Prober};
use crate::classifier::{self, ArtifactKind, ArtifactRoot, ResultSummary};
use crate::config::ProjectConfig;
use crate::env::LaunchEnv;
use crate::error::Error;
use crate::log::{ExecutionLog, LogEvent};
use crate::paths;
use crate::provision::{AttemptEvent, ProvisioningOutcome};
use crate::resolver::{self, Resolution};
use crate::supervisor::{self, ExecutionDisposition, LaunchSpec};

/// Exit code for a run that hit its deadline. `124` is left to `timeout(1)`.
pub const EXIT_DEADLINE_EXCEEDED: i32 = 75;
/// A required capability could not be provisioned (sysexits `EX_UNAVAILABLE`).
pub const EXIT_CAPABILITY_UNSATISFIABLE: i32 = 69;
/// The job is misconfigured, e.g. the entry point is missing (`EX_CONFIG`).
pub const EXIT_CONFIG: i32 = 78;

pub fn exit_code_for(disposition: &ExecutionDisposition) -> i32 {
    match disposition {
        ExecutionDisposition::CompletedOk => 0,
        ExecutionDisposition::TimedOut { .. } => EXIT_DEADLINE_EXCEEDED,
        ExecutionDisposition::Failed { exit_code } => *exit_code,
    }
}

/// Resolved inputs for one job invocation.
#[derive(Debug, Clone)]
pub struct Job {
    pub config: ProjectConfig,
    pub root: PathBuf,
    pub run_id: String,
    /// Mirror pipeline output on stdout.
    pub echo: bool,
}

/// What a finished `run` produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub exit_code: i32,
    pub summary: Option<ResultSummary>,
    pub report: String,
}

impl Job {
    pub fn logs_root(&self) -> PathBuf {
        self.root.join(&self.config.artifacts.logs.path)
    }

    pub fn pipeline_log(&self) -> PathBuf {
        paths::pipeline_log_path(&self.logs_root(), &self.run_id)
    }

    pub fn event_log(&self) -> PathBuf {
        paths::event_log_path(&self.logs_root(), &self.run_id)
    }

    pub fn error_log(&self) -> Option<PathBuf> {
        self.config
            .artifacts
            .error_log()
            .map(|t| paths::expand_run_path(&self.root, t, &self.run_id))
    }

    /// Files the orchestrator writes itself; never pipeline artifacts.
    fn own_logs(&self) -> Vec<PathBuf> {
        let mut own = vec![self.pipeline_log(), self.event_log()];
        own.extend(self.error_log());
        own
    }

    pub fn artifact_roots(&self) -> Vec<ArtifactRoot> {
        let a = &self.config.artifacts;
        vec![
            ArtifactRoot::new(ArtifactKind::Image, self.root.join(&a.images.path), a.images.recursive),
            ArtifactRoot::new(ArtifactKind::Video, self.root.join(&a.videos.path), a.videos.recursive),
            ArtifactRoot::new(ArtifactKind::Log, self.logs_root(), a.logs.recursive)
                .excluding(self.own_logs()),
        ]
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        let p = &self.config.pipeline;
        LaunchSpec {
            program: self.config.pipeline_program().to_string(),
            entry_point: Some(p.entry_point.clone()),
            args: p.args.clone(),
            non_interactive_args: p.non_interactive_args.clone(),
            env: p
                .non_interactive_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .chain([("RUNWARDEN_RUN_ID".to_string(), self.run_id.clone())])
                .collect(),
            work_dir: self.root.clone(),
            deadline: p.deadline(),
            kill_grace: p.kill_grace(),
            echo: self.echo,
        }
    }

    /// Full job: provision, supervise, classify.
    pub fn run(&self, prober: &dyn Prober) -> Result<JobOutcome> {
        let log = ExecutionLog::new(&self.event_log())?;
        record(
            &log,
            LogEvent::RunStarted {
                run_id: self.run_id.clone(),
                work_dir: self.root.display().to_string(),
                partition: self.config.job.partition.clone(),
                wall_clock: self.config.job.wall_clock.clone(),
            },
        );
        info!(run_id = %self.run_id, root = %self.root.display(), "starting job");

        let spec = self.launch_spec();
        if let Err(e) = spec.check_entry_point() {
            return Ok(abort(&log, EXIT_CONFIG, &e));
        }

        let mut env = LaunchEnv::new();
        let capabilities = self.config.effective_capabilities();
        let resolution = self.resolve(&capabilities, prober, &mut env, Some(&log));
        print!("{}", render_resolution(&resolution));
        if let Err(e) = resolution.ensure_required() {
            return Ok(abort(&log, EXIT_CAPABILITY_UNSATISFIABLE, &e));
        }

        let pipeline_log = self.pipeline_log();
        record(
            &log,
            LogEvent::PipelineLaunched {
                program: spec.program.clone(),
                args: spec.argv(),
                work_dir: spec.work_dir.display().to_string(),
                deadline_secs: spec.deadline.as_secs(),
                log: pipeline_log.display().to_string(),
            },
        );
        let disposition = match supervisor::supervise(&spec, &env, &pipeline_log) {
            Ok(d) => d,
            Err(e @ Error::EntryPointMissing { .. }) => {
                return Ok(abort(&log, EXIT_CONFIG, &e));
            }
            Err(e) => {
                record(&log, LogEvent::RunAborted { reason: e.to_string() });
                return Err(e.into());
            }
        };
        record(
            &log,
            LogEvent::PipelineFinished {
                disposition: disposition.label().to_string(),
                exit_code: match disposition {
                    ExecutionDisposition::Failed { exit_code } => Some(exit_code),
                    ExecutionDisposition::CompletedOk => Some(0),
                    ExecutionDisposition::TimedOut { .. } => None,
                },
                elapsed_secs: match disposition {
                    ExecutionDisposition::TimedOut { elapsed } => Some(elapsed.as_secs()),
                    _ => None,
                },
            },
        );

        let summary = classifier::classify(&disposition, &self.artifact_roots());
        let diagnostics = matches!(disposition, ExecutionDisposition::Failed { .. }).then(|| {
            classifier::collect_diagnostics(&pipeline_log, self.error_log().as_deref())
        });
        let report = classifier::render_report(&self.run_id, &summary, diagnostics.as_ref());
        record(
            &log,
            LogEvent::RunSummary {
                images: summary.counts.as_ref().map(|c| c.images),
                videos: summary.counts.as_ref().map(|c| c.videos),
                logs: summary.counts.as_ref().map(|c| c.logs),
                warnings: summary.warnings.clone(),
            },
        );

        Ok(JobOutcome {
            exit_code: exit_code_for(&disposition),
            summary: Some(summary),
            report,
        })
    }

    /// Dependency resolution only. Records to `log` when given.
    pub fn resolve(
        &self,
        capabilities: &[Capability],
        prober: &dyn Prober,
        env: &mut LaunchEnv,
        log: Option<&ExecutionLog>,
    ) -> Resolution {
        let resolution = resolver::resolve_all(
            prober,
            capabilities,
            &self.config.job.python,
            env,
            |cap, event| {
                let Some(log) = log else { return };
                let (strategy, status, reason) = match event {
                    AttemptEvent::Started { strategy } => (*strategy, "started", None),
                    AttemptEvent::Failed(a) => (a.strategy.as_str(), "failed", Some(a.reason.clone())),
                    AttemptEvent::Succeeded { strategy } => (*strategy, "succeeded", None),
                };
                record(
                    log,
                    LogEvent::ProvisionAttempt {
                        capability: cap.name.clone(),
                        strategy: strategy.to_string(),
                        status: status.to_string(),
                        reason,
                    },
                );
            },
        );
        if let Some(log) = log {
            for entry in &resolution.entries {
                let (satisfied, by, version) = match &entry.outcome {
                    ProvisioningOutcome::Satisfied { by, version } => {
                        (true, Some(by.clone()), version.clone())
                    }
                    ProvisioningOutcome::Unsatisfied { .. } => (false, None, None),
                };
                record(
                    log,
                    LogEvent::CapabilityResolved {
                        capability: entry.name.clone(),
                        required: entry.required,
                        satisfied,
                        by,
                        version,
                    },
                );
            }
        }
        resolution
    }
}

pub fn render_resolution(resolution: &Resolution) -> String {
    let mut out = format!("Dependencies:\n{}", resolution.render());
    let missing: Vec<&str> = resolution
        .missing_optional()
        .map(|e| e.name.as_str())
        .collect();
    if !missing.is_empty() {
        out.push_str(&format!(
            "warning: continuing without optional capabilities: {}\n",
            missing.join(", ")
        ));
    }
    out
}

/// The event log is auxiliary; a write failure must not end the job.
fn record(log: &ExecutionLog, event: LogEvent) {
    if let Err(e) = log.log(event) {
        warn!(path = %log.path().display(), "failed to write execution log: {e:#}");
    }
}

fn abort(log: &ExecutionLog, exit_code: i32, err: &Error) -> JobOutcome {
    error!("{err}");
    record(log, LogEvent::RunAborted { reason: err.to_string() });
    JobOutcome {
        exit_code,
        summary: None,
        report: format!("Run aborted before execution: {err}\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exit_codes_mirror_disposition() {
        assert_eq!(exit_code_for(&ExecutionDisposition::CompletedOk), 0);
        assert_eq!(
            exit_code_for(&ExecutionDisposition::TimedOut {
                elapsed: Duration::from_secs(5)
            }),
            EXIT_DEADLINE_EXCEEDED
        );
        assert_ne!(EXIT_DEADLINE_EXCEEDED, 124);
        assert_eq!(exit_code_for(&ExecutionDisposition::Failed { exit_code: 2 }), 2);
    }

    #[test]
    fn paths_derive_from_root_and_run_id() {
        let job = Job {
            config: ProjectConfig::default(),
            root: PathBuf::from("/scratch/job"),
            run_id: "4711".to_string(),
            echo: false,
        };
        assert_eq!(job.pipeline_log(), PathBuf::from("/scratch/job/logs/pipeline_4711.log"));
        assert_eq!(job.event_log(), PathBuf::from("/scratch/job/logs/runwarden_4711.jsonl"));
        assert_eq!(job.error_log(), Some(PathBuf::from("/scratch/job/logs/4711.err")));

        let mut disabled = job.clone();
        disabled.config.artifacts.error_log = Some(String::new());
        assert_eq!(disabled.error_log(), None);

        let roots = job.artifact_roots();
        assert_eq!(roots[0].path, PathBuf::from("/scratch/job/outputs/images"));
        assert!(!roots[2].recursive);
        assert!(roots[2].exclude.contains(&job.pipeline_log()));
        assert!(roots[2].exclude.contains(&PathBuf::from("/scratch/job/logs/4711.err")));
    }

    #[test]
    fn resolution_summary_names_missing_optional_capabilities() {
        use crate::provision::PREEXISTING;
        use crate::resolver::Resolved;

        let entry = |name: &str, required: bool, satisfied: bool| Resolved {
            name: name.to_string(),
            required,
            outcome: if satisfied {
                ProvisioningOutcome::Satisfied {
                    by: PREEXISTING.to_string(),
                    version: None,
                }
            } else {
                ProvisioningOutcome::Unsatisfied { attempts: vec![] }
            },
        };
        let resolution = Resolution {
            entries: vec![
                entry("torch", true, true),
                entry("cuda", false, false),
                entry("openai", false, false),
            ],
        };
        let rendered = render_resolution(&resolution);
        assert!(rendered.starts_with("Dependencies:\n"));
        assert!(rendered.ends_with("warning: continuing without optional capabilities: cuda, openai\n"));

        let all_present = Resolution {
            entries: vec![entry("torch", true, true)],
        };
        assert!(!render_resolution(&all_present).contains("warning"));
    }

    #[test]
    fn launch_spec_carries_non_interactive_settings() {
        let mut config = ProjectConfig::default();
        config.pipeline.non_interactive_args = vec!["--yes".to_string()];
        config.pipeline.args = vec!["--steps".to_string(), "25".to_string()];
        let job = Job {
            config,
            root: PathBuf::from("/w"),
            run_id: "1".to_string(),
            echo: true,
        };
        let spec = job.launch_spec();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.argv(), vec!["generate.py", "--steps", "25", "--yes"]);
        assert!(spec.env.contains(&("RUNWARDEN_NON_INTERACTIVE".to_string(), "1".to_string())));
        assert!(spec.env.contains(&("RUNWARDEN_RUN_ID".to_string(), "1".to_string())));
        assert_eq!(spec.deadline, Duration::from_secs(10_800));
    }
}
