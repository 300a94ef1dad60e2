use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capability::{Capability, Probe};
use crate::provision::strategy::StrategySpec;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".runwarden";

/// Placeholder expanded to the run identifier in configured paths.
pub const RUN_ID_PLACEHOLDER: &str = "{run_id}";

/// Versioned static ffmpeg build used as the last-resort acquisition step.
pub const FFMPEG_STATIC_URL: &str =
    "https://johnvansickle.com/ffmpeg/old-releases/ffmpeg-6.0-amd64-static.tar.xz";

/// Scheduler-supplied job parameters. Treated as opaque except for the run id.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default = "default_run_id_env")]
    pub run_id_env: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_python")]
    pub python: String,
    /// Upper bound on each capability probe subprocess.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub wall_clock: Option<String>,
}

fn default_run_id_env() -> String {
    "SLURM_JOB_ID".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    crate::capability::DEFAULT_PROBE_TIMEOUT.as_secs()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            run_id_env: default_run_id_env(),
            work_dir: None,
            python: default_python(),
            probe_timeout_secs: default_probe_timeout_secs(),
            partition: None,
            wall_clock: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_entry_point")]
    pub entry_point: PathBuf,
    /// Interpreter or launcher. Defaults to `job.python`.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default)]
    pub non_interactive_args: Vec<String>,
    #[serde(default = "default_non_interactive_env")]
    pub non_interactive_env: BTreeMap<String, String>,
}

fn default_entry_point() -> PathBuf {
    PathBuf::from("generate.py")
}

fn default_deadline_secs() -> u64 {
    3 * 60 * 60
}

fn default_kill_grace_secs() -> u64 {
    30
}

fn default_non_interactive_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ("RUNWARDEN_NON_INTERACTIVE".to_string(), "1".to_string()),
    ])
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
            program: None,
            args: Vec::new(),
            deadline_secs: default_deadline_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            non_interactive_args: Vec::new(),
            non_interactive_env: default_non_interactive_env(),
        }
    }
}

impl JobConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// One directory scanned after the run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArtifactRootConfig {
    pub path: PathBuf,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_images_root")]
    pub images: ArtifactRootConfig,
    #[serde(default = "default_videos_root")]
    pub videos: ArtifactRootConfig,
    #[serde(default = "default_logs_root")]
    pub logs: ArtifactRootConfig,
    /// Separate error-stream log written by the scheduler. An empty string
    /// disables it.
    #[serde(default = "default_error_log")]
    pub error_log: Option<String>,
}

fn default_images_root() -> ArtifactRootConfig {
    ArtifactRootConfig {
        path: PathBuf::from("outputs/images"),
        recursive: true,
    }
}

fn default_videos_root() -> ArtifactRootConfig {
    ArtifactRootConfig {
        path: PathBuf::from("outputs/videos"),
        recursive: true,
    }
}

fn default_logs_root() -> ArtifactRootConfig {
    ArtifactRootConfig {
        path: PathBuf::from("logs"),
        recursive: false,
    }
}

fn default_error_log() -> Option<String> {
    Some(format!("logs/{RUN_ID_PLACEHOLDER}.err"))
}

impl ArtifactsConfig {
    /// The error-log template, `None` when disabled.
    pub fn error_log(&self) -> Option<&str> {
        self.error_log.as_deref().filter(|t| !t.trim().is_empty())
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            images: default_images_root(),
            videos: default_videos_root(),
            logs: default_logs_root(),
            error_log: default_error_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default, rename = "capability")]
    pub capabilities: Vec<Capability>,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.runwarden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config
                .validate()
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn validate(&self) -> std::result::Result<(), crate::Error> {
        if self.job.probe_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "job.probe_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.deadline_secs == 0 {
            return Err(crate::Error::Config(
                "pipeline.deadline_secs must be greater than zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if !seen.insert(cap.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "capability `{}` is declared more than once",
                    cap.name
                )));
            }
        }
        Ok(())
    }

    /// The directory relative paths resolve against: `job.work_dir`, else the
    /// directory holding `.runwarden/`, else `cwd`.
    pub fn project_root(&self, config_path: Option<&Path>, cwd: &Path) -> PathBuf {
        let base = config_path
            .and_then(|p| p.parent())
            .and_then(|p| p.parent())
            .unwrap_or(cwd);
        match &self.job.work_dir {
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        }
    }

    /// Run identifier: explicit config, then the scheduler's variable, then a
    /// generated local id.
    pub fn resolve_run_id(&self, lookup: impl Fn(&str) -> Option<String>) -> String {
        if let Some(id) = self.job.run_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return id.trim().to_string();
        }
        if let Some(id) = lookup(&self.job.run_id_env).filter(|s| !s.trim().is_empty()) {
            return id.trim().to_string();
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("local-{}", &id[..8])
    }

    pub fn pipeline_program(&self) -> &str {
        self.pipeline.program.as_deref().unwrap_or(&self.job.python)
    }

    /// Declared capabilities, or the built-in set when none are declared.
    pub fn effective_capabilities(&self) -> Vec<Capability> {
        if self.capabilities.is_empty() {
            default_capabilities()
        } else {
            self.capabilities.clone()
        }
    }
}

fn python_module(name: &str, module: &str, attr: Option<&str>, required: bool) -> Capability {
    Capability {
        name: name.to_string(),
        required,
        probe: Probe::PythonModule {
            module: module.to_string(),
            attr: attr.map(str::to_string),
        },
        strategies: vec![StrategySpec::PipInstall {
            name: None,
            packages: vec![module.split('.').next().unwrap_or(module).to_string()],
        }],
    }
}

/// Capabilities of the video generation job when the config declares none.
pub fn default_capabilities() -> Vec<Capability> {
    let mut caps = vec![
        python_module("torch", "torch", None, true),
        python_module("diffusers", "diffusers", None, true),
    ];
    for symbol in [
        "DiffusionPipeline",
        "StableDiffusionXLImg2ImgPipeline",
        "StableVideoDiffusionPipeline",
    ] {
        let mut cap = python_module(
            &format!("diffusers.{symbol}"),
            "diffusers",
            Some(symbol),
            true,
        );
        cap.strategies = vec![StrategySpec::PipInstall {
            name: None,
            packages: vec!["--upgrade".to_string(), "diffusers".to_string()],
        }];
        caps.push(cap);
    }
    for (name, module, attr) in [
        ("diffusers.utils.load_image", "diffusers.utils", "load_image"),
        (
            "diffusers.utils.export_to_video",
            "diffusers.utils",
            "export_to_video",
        ),
    ] {
        let mut cap = python_module(name, module, Some(attr), true);
        cap.strategies.clear();
        caps.push(cap);
    }
    caps.push(python_module("transformers", "transformers", None, true));
    caps.push(Capability {
        name: "cuda".to_string(),
        required: false,
        probe: Probe::PythonCheck {
            code: "import torch; assert torch.cuda.is_available()".to_string(),
        },
        strategies: Vec::new(),
    });
    caps.push(python_module("openai", "openai", None, false));
    caps.push(Capability {
        name: "ffmpeg".to_string(),
        required: true,
        probe: Probe::Executable {
            program: "ffmpeg".to_string(),
            version_args: vec!["-version".to_string()],
        },
        strategies: vec![
            StrategySpec::ModuleLoad {
                name: None,
                module: "ffmpeg".to_string(),
            },
            StrategySpec::CondaInstall {
                name: None,
                channel: Some("conda-forge".to_string()),
                packages: vec!["ffmpeg".to_string()],
            },
            StrategySpec::StaticDownload {
                name: None,
                url: FFMPEG_STATIC_URL.to_string(),
                binary: "ffmpeg".to_string(),
                sha256: None,
            },
        ],
    });
    caps
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .runwarden/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

pub fn render_config_human(config: &ProjectConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Job\n");
    push_kv(
        &mut output,
        "run_id",
        config.job.run_id.as_deref().unwrap_or("(from environment)"),
    );
    push_kv(&mut output, "run_id_env", &config.job.run_id_env);
    push_kv(&mut output, "python", &config.job.python);
    push_kv(&mut output, "probe_timeout", format!("{}s", config.job.probe_timeout_secs));
    push_kv(
        &mut output,
        "partition",
        config.job.partition.as_deref().unwrap_or("(none)"),
    );
    push_kv(
        &mut output,
        "wall_clock",
        config.job.wall_clock.as_deref().unwrap_or("(none)"),
    );
    output.push('\n');

    output.push_str("Pipeline\n");
    push_kv(&mut output, "program", config.pipeline_program());
    push_kv(&mut output, "entry_point", config.pipeline.entry_point.display());
    push_kv(&mut output, "args", join_or_none(&config.pipeline.args));
    push_kv(&mut output, "deadline", format!("{}s", config.pipeline.deadline_secs));
    push_kv(&mut output, "kill_grace", format!("{}s", config.pipeline.kill_grace_secs));
    push_kv(
        &mut output,
        "non_interactive",
        join_or_none(&config.pipeline.non_interactive_args),
    );
    for (key, value) in &config.pipeline.non_interactive_env {
        output.push_str(&format!("  - {key}={value}\n"));
    }
    output.push('\n');

    output.push_str("Artifacts\n");
    for (key, root) in [
        ("images", &config.artifacts.images),
        ("videos", &config.artifacts.videos),
        ("logs", &config.artifacts.logs),
    ] {
        let mode = if root.recursive { "recursive" } else { "top level" };
        push_kv(&mut output, key, format!("{} ({mode})", root.path.display()));
    }
    push_kv(
        &mut output,
        "error_log",
        config.artifacts.error_log().unwrap_or("(none)"),
    );
    output.push('\n');

    output.push_str("Capabilities\n");
    if config.capabilities.is_empty() {
        push_kv(&mut output, "declared", "(none, using built-in set)");
    }
    for cap in config.effective_capabilities() {
        let strategies: Vec<String> = cap.strategies.iter().map(|s| s.name().to_string()).collect();
        let optional = if cap.required { "" } else { " (optional)" };
        output.push_str(&format!(
            "  - {}{optional}: {} <- {}\n",
            cap.name,
            cap.probe.describe(),
            join_or_none(&strategies)
        ));
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &ProjectConfig, config_path: Option<&Path>) -> Result<String> {
    let capabilities: Vec<serde_json::Value> = config
        .effective_capabilities()
        .iter()
        .map(|cap| {
            serde_json::json!({
                "name": &cap.name,
                "required": cap.required,
                "probe": cap.probe.describe(),
                "strategies": cap.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            })
        })
        .collect();

    let payload = serde_json::json!({
        "job": {
            "run_id": config.job.run_id.clone(),
            "run_id_env": &config.job.run_id_env,
            "python": &config.job.python,
            "probe_timeout_secs": config.job.probe_timeout_secs,
            "partition": config.job.partition.clone(),
            "wall_clock": config.job.wall_clock.clone()
        },
        "pipeline": {
            "program": config.pipeline_program(),
            "entry_point": config.pipeline.entry_point.display().to_string(),
            "args": &config.pipeline.args,
            "deadline_secs": config.pipeline.deadline_secs,
            "kill_grace_secs": config.pipeline.kill_grace_secs,
            "non_interactive_args": &config.pipeline.non_interactive_args,
            "non_interactive_env": &config.pipeline.non_interactive_env
        },
        "artifacts": {
            "images": config.artifacts.images.path.display().to_string(),
            "videos": config.artifacts.videos.path.display().to_string(),
            "logs": config.artifacts.logs.path.display().to_string(),
            "error_log": config.artifacts.error_log()
        },
        "capabilities": capabilities,
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
