use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use runwarden::capability::SystemProber;
use runwarden::cli::{Cli, Command};
use runwarden::config::{self, ProjectConfig};
use runwarden::env::LaunchEnv;
use runwarden::job::{self, EXIT_CAPABILITY_UNSATISFIABLE, EXIT_CONFIG, Job};
use runwarden::resolver;

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "runwarden=warn",
        0 => "runwarden=info",
        1 => "runwarden=debug",
        _ => "runwarden=trace",
    };
    // Pipeline output owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (mut config, config_path) = match ProjectConfig::load(&cwd) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{e:#}");
            return Ok(exit(EXIT_CONFIG));
        }
    };

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .runwarden/config.toml found, using defaults"),
        }
    }

    let mut echo = true;
    if let Command::Run {
        run_id,
        deadline_secs,
        quiet,
    } = &cli.command
    {
        if let Some(id) = run_id {
            config.job.run_id = Some(id.clone());
        }
        if let Some(secs) = deadline_secs {
            config.pipeline.deadline_secs = *secs;
        }
        echo = !quiet;
    }

    let root = config.project_root(config_path.as_deref(), &cwd);
    let run_id = config.resolve_run_id(|key| std::env::var(key).ok());
    let prober = SystemProber::new(config.job.python.clone()).with_timeout(config.job.probe_timeout());
    let job = Job {
        config,
        root,
        run_id,
        echo,
    };

    match cli.command {
        Command::Run { .. } => {
            let outcome = job.run(&prober)?;
            print!("{}", outcome.report);
            Ok(exit(outcome.exit_code))
        }
        Command::Provision => {
            let capabilities = job.config.effective_capabilities();
            let mut env = LaunchEnv::new();
            let resolution = job.resolve(&capabilities, &prober, &mut env, None);
            print!("{}", job::render_resolution(&resolution));
            if !env.extra_path().is_empty() {
                println!("Search path additions for this process:");
                for dir in env.extra_path() {
                    println!("  {}", dir.display());
                }
            }
            match resolution.ensure_required() {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(e) => {
                    error!("{e}");
                    Ok(exit(EXIT_CAPABILITY_UNSATISFIABLE))
                }
            }
        }
        Command::Probe => {
            let capabilities = job.config.effective_capabilities();
            let results = resolver::probe_all(&prober, &capabilities, &LaunchEnv::new());
            println!("Capabilities:");
            print!("{}", resolver::render_probe_report(&results));
            let missing_required = results
                .iter()
                .any(|(cap, report)| cap.required && !report.present);
            if missing_required {
                Ok(exit(EXIT_CAPABILITY_UNSATISFIABLE))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Command::Config { json } => {
            if json {
                println!(
                    "{}",
                    config::render_config_json(&job.config, config_path.as_deref())?
                );
            } else {
                print!(
                    "{}",
                    config::render_config_human(&job.config, config_path.as_deref())
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
