use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "runwarden",
    about = "Provision dependencies, then run a batch pipeline under a wall-clock deadline",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision dependencies, run the pipeline, and report the outcome
    Run {
        /// Override the run identifier (default: scheduler job id)
        #[arg(long)]
        run_id: Option<String>,

        /// Override the pipeline deadline in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        deadline_secs: Option<u64>,

        /// Do not mirror pipeline output on stdout (the run log still gets it)
        #[arg(long)]
        quiet: bool,
    },

    /// Resolve every capability, acquiring what is missing, without running the pipeline
    Provision,

    /// Report which capabilities are present without acquiring anything
    Probe,

    /// Show project configuration
    Config {
        /// Emit JSON instead of the human-readable summary
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::parse_from([
            "runwarden",
            "run",
            "--run-id",
            "4711",
            "--deadline-secs",
            "60",
            "--quiet",
        ]);
        match cli.command {
            Command::Run {
                run_id,
                deadline_secs,
                quiet,
            } => {
                assert_eq!(run_id.as_deref(), Some("4711"));
                assert_eq!(deadline_secs, Some(60));
                assert!(quiet);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn zero_deadline_is_rejected() {
        assert!(Cli::try_parse_from(["runwarden", "run", "--deadline-secs", "0"]).is_err());
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::parse_from(["runwarden", "probe", "-vv"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Probe));
    }
}
