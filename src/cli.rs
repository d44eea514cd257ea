//! Command-line interface for forkq.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::store::JobState;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Parses a job state filter for `forkq jobs --state`.
fn parse_job_state(value: &str) -> Result<JobState, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "scheduled" => Ok(JobState::Scheduled),
        "ready" => Ok(JobState::Ready),
        "claimed" => Ok(JobState::Claimed),
        "finished" => Ok(JobState::Finished),
        "failed" => Ok(JobState::Failed),
        other => Err(format!(
            "invalid job state '{other}', must be one of: scheduled, ready, claimed, finished, failed"
        )),
    }
}

/// Command-line interface for forkq.
#[derive(Parser)]
#[command(name = "forkq", version, author)]
#[command(about = "A forking supervisor for a store-backed job queue", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Use system directories (/var/lib/forkq, /etc/forkq) instead of the home directory.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Path to the configuration file (defaults to `forkq.yaml` lookup).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for forkq.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor in the foreground until SIGTERM or SIGINT.
    Start,

    /// Send SIGTERM to the supervisors registered on this host.
    Stop,

    /// Show registered processes and job counts.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Add a job running the given shell command.
    Enqueue {
        /// Queue the job is placed on.
        #[arg(short, long, default_value = "default")]
        queue: String,

        /// Lower values run first.
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Delay before the job becomes ready (e.g., "30s", "5m").
        #[arg(long = "in", value_name = "DURATION")]
        delay: Option<String>,

        /// Command and arguments to execute.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// List jobs, newest first.
    Jobs {
        /// Only show jobs in this state.
        #[arg(long, value_parser = parse_job_state)]
        state: Option<JobState>,

        /// Maximum number of jobs shown.
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_accepts_names_and_numbers() {
        assert_eq!(LogLevelArg::from_str("4").unwrap().as_str(), "debug");
        assert_eq!(LogLevelArg::from_str("WARNING").unwrap().as_str(), "warn");
        assert!(LogLevelArg::from_str("9").is_err());
        assert!(LogLevelArg::from_str("loud").is_err());
    }

    #[test]
    fn enqueue_collects_trailing_command() {
        let cli = Cli::try_parse_from([
            "forkq", "enqueue", "--queue", "mailers", "--priority", "-2", "--in", "5m", "echo",
            "hello", "--world",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue {
                queue,
                priority,
                delay,
                command,
            } => {
                assert_eq!(queue, "mailers");
                assert_eq!(priority, -2);
                assert_eq!(delay.as_deref(), Some("5m"));
                assert_eq!(command, vec!["echo", "hello", "--world"]);
            }
            _ => panic!("expected enqueue command"),
        }
    }

    #[test]
    fn enqueue_requires_a_command() {
        assert!(Cli::try_parse_from(["forkq", "enqueue"]).is_err());
    }

    #[test]
    fn jobs_parses_state_filter() {
        let cli = Cli::try_parse_from(["forkq", "jobs", "--state", "failed"]).unwrap();
        match cli.command {
            Commands::Jobs { state, limit } => {
                assert_eq!(state, Some(JobState::Failed));
                assert_eq!(limit, 50);
            }
            _ => panic!("expected jobs command"),
        }
        assert!(Cli::try_parse_from(["forkq", "jobs", "--state", "lost"]).is_err());
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from([
            "forkq",
            "status",
            "--json",
            "--sys",
            "--config",
            "/tmp/forkq.yaml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert!(cli.sys);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/forkq.yaml")));
        assert!(matches!(cli.command, Commands::Status { json: true, .. }));
    }
}
