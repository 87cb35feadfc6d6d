//! Command-line interface for tandem.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{constants::DEFAULT_CONTEXT, logs::parse_tail, manifest::MergeOptions};

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
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// `--tail` value: a line count or `all`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailArg(pub Option<usize>);

impl FromStr for TailArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_tail(value).map(TailArg)
    }
}

/// Command-line interface for tandem.
#[derive(Parser)]
#[command(name = "tandem", version, author)]
#[command(
    about = "Supervises dependency-ordered services and keeps their configuration in sync",
    long_about = None
)]
pub struct Cli {
    /// Project configuration file (defaults to `tandem.yml` in the current directory).
    #[arg(short = 'f', long = "file", value_name = "FILE", global = true)]
    pub file: Option<PathBuf>,

    /// Project name (defaults to `TANDEM_PROJECT_NAME` or the directory name).
    #[arg(short = 'p', long = "project-name", value_name = "NAME", global = true)]
    pub project_name: Option<String>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Use the system-wide state, log and credential directories.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Section of the credential file used for config sync.
    #[arg(long, value_name = "CONTEXT", default_value = DEFAULT_CONTEXT, global = true)]
    pub context: String,

    #[command(flatten)]
    pub manifest: ManifestArgs,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Command-line layer of the manifest merge.
#[derive(Args, Debug, Default, Clone)]
pub struct ManifestArgs {
    /// PID file of the supervising process.
    #[arg(long, value_name = "FILE", global = true)]
    pub pidfile: Option<PathBuf>,

    /// Log file of the supervising process.
    #[arg(long, value_name = "FILE", global = true)]
    pub logfile: Option<PathBuf>,

    /// Start this program automatically (repeatable).
    #[arg(long, value_name = "SERVICE", global = true)]
    pub launch: Vec<String>,

    /// Only start this program on request (repeatable).
    #[arg(long, value_name = "SERVICE", global = true)]
    pub nolaunch: Vec<String>,

    /// Keep this program in the manifest even if excluded elsewhere (repeatable).
    #[arg(long, value_name = "SERVICE", global = true)]
    pub include: Vec<String>,

    /// Leave this program out of the manifest (repeatable).
    #[arg(long, value_name = "SERVICE", global = true)]
    pub exclude: Vec<String>,

    /// Serve the control channel on a Unix socket at this path.
    #[arg(long, value_name = "PATH", global = true)]
    pub unix_socket: Option<PathBuf>,
}

impl From<ManifestArgs> for MergeOptions {
    fn from(args: ManifestArgs) -> Self {
        MergeOptions {
            pidfile: args.pidfile,
            logfile: args.logfile,
            launch: args.launch,
            nolaunch: args.nolaunch,
            include: args.include,
            exclude: args.exclude,
            unix_socket: args.unix_socket,
            ..MergeOptions::default()
        }
    }
}

/// Available commands for tandem.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch the supervising process and the sync daemon, or start services.
    Up {
        /// Services to start; everything when omitted.
        services: Vec<String>,
    },

    /// Stop services; with none named, also shut everything down.
    Down {
        /// Services to stop.
        services: Vec<String>,
    },

    /// Start services.
    Start {
        /// Services to start; everything when omitted.
        services: Vec<String>,
    },

    /// Stop services.
    Stop {
        /// Services to stop; everything when omitted.
        services: Vec<String>,
    },

    /// Restart services.
    Restart {
        /// Services to restart; everything when omitted.
        services: Vec<String>,
    },

    /// Send a signal to services.
    Kill {
        /// Signal name or number (default SIGKILL).
        #[arg(short = 's', long, value_name = "SIGNAL")]
        signal: Option<String>,

        /// Services to signal; everything when omitted.
        services: Vec<String>,
    },

    /// Show the state of services.
    #[command(visible_alias = "ps")]
    Top {
        /// Services to show; everything when omitted.
        services: Vec<String>,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Show service logs.
    Logs {
        /// Keep printing new output.
        #[arg(long)]
        follow: bool,

        /// Number of lines to show, or `all` (default 1600).
        #[arg(long, value_name = "N|all")]
        tail: Option<TailArg>,

        /// Services whose logs to show; everything when omitted.
        services: Vec<String>,
    },

    /// Restart the supervising process from a freshly merged manifest.
    Reload,

    /// Print the merged manifest.
    Config {
        /// Print the service names in start order instead.
        #[arg(long)]
        services: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
