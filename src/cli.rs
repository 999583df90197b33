//! Command-line interface for rootd.
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(pub LevelFilter);

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
            "error" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for rootd.
#[derive(Parser)]
#[command(name = "rootd", version, author)]
#[command(about = "A user-space service supervisor", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Daemon set root directory. Falls back to FAULT_DAEMON_DIRECTORY,
    /// then to ~/.fault/rootd.
    #[arg(short = 'd', long, value_name = "PATH", global = true)]
    pub directory: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for rootd.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize an empty daemon set root directory.
    Setup,

    /// Start the supervisor detached from the terminal.
    Boot,

    /// Run the supervisor in the foreground. `boot` execs this.
    Run,

    /// Stop the detached supervisor via its PID file.
    Halt,

    /// Edit a service's stored configuration while the supervisor is
    /// offline. Changes apply directly to disk and do not affect a running
    /// process.
    Configure {
        /// Name of the service directory under `daemons/`.
        service: String,

        /// The store operation to perform.
        #[command(subcommand)]
        action: ConfigureAction,
    },
}

/// Offline store operations.
#[derive(Subcommand)]
pub enum ConfigureAction {
    /// Create the service directory and initialize its settings.
    Create {
        /// Program to execute.
        executable: Option<String>,

        /// Full argv, including the leading program name.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        parameters: Vec<String>,
    },

    /// Remove the service directory and its contents.
    Void,

    /// Define the executable and its parameters for starting the service.
    Command {
        /// Program to execute.
        executable: String,

        /// Full argv, including the leading program name.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        parameters: Vec<String>,
    },

    /// Enable the service so the supervisor starts it on boot.
    Enable,

    /// Disable the service; it will not be started automatically.
    Disable,

    /// Add environment variables (no equal sign in assignments).
    EnvAdd {
        /// NAME VALUE pairs, alternating.
        #[arg(value_name = "NAME VALUE")]
        pairs: Vec<String>,
    },

    /// Remove environment variables from the service.
    EnvDel {
        /// Variable names to remove.
        names: Vec<String>,
    },

    /// Print the service's definition to standard error.
    Report,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
