//! atfota CLI - firmware-over-the-air client for AT-command cellular modems.
//!
//! ## Features
//!
//! - One-shot update checks and downloads
//! - Long-running agent with keep-alive and periodic checks
//! - Signal and connection diagnostics
//! - Layered TOML configuration
//! - Shell completion generation

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// atfota - firmware-over-the-air updates through a SIM800-class modem.
///
/// Environment variables:
///   ATFOTA_PORT   - Serial port of the modem
///   ATFOTA_BAUD   - Baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "atfota")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  atfota -p /dev/ttyUSB0 check
  atfota update --output firmware.bin
  atfota run")]
pub(crate) struct Cli {
    /// Serial port of the modem.
    #[arg(short, long, global = true, env = "ATFOTA_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate (default: 115200).
    #[arg(short, long, global = true, env = "ATFOTA_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Stay connected, ping the server and install updates as they appear.
    Run {
        /// Where to write downloaded images.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Ask the server whether a newer version exists.
    Check {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check and, if a newer version exists, download and commit it.
    Update {
        /// Where to write the image.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show signal quality and connection state.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,
    },
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Missing or inconsistent arguments.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// The modem could not be reached.
    #[error("{0}")]
    Device(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Device(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return cli.exit_code();
    }
    match err.downcast_ref::<atfota::Error>() {
        Some(atfota::Error::Interrupted | atfota::Error::Link(atfota::LinkError::Interrupted)) => {
            130
        },
        Some(atfota::Error::Config(_)) => 3,
        Some(
            atfota::Error::Serial(_)
            | atfota::Error::Link(_)
            | atfota::Error::Transport(atfota::TransportError::Closed),
        ) => 4,
        _ => 1,
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Run { output } => commands::update::cmd_run(cli, &config, output.as_deref()),
        Commands::Check { json } => commands::update::cmd_check(cli, &config, *json),
        Commands::Update { output } => {
            commands::update::cmd_update(cli, &config, output.as_deref())
        },
        Commands::Status { json } => commands::status::cmd_status(cli, &config, *json),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "atfota v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    atfota::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&e))
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_global_options() {
        let cli = Cli::try_parse_from([
            "atfota",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "57600",
            "-vv",
            "check",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(57600));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Check { json: true }));
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["atfota", "update", "-o", "fw.bin", "-q", "-p", "COM3"])
            .unwrap();
        assert!(cli.quiet);
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        match cli.command {
            Commands::Update { output } => {
                assert_eq!(output, Some(PathBuf::from("fw.bin")));
            },
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn test_cli_parse_run_status_and_ports() {
        let cli = Cli::try_parse_from(["atfota", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { output: None }));

        let cli = Cli::try_parse_from(["atfota", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: true }));

        let cli = Cli::try_parse_from(["atfota", "list-ports"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: false }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["atfota", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions {
                shell: Some(Shell::Zsh)
            }
        ));
        assert!(Cli::try_parse_from(["atfota", "completions", "tcsh"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_input() {
        assert!(Cli::try_parse_from(["atfota"]).is_err());
        assert!(Cli::try_parse_from(["atfota", "check", "--jason"]).is_err());
        assert!(Cli::try_parse_from(["atfota", "--baud", "fast", "check"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            exit_code_for(&CliError::Usage("no port".into()).into()),
            2
        );
        assert_eq!(
            exit_code_for(&CliError::Config("bad".into()).into()),
            3
        );
        assert_eq!(
            exit_code_for(&CliError::Cancelled("stop".into()).into()),
            130
        );
        assert_eq!(exit_code_for(&atfota::Error::Interrupted.into()), 130);
        assert_eq!(
            exit_code_for(&atfota::Error::Link(atfota::LinkError::Dropped).into()),
            4
        );
        assert_eq!(exit_code_for(&atfota::Error::Busy.into()), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        use anyhow::Context;
        let err = Err::<(), _>(atfota::Error::Config("x".into()))
            .context("while starting")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 3);
    }
}
