//! Command implementations.
//!
//! Each subcommand is implemented in its own module; opening the modem and
//! rendering progress are shared here.

pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod status;
pub(crate) mod update;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use atfota::{
    Agent, AgentConfig, NativePort, OtaSink, SerialConfig, SessionStatus, TransferEvent,
};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, warn};

use crate::config::{Config, DEFAULT_BAUD};
use crate::{Cli, CliError, use_fancy_output};

/// Default image path when neither `--output` nor `[transfer] output` is set.
const DEFAULT_OUTPUT: &str = "firmware.bin";

/// Serial port from the command line, falling back to the config file.
pub(crate) fn resolve_port(cli: &Cli, config: &Config) -> Result<String, CliError> {
    cli.port
        .clone()
        .or_else(|| config.modem.port.clone())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            CliError::Usage(
                "No serial port given; use --port, ATFOTA_PORT or [modem] port in atfota.toml"
                    .into(),
            )
        })
}

/// Image path from the command line, falling back to the config file.
pub(crate) fn resolve_output(output: Option<&Path>, config: &Config) -> PathBuf {
    output
        .map(Path::to_path_buf)
        .or_else(|| config.transfer.output.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT))
}

/// Agent settings, with configuration problems mapped to their exit code.
pub(crate) fn agent_config(config: &Config) -> Result<AgentConfig, CliError> {
    config
        .agent_config()
        .map_err(|e| CliError::Config(format!("{e:#}")))
}

/// Open the modem and build an agent around `sink`.
pub(crate) fn open_agent<S: OtaSink>(
    cli: &Cli,
    config: &Config,
    agent_config: AgentConfig,
    sink: S,
) -> Result<Agent<S>> {
    let port_name = resolve_port(cli, config)?;
    let baud = cli.baud.or(config.modem.baud).unwrap_or(DEFAULT_BAUD);
    let encoding = config.encoding();
    debug!(
        "Opening {port_name} at {baud} baud, {} encoding",
        encoding.name()
    );

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .map_err(|e| CliError::Device(format!("Cannot open {port_name}: {e}")))?;
    let agent = Agent::new(Box::new(port), Arc::new(encoding), sink, agent_config)?;
    Ok(agent)
}

fn progress_bar(total: u64, quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Observer that renders session events on stderr.
///
/// The bar is created when the server offers an image and cleared when the
/// session ends either way.
pub(crate) fn progress_observer(quiet: bool) -> impl FnMut(&TransferEvent) + Send + 'static {
    let mut bar: Option<ProgressBar> = None;
    move |event| match event {
        TransferEvent::UpdateAvailable(descriptor) => {
            if !quiet {
                eprintln!(
                    "{} Update available: {} {} ({} bytes)",
                    style("→").green().bold(),
                    style(&descriptor.display_name).cyan(),
                    style(&descriptor.version).cyan().bold(),
                    descriptor.total_size
                );
            }
            let pb = progress_bar(descriptor.total_size, quiet);
            pb.set_message("downloading");
            bar = Some(pb);
        },
        TransferEvent::Progress { committed, total } => {
            if let Some(pb) = &bar {
                pb.set_length(*total);
                pb.set_position(*committed);
            }
        },
        TransferEvent::ChunkRetry {
            offset,
            attempt,
            error,
        } => {
            let line = format!("Chunk at {offset} failed (attempt {attempt}): {error}");
            match &bar {
                Some(pb) if !pb.is_hidden() => pb.println(format!("{} {line}", style("!").yellow())),
                _ => warn!("{line}"),
            }
        },
        TransferEvent::Status(status) => {
            if let Some(pb) = &bar {
                match status {
                    SessionStatus::Verifying => pb.set_message("verifying"),
                    SessionStatus::Committing => pb.set_message("committing"),
                    _ => {},
                }
            }
            if matches!(status, SessionStatus::Idle | SessionStatus::Failed) {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
            } else if *status == SessionStatus::Completed {
                if let Some(pb) = bar.take() {
                    pb.finish_with_message("done");
                }
            }
        },
    }
}
