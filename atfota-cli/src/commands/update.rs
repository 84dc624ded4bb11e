//! `check`, `update` and `run`: the update cycle.

use std::path::Path;

use anyhow::{Context, Result};
use atfota::{FileSink, FirmwareDescriptor, MemorySink, RunExit, UpdateOutcome};
use console::style;
use log::info;

use crate::commands::{agent_config, open_agent, progress_observer, resolve_output};
use crate::config::Config;
use crate::{Cli, CliError};

fn check_json(current: &str, offer: Option<&FirmwareDescriptor>) -> serde_json::Value {
    match offer {
        Some(d) => serde_json::json!({
            "current_version": current,
            "update_available": true,
            "version": d.version,
            "name": d.display_name,
            "size": d.total_size,
            "md5": d.content_hash,
        }),
        None => serde_json::json!({
            "current_version": current,
            "update_available": false,
        }),
    }
}

/// Ask the server for a newer version without downloading it.
pub(crate) fn cmd_check(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let settings = agent_config(config)?;
    let current = settings.transfer.current_version.clone();
    let mut agent = open_agent(cli, config, settings, MemorySink::new())?;
    let offer = agent.check_once().context("Update check failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&check_json(&current, offer.as_ref()))?
        );
        return Ok(());
    }

    match offer {
        Some(d) => eprintln!(
            "{} Update available: {} -> {} ({} bytes)",
            style("→").green().bold(),
            current,
            style(&d.version).cyan().bold(),
            d.total_size
        ),
        None => eprintln!(
            "{} Up to date ({})",
            style("✓").green(),
            style(&current).cyan()
        ),
    }
    Ok(())
}

/// Run one update cycle and write the image to `output`.
pub(crate) fn cmd_update(cli: &Cli, config: &Config, output: Option<&Path>) -> Result<()> {
    let settings = agent_config(config)?;
    let target = resolve_output(output, config);
    let mut agent = open_agent(cli, config, settings, FileSink::new(&target))?
        .with_observer(progress_observer(cli.quiet));

    match agent.update_once().context("Update failed")? {
        UpdateOutcome::UpToDate => {
            if !cli.quiet {
                eprintln!("{} Already up to date", style("✓").green());
            }
        },
        UpdateOutcome::Installed { version, .. } => {
            if !cli.quiet {
                eprintln!(
                    "{} Installed {} to {}",
                    style("✓").green(),
                    style(&version).cyan().bold(),
                    style(target.display()).cyan()
                );
            }
        },
    }
    Ok(())
}

/// Keep the agent running until an image is committed or Ctrl-C.
pub(crate) fn cmd_run(cli: &Cli, config: &Config, output: Option<&Path>) -> Result<()> {
    let settings = agent_config(config)?;
    let target = resolve_output(output, config);
    info!(
        "Checking every {}s, keep-alive every {}s",
        settings.check_interval.as_secs(),
        settings.ping_interval.as_secs()
    );
    let mut agent = open_agent(cli, config, settings, FileSink::new(&target))?
        .with_observer(progress_observer(cli.quiet));

    match agent.run()? {
        RunExit::RestartRequested { version } => {
            if !cli.quiet {
                eprintln!(
                    "{} Firmware {} committed to {}; restart the device to boot it",
                    style("✓").green(),
                    style(&version).cyan().bold(),
                    style(target.display()).cyan()
                );
            }
            Ok(())
        },
        RunExit::Interrupted => Err(CliError::Cancelled("Interrupted".into()).into()),
    }
}
