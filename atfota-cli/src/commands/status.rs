//! `status`: signal quality and connection state.

use anyhow::Result;
use atfota::{Diagnostics, MemorySink};
use console::style;

use crate::Cli;
use crate::commands::{agent_config, open_agent, resolve_port};
use crate::config::Config;

fn diagnostics_json(port: &str, diag: &Diagnostics) -> serde_json::Value {
    serde_json::json!({
        "port": port,
        "signal": diag.signal.map(|s| serde_json::json!({
            "rssi": s.rssi,
            "ber": s.ber,
            "dbm": s.dbm(),
        })),
        "connection": diag.connection.to_string(),
    })
}

/// Query the modem without touching the data link.
pub(crate) fn cmd_status(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    // Identity and server are optional for a status query.
    let settings = agent_config(config).unwrap_or_default();
    let port = resolve_port(cli, config)?;
    let agent = open_agent(cli, config, settings, MemorySink::new())?;
    let diag = agent.diagnostics()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&diagnostics_json(&port, &diag))?
        );
        return Ok(());
    }

    eprintln!("{}", style("Modem status").bold().underlined());
    eprintln!("  Port:       {}", style(&port).cyan());
    match diag.signal {
        Some(signal) => eprintln!("  Signal:     {signal}"),
        None => eprintln!("  Signal:     {}", style("not reported").dim()),
    }
    eprintln!("  Connection: {}", diag.connection);
    Ok(())
}
