//! Shell completion generation.

use std::env;
use std::io;
use std::path::Path;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::{Cli, CliError};

/// Write the completion script for `shell` (or the detected shell) to stdout.
pub(crate) fn cmd_completions(shell: Option<Shell>) -> Result<()> {
    let shell = shell
        .or_else(|| env::var("SHELL").ok().as_deref().and_then(shell_from_path))
        .ok_or_else(|| {
            CliError::Usage(
                "Could not detect your shell; pass one explicitly, e.g.: atfota completions bash"
                    .into(),
            )
        })?;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
    Ok(())
}

/// Map a shell binary path like `/usr/bin/zsh` to its [`Shell`].
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    match Path::new(shell_path).file_name()?.to_str()? {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}
