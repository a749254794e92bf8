//! Shutdown command - the safe shutdown sequence on the current host.

use anyhow::{bail, Result};

use crate::error::LaunchError;
use crate::prompt::{confirm, Prompter};
use crate::shutdown::{run_shutdown, LiveShutdown, TerminalAction};

/// Execute the shutdown command. Returns only if the terminal action failed.
pub fn cmd_shutdown(
    action: TerminalAction,
    assume_yes: bool,
    prompter: &mut dyn Prompter,
) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("ramroot shutdown must run as root");
    }
    if !assume_yes {
        let question = format!(
            "Export all pools, unmount, and {} this machine? Type 'yes':",
            action
        );
        if !confirm(prompter, &question)? {
            return Err(LaunchError::aborted("shutdown").into());
        }
    }

    let report = run_shutdown(&mut LiveShutdown, action);
    bail!(
        "{} did not take effect (exported {:?}, export failures {:?})",
        action,
        report.exported,
        report.export_failures
    )
}
