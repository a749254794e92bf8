//! Show-config command - displays configuration.

use anyhow::Result;

use crate::config::BuildConfig;

/// Execute the show-config command.
pub fn cmd_show_config(config: &BuildConfig) -> Result<()> {
    config.print();
    println!();
    println!("Boot configuration (etc/ramroot/boot.json):");
    print!("{}", config.boot.to_json()?);
    Ok(())
}
