//! Capture-network command - prints what launch would carry over.

use anyhow::Result;

use crate::config::BuildConfig;
use crate::network::capture::capture_host;
use crate::network::dns::select_nameservers;

/// Execute the capture-network command.
pub fn cmd_capture_network(config: &BuildConfig) -> Result<()> {
    let identity = capture_host()?;
    print!("{}", identity.to_json()?);

    let (servers, source) = select_nameservers(&config.host_root);
    eprintln!("nameservers ({:?}):", source);
    for server in servers {
        eprintln!("  {}", server);
    }
    Ok(())
}
