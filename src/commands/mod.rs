//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Assemble and package the image
//! - `bundle` - Write the self-extracting artifact
//! - `launch` - Inject identity and switch kernels
//! - `network` - Print the captured network identity
//! - `preflight` - Run preflight checks
//! - `show` - Display configuration
//! - `shutdown` - Safe shutdown of the current host

pub mod build;
pub mod bundle;
pub mod launch;
pub mod network;
mod preflight;
pub mod show;
pub mod shutdown;

pub use build::cmd_build;
pub use bundle::cmd_bundle;
pub use launch::cmd_launch;
pub use network::cmd_capture_network;
pub use preflight::cmd_preflight;
pub use show::cmd_show_config;
pub use shutdown::cmd_shutdown;
