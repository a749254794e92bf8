//! ramroot library exports.
//!
//! Both binaries and the integration tests under `tests/` build on these
//! modules.

pub mod build;
pub mod commands;
pub mod config;
pub mod error;
pub mod image;
pub mod init;
pub mod launch;
pub mod logging;
pub mod network;
pub mod preflight;
pub mod process;
pub mod prompt;
pub mod resolve;
pub mod shutdown;
pub mod timing;
