//! Logging setup shared by both binaries.

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "RAMROOT_LOG";

/// Install the global subscriber. `ansi` is off on the init console.
pub fn init(ansi: bool) {
    init_with_default(ansi, "info");
}

pub fn init_with_default(ansi: bool, default_directive: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Filter of a subscriber installed by [`init_reloadable`].
pub struct FilterHandle(reload::Handle<EnvFilter, Registry>);

impl FilterHandle {
    /// Replace the active filter directives.
    pub fn set(&self, directives: &str) -> anyhow::Result<()> {
        self.0
            .reload(EnvFilter::new(directives))
            .context("Failed to change log filter")
    }
}

/// Like [`init`], but the filter can be changed later. Used by process 1,
/// which learns about `ramroot.debug` only after /proc is mounted.
pub fn init_reloadable(ansi: bool) -> Option<FilterHandle> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(ansi)
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .ok()?;
    Some(FilterHandle(handle))
}
