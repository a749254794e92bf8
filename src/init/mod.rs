//! Process 1 of the booted environment.
//!
//! [`InitController`] walks the boot states against a [`SystemOps`]
//! implementation: [`LiveSystem`] on a real kernel, a recording fake in
//! tests.

pub mod cmdline;
pub mod controller;
pub mod live;
pub mod ops;
pub mod state;

pub use controller::InitController;
pub use live::LiveSystem;
pub use ops::{InitEvent, MountSpec, SystemOps};
pub use state::InitState;

use crate::config::BootConfig;

/// Boot configuration baked into the image, or defaults when unreadable.
pub fn load_boot_config(text: Option<&str>) -> BootConfig {
    match text.map(BootConfig::from_json) {
        Some(Ok(boot)) => boot,
        Some(Err(e)) => {
            tracing::warn!("boot configuration unreadable, using defaults: {:#}", e);
            BootConfig::default()
        }
        None => BootConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_boot_config_falls_back() {
        assert_eq!(load_boot_config(None), BootConfig::default());
        assert_eq!(load_boot_config(Some("{not json")), BootConfig::default());
        let boot = load_boot_config(Some(r#"{"hostname":"rescue"}"#));
        assert_eq!(boot.hostname, "rescue");
        assert_eq!(boot.ssh_port, 22);
    }
}
