//! Side effects of the init controller.

use anyhow::Result;
use std::time::Duration;

use crate::network::replay::LiveInterface;
use crate::shutdown::{ShutdownOps, TerminalAction};

/// One filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: &'static str,
    pub target: &'static str,
    pub fstype: &'static str,
    pub options: Option<String>,
}

impl MountSpec {
    pub fn new(source: &'static str, target: &'static str, fstype: &'static str) -> Self {
        Self {
            source,
            target,
            fstype,
            options: None,
        }
    }

    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }
}

/// What woke the idle loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitEvent {
    Signal(TerminalAction),
    /// Reaped children, by pid. May be empty.
    ChildrenExited(Vec<u32>),
}

/// Everything the controller does to the machine. Paths are absolute in
/// the running environment.
pub trait SystemOps: ShutdownOps {
    fn mkdir_p(&mut self, path: &str) -> Result<()>;
    fn mount(&mut self, spec: &MountSpec) -> Result<()>;
    fn set_hostname(&mut self, name: &str) -> Result<()>;
    fn modprobe(&mut self, module: &str) -> Result<()>;
    /// `None` when the file does not exist.
    fn read_file(&mut self, path: &str) -> Result<Option<String>>;
    fn write_file(&mut self, path: &str, contents: &str) -> Result<()>;
    fn file_exists(&mut self, path: &str) -> bool;
    /// Network interfaces other than loopback, sorted by name.
    fn interfaces(&mut self) -> Result<Vec<LiveInterface>>;
    fn ip(&mut self, args: &[String]) -> Result<()>;
    /// One DHCP attempt bounded by `timeout`.
    fn dhcp(&mut self, ifname: &str, timeout: Duration) -> Result<()>;
    /// Import every visible pool without mounting; returns imported pool names.
    fn import_pools(&mut self) -> Result<Vec<String>>;
    fn generate_host_key(&mut self, path: &str) -> Result<()>;
    fn start_sshd(&mut self, port: u16, host_keys: &[String]) -> Result<()>;
    /// Start an interactive session on the console; returns its pid.
    fn spawn_console(&mut self, shell: &str) -> Result<u32>;
    /// Block until a signal arrives.
    fn wait_event(&mut self) -> Result<InitEvent>;
    fn sleep(&mut self, duration: Duration);
    /// Operator facing console output.
    fn announce(&mut self, text: &str);
}
