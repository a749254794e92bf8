//! [`SystemOps`] against the running kernel.

use anyhow::{Context, Result};
use nix::mount::{mount, MsFlags};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use super::ops::{InitEvent, MountSpec, SystemOps};
use crate::config::DHCP_SCRIPT_PATH;
use crate::network::normalize_mac;
use crate::network::replay::LiveInterface;
use crate::process::Cmd;
use crate::shutdown::{LiveShutdown, MountEntry, ShutdownOps, TerminalAction};

/// Signals process 1 handles, all waited for synchronously.
pub const HANDLED_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
];

/// Terminal action requested by a signal.
pub fn action_for_signal(signal: Signal) -> Option<TerminalAction> {
    match signal {
        Signal::SIGTERM => Some(TerminalAction::Reboot),
        Signal::SIGUSR1 => Some(TerminalAction::PowerOff),
        Signal::SIGUSR2 => Some(TerminalAction::Halt),
        _ => None,
    }
}

pub struct LiveSystem {
    signals: SigSet,
    shutdown: LiveShutdown,
}

impl LiveSystem {
    /// Block the handled signals on the calling thread. Children started
    /// through `std::process` get an empty mask back.
    pub fn new() -> Result<Self> {
        let mut signals = SigSet::empty();
        for signal in HANDLED_SIGNALS {
            signals.add(signal);
        }
        signals
            .thread_block()
            .context("Failed to block init signals")?;
        Ok(Self {
            signals,
            shutdown: LiveShutdown,
        })
    }

    fn reap(&mut self) -> Vec<u32> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        reaped.push(pid.as_raw() as u32);
                    }
                }
            }
        }
        reaped
    }
}

impl ShutdownOps for LiveSystem {
    fn sync(&mut self) {
        self.shutdown.sync();
    }

    fn active_pools(&mut self) -> Result<Vec<String>> {
        self.shutdown.active_pools()
    }

    fn export_pool(&mut self, name: &str) -> Result<()> {
        self.shutdown.export_pool(name)
    }

    fn mounts(&mut self) -> Result<Vec<MountEntry>> {
        self.shutdown.mounts()
    }

    fn unmount(&mut self, target: &str) -> Result<()> {
        self.shutdown.unmount(target)
    }

    fn terminal(&mut self, action: TerminalAction) -> Result<()> {
        self.shutdown.terminal(action)
    }
}

impl SystemOps for LiveSystem {
    fn mkdir_p(&mut self, path: &str) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path))
    }

    fn mount(&mut self, spec: &MountSpec) -> Result<()> {
        mount(
            Some(spec.source),
            spec.target,
            Some(spec.fstype),
            MsFlags::MS_NOSUID,
            spec.options.as_deref(),
        )
        .with_context(|| format!("mount -t {} {} {}", spec.fstype, spec.source, spec.target))
    }

    fn set_hostname(&mut self, name: &str) -> Result<()> {
        nix::unistd::sethostname(name).context("sethostname failed")
    }

    fn modprobe(&mut self, module: &str) -> Result<()> {
        Cmd::new("modprobe").arg(module).run()?;
        Ok(())
    }

    fn read_file(&mut self, path: &str) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path)),
        }
    }

    fn write_file(&mut self, path: &str, contents: &str) -> Result<()> {
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path))
    }

    fn file_exists(&mut self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn interfaces(&mut self) -> Result<Vec<LiveInterface>> {
        let mut found = Vec::new();
        for entry in fs::read_dir("/sys/class/net").context("Failed to list /sys/class/net")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" {
                continue;
            }
            let Ok(address) = fs::read_to_string(entry.path().join("address")) else {
                continue;
            };
            match normalize_mac(&address) {
                Some(mac) if mac != "00:00:00:00:00:00" => found.push(LiveInterface { name, mac }),
                _ => {}
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    fn ip(&mut self, args: &[String]) -> Result<()> {
        Cmd::new("ip").args(args).run()?;
        Ok(())
    }

    fn dhcp(&mut self, ifname: &str, timeout: Duration) -> Result<()> {
        Cmd::new("udhcpc")
            .args(["-f", "-q", "-n", "-t", "1"])
            .args(["-T", &timeout.as_secs().max(1).to_string()])
            .args(["-i", ifname, "-s", DHCP_SCRIPT_PATH])
            .error_msg(format!("udhcpc on {} got no lease", ifname))
            .run()?;
        Ok(())
    }

    fn import_pools(&mut self) -> Result<Vec<String>> {
        Cmd::new("zpool")
            .args(["import", "-a", "-N"])
            .error_msg("zpool import failed")
            .run()?;
        self.shutdown.active_pools()
    }

    fn generate_host_key(&mut self, path: &str) -> Result<()> {
        Cmd::new("dropbearkey")
            .args(["-t", "ed25519", "-f", path])
            .error_msg("dropbearkey failed")
            .run()?;
        Ok(())
    }

    fn start_sshd(&mut self, port: u16, host_keys: &[String]) -> Result<()> {
        // Foreground, so the server is a direct child and gets reaped here
        let mut cmd = Cmd::new("dropbear")
            .args(["-F", "-E", "-s", "-g"])
            .args(["-p", &port.to_string()]);
        for key in host_keys {
            cmd = cmd.args(["-r", key.as_str()]);
        }
        let child = cmd.spawn()?;
        tracing::debug!(pid = child.id(), "dropbear started");
        Ok(())
    }

    fn spawn_console(&mut self, shell: &str) -> Result<u32> {
        let child = Cmd::new("setsid")
            .args(["-c", shell, "-l"])
            .env("HOME", "/root")
            .env("TERM", "linux")
            .dir(Path::new("/root"))
            .spawn()?;
        Ok(child.id())
    }

    fn wait_event(&mut self) -> Result<InitEvent> {
        loop {
            let signal = self.signals.wait().context("sigwait failed")?;
            if signal == Signal::SIGCHLD {
                return Ok(InitEvent::ChildrenExited(self.reap()));
            }
            if let Some(action) = action_for_signal(signal) {
                tracing::info!(signal = %signal, %action, "shutdown requested");
                return Ok(InitEvent::Signal(action));
            }
        }
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn announce(&mut self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}
