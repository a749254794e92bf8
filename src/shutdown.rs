//! Safe shutdown sequence.
//!
//! Shared by the init controller, the in-image `reboot`/`poweroff`/`halt`
//! wrappers and `ramroot shutdown` on a host:
//!
//! 1. sync
//! 2. export every imported pool, before any generic unmount
//! 3. unmount non-essential filesystems, newest first
//! 4. sync
//! 5. the terminal action
//!
//! Failures are logged and the sequence continues; the terminal action
//! always runs.

use anyhow::{bail, Context, Result};
use nix::mount::{umount2, MntFlags};
use nix::sys::reboot::{reboot, RebootMode};
use serde::Serialize;
use std::fmt;
use std::fs;

use crate::process::Cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalAction {
    Reboot,
    PowerOff,
    Halt,
}

impl TerminalAction {
    /// Action for a wrapper invoked as `name` (argv[0] basename).
    pub fn from_command_name(name: &str) -> Option<Self> {
        match name {
            "reboot" => Some(TerminalAction::Reboot),
            "poweroff" => Some(TerminalAction::PowerOff),
            "halt" => Some(TerminalAction::Halt),
            _ => None,
        }
    }

    fn mode(self) -> RebootMode {
        match self {
            TerminalAction::Reboot => RebootMode::RB_AUTOBOOT,
            TerminalAction::PowerOff => RebootMode::RB_POWER_OFF,
            TerminalAction::Halt => RebootMode::RB_HALT_SYSTEM,
        }
    }
}

impl fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminalAction::Reboot => "reboot",
            TerminalAction::PowerOff => "power-off",
            TerminalAction::Halt => "halt",
        })
    }
}

/// One line of /proc/self/mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
}

/// Mount points never unmounted by the sequence.
pub const ESSENTIAL_MOUNTS: &[&str] = &["/", "/proc", "/sys", "/dev", "/dev/pts", "/run"];

impl MountEntry {
    /// Pool datasets go away with the export; the rest is skipped by path.
    pub fn is_skipped(&self) -> bool {
        ESSENTIAL_MOUNTS.contains(&self.target.as_str())
            || self.fstype == "zfs"
            || self.fstype == "rootfs"
    }
}

/// Parse /proc/self/mounts, keeping mount order.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape_octal(source),
                target: unescape_octal(target),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Undo the kernel's `\040`-style escaping of mount fields.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        });
        match escape {
            Some(digits) => {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Side effects of the sequence.
pub trait ShutdownOps {
    fn sync(&mut self);
    fn active_pools(&mut self) -> Result<Vec<String>>;
    fn export_pool(&mut self, name: &str) -> Result<()>;
    fn mounts(&mut self) -> Result<Vec<MountEntry>>;
    fn unmount(&mut self, target: &str) -> Result<()>;
    /// Does not return on success.
    fn terminal(&mut self, action: TerminalAction) -> Result<()>;
}

/// What the sequence managed before the terminal action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub exported: Vec<String>,
    pub export_failures: Vec<String>,
    pub unmounted: Vec<String>,
    pub unmount_failures: Vec<String>,
}

/// Run the full sequence. Only returns if the terminal action failed.
pub fn run_shutdown(ops: &mut dyn ShutdownOps, action: TerminalAction) -> ShutdownReport {
    tracing::info!(%action, "shutting down");
    let mut report = ShutdownReport::default();

    ops.sync();

    match ops.active_pools() {
        Ok(pools) => {
            for pool in pools {
                match ops.export_pool(&pool) {
                    Ok(()) => {
                        tracing::info!(pool = %pool, "exported");
                        report.exported.push(pool);
                    }
                    Err(e) => {
                        tracing::warn!(pool = %pool, "export failed: {:#}", e);
                        report.export_failures.push(pool);
                    }
                }
            }
        }
        Err(e) => tracing::warn!("could not list pools: {:#}", e),
    }

    match ops.mounts() {
        Ok(mounts) => {
            for mount in mounts.iter().rev().filter(|m| !m.is_skipped()) {
                match ops.unmount(&mount.target) {
                    Ok(()) => report.unmounted.push(mount.target.clone()),
                    Err(e) => {
                        tracing::warn!(target = %mount.target, "unmount failed: {:#}", e);
                        report.unmount_failures.push(mount.target.clone());
                    }
                }
            }
        }
        Err(e) => tracing::warn!("could not read mount table: {:#}", e),
    }

    ops.sync();

    if let Err(e) = ops.terminal(action) {
        tracing::error!(%action, "terminal action failed: {:#}", e);
    }
    report
}

/// Real side effects: `zpool`, umount2(2), sync(2), reboot(2).
#[derive(Debug, Default)]
pub struct LiveShutdown;

impl ShutdownOps for LiveShutdown {
    fn sync(&mut self) {
        nix::unistd::sync();
    }

    fn active_pools(&mut self) -> Result<Vec<String>> {
        if !crate::process::exists("zpool") {
            return Ok(Vec::new());
        }
        let result = Cmd::new("zpool")
            .args(["list", "-H", "-o", "name"])
            .error_msg("zpool list failed")
            .run()?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn export_pool(&mut self, name: &str) -> Result<()> {
        Cmd::new("zpool")
            .args(["export", name])
            .error_msg(format!("zpool export {} failed", name))
            .run()?;
        Ok(())
    }

    fn mounts(&mut self) -> Result<Vec<MountEntry>> {
        let text = fs::read_to_string("/proc/self/mounts")
            .context("Failed to read /proc/self/mounts")?;
        Ok(parse_mounts(&text))
    }

    fn unmount(&mut self, target: &str) -> Result<()> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            // Busy: detach lazily so the terminal action is not blocked
            Err(nix::errno::Errno::EBUSY) => umount2(target, MntFlags::MNT_DETACH)
                .with_context(|| format!("lazy unmount of {} failed", target)),
            Err(e) => Err(e).with_context(|| format!("unmount of {} failed", target)),
        }
    }

    fn terminal(&mut self, action: TerminalAction) -> Result<()> {
        match reboot(action.mode()) {
            Ok(never) => match never {},
            Err(e) => bail!("reboot({}) failed: {}", action, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        pools: Vec<String>,
        fail_export: bool,
        mounts: Vec<MountEntry>,
    }

    impl ShutdownOps for Recorder {
        fn sync(&mut self) {
            self.calls.push("sync".into());
        }
        fn active_pools(&mut self) -> Result<Vec<String>> {
            Ok(self.pools.clone())
        }
        fn export_pool(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("export {}", name));
            if self.fail_export {
                bail!("pool is busy");
            }
            Ok(())
        }
        fn mounts(&mut self) -> Result<Vec<MountEntry>> {
            Ok(self.mounts.clone())
        }
        fn unmount(&mut self, target: &str) -> Result<()> {
            self.calls.push(format!("umount {}", target));
            Ok(())
        }
        fn terminal(&mut self, action: TerminalAction) -> Result<()> {
            self.calls.push(format!("terminal {}", action));
            Ok(())
        }
    }

    const MOUNTS: &str = "\
rootfs / rootfs rw 0 0
proc /proc proc rw 0 0
sysfs /sys sysfs rw 0 0
devtmpfs /dev devtmpfs rw 0 0
devpts /dev/pts devpts rw 0 0
tmpfs /run tmpfs rw 0 0
tmpfs /tmp tmpfs rw 0 0
tank/data /tank/data zfs rw 0 0
/dev/sda2 /mnt/old\\040root ext4 rw 0 0
/dev/sdb1 /target ext4 rw 0 0
";

    #[test]
    fn test_parse_mounts_unescapes() {
        let mounts = parse_mounts(MOUNTS);
        assert_eq!(mounts.len(), 10);
        assert_eq!(mounts[8].target, "/mnt/old root");
    }

    #[test]
    fn test_order_export_then_reverse_unmount() {
        let mut ops = Recorder {
            pools: vec!["tank".into()],
            mounts: parse_mounts(MOUNTS),
            ..Recorder::default()
        };
        let report = run_shutdown(&mut ops, TerminalAction::Reboot);
        assert_eq!(
            ops.calls,
            vec![
                "sync",
                "export tank",
                "umount /target",
                "umount /mnt/old root",
                "umount /tmp",
                "sync",
                "terminal reboot",
            ]
        );
        assert_eq!(report.exported, vec!["tank"]);
    }

    #[test]
    fn test_terminal_runs_after_export_failure() {
        let mut ops = Recorder {
            pools: vec!["tank".into(), "backup".into()],
            fail_export: true,
            ..Recorder::default()
        };
        let report = run_shutdown(&mut ops, TerminalAction::PowerOff);
        assert_eq!(report.export_failures, vec!["tank", "backup"]);
        assert_eq!(ops.calls.last().unwrap(), "terminal power-off");
    }

    #[test]
    fn test_wrapper_names() {
        assert_eq!(TerminalAction::from_command_name("halt"), Some(TerminalAction::Halt));
        assert_eq!(TerminalAction::from_command_name("init"), None);
    }
}
