//! The process 1 state machine.
//!
//! Boot runs each state once, in order, then idles serving signals and the
//! console. Only a VFS mount failure stops progression; every later failure
//! is logged, possibly recorded as a [`Degradation`], and the machine moves on.

use std::time::Duration;

use super::cmdline::{parse_cmdline, KernelArgs};
use super::ops::{InitEvent, MountSpec, SystemOps};
use super::state::InitState;
use crate::config::{BootConfig, EPHEMERAL_KEY_MARKER};
use crate::error::{Degradation, InitError};
use crate::launch::ssh::HostKeyAlgorithm;
use crate::network::replay::{plan_replay, LiveInterface, ReplayAction};
use crate::network::{NetworkIdentity, NETWORK_CONFIG_PATH};
use crate::shutdown::{run_shutdown, ShutdownReport, TerminalAction};

pub const STATUS_DIR: &str = "/run/ramroot";
pub const STATUS_PATH: &str = "/run/ramroot/status";
pub const MOTD_PATH: &str = "/run/ramroot/motd";

const ZFS_ARC_MAX_PARAM: &str = "/sys/module/zfs/parameters/zfs_arc_max";
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

pub struct InitController<O: SystemOps> {
    ops: O,
    boot: BootConfig,
    state: InitState,
    completed: Vec<InitState>,
    degradations: Vec<Degradation>,
    kernel_args: KernelArgs,
    /// "ifname addr/prefix" for every address configured.
    addresses: Vec<String>,
    pools: Vec<String>,
    ssh_started: bool,
    console: Option<u32>,
}

impl<O: SystemOps> InitController<O> {
    pub fn new(ops: O, boot: BootConfig) -> Self {
        Self {
            ops,
            boot,
            state: InitState::MountVfs,
            completed: Vec::new(),
            degradations: Vec::new(),
            kernel_args: KernelArgs::default(),
            addresses: Vec::new(),
            pools: Vec::new(),
            ssh_started: false,
            console: None,
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn completed(&self) -> &[InitState] {
        &self.completed
    }

    pub fn degradations(&self) -> &[Degradation] {
        &self.degradations
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut O {
        &mut self.ops
    }

    /// Run the current boot state and advance. Entering Idle starts the
    /// console.
    pub fn step(&mut self) -> Result<(), InitError> {
        let current = self.state;
        tracing::info!(state = %current, "entering");

        match current {
            InitState::MountVfs => {
                if let Err(e) = self.mount_vfs() {
                    tracing::error!("{}", e);
                    self.enter_emergency();
                    return Err(e);
                }
            }
            InitState::LoadModules => self.load_modules(),
            InitState::SetupNetwork => self.setup_network(),
            InitState::ImportStorage => self.import_storage(),
            InitState::StartServices => self.start_services(),
            InitState::Idle | InitState::ShuttingDown(_) | InitState::Emergency => return Ok(()),
        }

        self.completed.push(current);
        if let Some(next) = current.next() {
            self.state = next;
        }
        self.write_status();
        if self.state == InitState::Idle {
            self.enter_idle();
        }
        Ok(())
    }

    /// Step until Idle or Emergency.
    pub fn boot_to_idle(&mut self) {
        while self.state.next().is_some() {
            if self.step().is_err() {
                break;
            }
        }
    }

    /// React to one event. Returns the terminal action when a shutdown
    /// signal arrived.
    pub fn handle_event(&mut self, event: InitEvent) -> Option<TerminalAction> {
        match event {
            InitEvent::Signal(action) => Some(action),
            InitEvent::ChildrenExited(pids) => {
                for pid in &pids {
                    tracing::debug!(pid, "reaped");
                }
                if let Some(console) = self.console {
                    if pids.contains(&console) {
                        tracing::info!(pid = console, "console session ended, respawning");
                        self.console = None;
                        self.ops.sleep(RESPAWN_DELAY);
                        self.spawn_console();
                    }
                }
                None
            }
        }
    }

    /// Run the safe shutdown sequence and the terminal action.
    pub fn shutdown(&mut self, action: TerminalAction) -> ShutdownReport {
        self.state = InitState::ShuttingDown(action);
        self.write_status();
        run_shutdown(&mut self.ops, action)
    }

    /// Serve events until a shutdown signal, then shut down. Returns only if
    /// the terminal action did not take effect.
    pub fn serve(&mut self) -> ShutdownReport {
        loop {
            let event = match self.ops.wait_event() {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("waiting for events failed: {:#}", e);
                    self.ops.sleep(RESPAWN_DELAY);
                    continue;
                }
            };
            if let Some(action) = self.handle_event(event) {
                return self.shutdown(action);
            }
        }
    }

    /// Boot, then serve.
    pub fn run(&mut self) -> ShutdownReport {
        self.boot_to_idle();
        self.serve()
    }

    fn mount_vfs(&mut self) -> Result<(), InitError> {
        let mut run = String::from("mode=0755");
        if let Some(size) = &self.boot.run_size {
            run.push_str(&format!(",size={}", size));
        }
        let mut tmp = String::from("mode=1777");
        if let Some(size) = &self.boot.tmp_size {
            tmp.push_str(&format!(",size={}", size));
        }

        let mounts = [
            MountSpec::new("proc", "/proc", "proc"),
            MountSpec::new("sysfs", "/sys", "sysfs"),
            MountSpec::new("devtmpfs", "/dev", "devtmpfs").options("mode=0755"),
            MountSpec::new("devpts", "/dev/pts", "devpts").options("mode=0620,ptmxmode=0666"),
            MountSpec::new("tmpfs", "/run", "tmpfs").options(run),
            MountSpec::new("tmpfs", "/tmp", "tmpfs").options(tmp),
        ];

        for spec in &mounts {
            let failed = |reason: String| InitError::MountFailed {
                target: spec.target.to_string(),
                fstype: spec.fstype.to_string(),
                reason,
            };
            // /dev/pts lives inside the fresh devtmpfs
            self.ops
                .mkdir_p(spec.target)
                .map_err(|e| failed(format!("{:#}", e)))?;
            self.ops.mount(spec).map_err(|e| failed(format!("{:#}", e)))?;
        }

        for dir in [STATUS_DIR, "/run/lock"] {
            if let Err(e) = self.ops.mkdir_p(dir) {
                tracing::warn!(dir, "could not create: {:#}", e);
            }
        }
        Ok(())
    }

    fn load_modules(&mut self) {
        let modules = self.boot.modules.clone();
        for module in &modules {
            match self.ops.modprobe(module) {
                Ok(()) => tracing::debug!(module = %module, "loaded"),
                Err(e) => {
                    tracing::warn!(module = %module, "modprobe failed: {:#}", e);
                    if module == "zfs" {
                        self.degrade(Degradation::PoolModuleUnavailable);
                    }
                }
            }
        }

        if let Some(arc_max) = self.boot.zfs_arc_max {
            if let Err(e) = self.ops.write_file(ZFS_ARC_MAX_PARAM, &format!("{}\n", arc_max)) {
                tracing::warn!("could not set zfs_arc_max: {:#}", e);
            }
        }
    }

    fn setup_network(&mut self) {
        let hostname = self.boot.hostname.clone();
        if let Err(e) = self.ops.set_hostname(&hostname) {
            tracing::warn!(hostname = %hostname, "could not set hostname: {:#}", e);
        }
        self.run_ip(&ReplayAction::LinkUp {
            ifname: "lo".to_string(),
        });

        self.kernel_args = match self.ops.read_file("/proc/cmdline") {
            Ok(Some(text)) => parse_cmdline(&text),
            Ok(None) => KernelArgs::default(),
            Err(e) => {
                tracing::warn!("could not read kernel command line: {:#}", e);
                KernelArgs::default()
            }
        };

        let live = match self.ops.interfaces() {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!("could not enumerate interfaces: {:#}", e);
                Vec::new()
            }
        };

        let mut configured = match self.captured_identity() {
            Some(identity) => self.replay(&identity, &live),
            None => false,
        };
        if !configured && self.kernel_args.has_static_address() {
            configured = self.apply_kernel_args(&live);
        }
        if !configured {
            configured = self.dhcp(&live);
        }
        if !configured {
            tracing::warn!("no interface configured, continuing without network");
            self.degrade(Degradation::NetworkDegraded);
        }
    }

    fn captured_identity(&mut self) -> Option<NetworkIdentity> {
        match self.ops.read_file(NETWORK_CONFIG_PATH) {
            Ok(Some(text)) => match NetworkIdentity::from_json(&text) {
                Ok(identity) if !identity.is_empty() => Some(identity),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("ignoring {}: {:#}", NETWORK_CONFIG_PATH, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("could not read {}: {:#}", NETWORK_CONFIG_PATH, e);
                None
            }
        }
    }

    fn replay(&mut self, identity: &NetworkIdentity, live: &[LiveInterface]) -> bool {
        let plan = plan_replay(identity, live);
        for mac in &plan.missing {
            tracing::warn!(mac = %mac, "captured interface not present");
        }
        let mut configured = false;
        for action in &plan.actions {
            if self.run_ip(action) {
                if let ReplayAction::AddAddress { ifname, cidr } = action {
                    self.addresses.push(format!("{} {}", ifname, cidr));
                    configured = true;
                }
            }
        }
        configured
    }

    fn apply_kernel_args(&mut self, live: &[LiveInterface]) -> bool {
        let Some(cidr) = self.kernel_args.ip else {
            return false;
        };
        let Some(ifname) = self.pick_interface(live) else {
            tracing::warn!("ramroot.ip given but no matching interface");
            return false;
        };

        let mut actions = vec![
            ReplayAction::LinkUp {
                ifname: ifname.clone(),
            },
            ReplayAction::AddAddress {
                ifname: ifname.clone(),
                cidr,
            },
        ];
        if let Some(via) = self.kernel_args.gateway {
            actions.push(ReplayAction::DefaultRoute {
                ifname: ifname.clone(),
                via,
                metric: None,
                onlink: !cidr.contains(via),
            });
        }

        let mut configured = false;
        for action in &actions {
            if self.run_ip(action) && matches!(action, ReplayAction::AddAddress { .. }) {
                self.addresses.push(format!("{} {}", ifname, cidr));
                configured = true;
            }
        }
        configured
    }

    fn dhcp(&mut self, live: &[LiveInterface]) -> bool {
        let Some(ifname) = self.pick_interface(live) else {
            tracing::warn!("no network interface for DHCP");
            return false;
        };
        self.run_ip(&ReplayAction::LinkUp {
            ifname: ifname.clone(),
        });

        let retries = self.boot.dhcp_retries.max(1);
        let timeout = Duration::from_secs(self.boot.dhcp_timeout_secs);
        for attempt in 1..=retries {
            match self.ops.dhcp(&ifname, timeout) {
                Ok(()) => {
                    tracing::info!(interface = %ifname, attempt, "DHCP lease obtained");
                    self.addresses.push(format!("{} dhcp", ifname));
                    return true;
                }
                Err(e) => {
                    tracing::warn!(interface = %ifname, attempt, retries, "DHCP failed: {:#}", e)
                }
            }
        }
        false
    }

    /// The interface named by `ramroot.mac`, else the first one found.
    fn pick_interface(&self, live: &[LiveInterface]) -> Option<String> {
        let chosen = match &self.kernel_args.mac {
            Some(mac) => live.iter().find(|l| &l.mac == mac),
            None => live.first(),
        };
        chosen.map(|l| l.name.clone())
    }

    fn run_ip(&mut self, action: &ReplayAction) -> bool {
        let args = action.ip_args();
        match self.ops.ip(&args) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(command = %format!("ip {}", args.join(" ")), "failed: {:#}", e);
                false
            }
        }
    }

    fn import_storage(&mut self) {
        match self.ops.import_pools() {
            Ok(pools) if pools.is_empty() => {
                tracing::info!("no storage pools found");
                self.degrade(Degradation::NoStoragePools);
            }
            Ok(pools) => {
                tracing::info!(pools = %pools.join(", "), "storage pools imported");
                self.pools = pools;
            }
            Err(e) => {
                tracing::warn!("pool import failed: {:#}", e);
                self.degrade(Degradation::NoStoragePools);
            }
        }
    }

    fn start_services(&mut self) {
        if self.ops.file_exists(EPHEMERAL_KEY_MARKER) {
            self.degrade(Degradation::EphemeralHostKey);
        }

        let mut keys: Vec<String> = HostKeyAlgorithm::ALL
            .iter()
            .map(|alg| alg.dropbear_path())
            .filter(|path| self.ops.file_exists(path))
            .collect();

        if keys.is_empty() {
            let path = HostKeyAlgorithm::Ed25519.dropbear_path();
            tracing::warn!("no provisioned host keys, generating an ephemeral ed25519 key");
            match self.ops.generate_host_key(&path) {
                Ok(()) => keys.push(path),
                Err(e) => tracing::warn!("host key generation failed: {:#}", e),
            }
            self.degrade(Degradation::EphemeralHostKey);
        }

        if keys.is_empty() {
            self.degrade(Degradation::SshUnavailable);
            return;
        }
        match self.ops.start_sshd(self.boot.ssh_port, &keys) {
            Ok(()) => {
                tracing::info!(port = self.boot.ssh_port, "ssh server started");
                self.ssh_started = true;
            }
            Err(e) => {
                tracing::warn!("ssh server failed to start: {:#}", e);
                self.degrade(Degradation::SshUnavailable);
            }
        }
    }

    fn enter_idle(&mut self) {
        let motd = self.motd();
        if let Err(e) = self.ops.write_file(MOTD_PATH, &motd) {
            tracing::debug!("could not write motd: {:#}", e);
        }
        self.ops.announce(&motd);
        self.spawn_console();
    }

    fn enter_emergency(&mut self) {
        self.state = InitState::Emergency;
        self.ops
            .announce("ramroot: mounting system filesystems failed, emergency shell only\n");
        self.spawn_console();
    }

    fn spawn_console(&mut self) {
        let shell = self.boot.console_shell.clone();
        let shell = if self.ops.file_exists(&shell) {
            shell
        } else {
            "/bin/sh".to_string()
        };
        match self.ops.spawn_console(&shell) {
            Ok(pid) => self.console = Some(pid),
            Err(e) => tracing::error!(shell = %shell, "could not start console: {:#}", e),
        }
    }

    fn degrade(&mut self, degradation: Degradation) {
        if !self.degradations.contains(&degradation) {
            tracing::warn!("{}", degradation);
            self.degradations.push(degradation);
        }
    }

    /// Contents of the status file.
    pub fn status(&self) -> String {
        let mut out = format!("state: {}\n", self.state);
        for state in &self.completed {
            out.push_str(&format!("completed: {}\n", state.name()));
        }
        for degradation in &self.degradations {
            out.push_str(&format!("degraded: {}\n", degradation));
        }
        out
    }

    fn write_status(&mut self) {
        if matches!(self.completed.first(), Some(InitState::MountVfs)) {
            let status = self.status();
            if let Err(e) = self.ops.write_file(STATUS_PATH, &status) {
                tracing::debug!("could not write status: {:#}", e);
            }
        }
    }

    /// Summary printed before the console starts.
    pub fn motd(&self) -> String {
        let mut out = format!(
            "\nramroot maintenance environment ({})\n\n",
            self.boot.hostname
        );
        if self.addresses.is_empty() {
            out.push_str("  network:  not configured\n");
        }
        for address in &self.addresses {
            out.push_str(&format!("  network:  {}\n", address));
        }
        if self.ssh_started {
            out.push_str(&format!(
                "  ssh:      port {}, public key only\n",
                self.boot.ssh_port
            ));
        } else {
            out.push_str("  ssh:      not running\n");
        }
        if self.pools.is_empty() {
            out.push_str("  pools:    none imported\n");
        } else {
            out.push_str(&format!("  pools:    {}\n", self.pools.join(", ")));
        }
        for degradation in &self.degradations {
            out.push_str(&format!("  warning:  {}\n", degradation));
        }
        out.push_str("\nLeave with `reboot`, `poweroff` or `halt`; pools are exported first.\n\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::{MountEntry, ShutdownOps};
    use anyhow::{bail, Result};
    use std::collections::{HashMap, HashSet, VecDeque};

    #[derive(Default)]
    struct FakeSystem {
        calls: Vec<String>,
        files: HashMap<String, String>,
        existing: HashSet<String>,
        interfaces: Vec<LiveInterface>,
        fail_mount: Option<&'static str>,
        fail_modules: HashSet<String>,
        dhcp_failures: u32,
        pools: Vec<String>,
        events: VecDeque<InitEvent>,
        next_pid: u32,
    }

    impl ShutdownOps for FakeSystem {
        fn sync(&mut self) {
            self.calls.push("sync".into());
        }
        fn active_pools(&mut self) -> Result<Vec<String>> {
            Ok(self.pools.clone())
        }
        fn export_pool(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("export {}", name));
            Ok(())
        }
        fn mounts(&mut self) -> Result<Vec<MountEntry>> {
            Ok(Vec::new())
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

    impl SystemOps for FakeSystem {
        fn mkdir_p(&mut self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn mount(&mut self, spec: &MountSpec) -> Result<()> {
            let line = match &spec.options {
                Some(options) => format!("mount {} {} {}", spec.fstype, spec.target, options),
                None => format!("mount {} {}", spec.fstype, spec.target),
            };
            self.calls.push(line);
            if self.fail_mount == Some(spec.target) {
                bail!("permission denied");
            }
            Ok(())
        }
        fn set_hostname(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("hostname {}", name));
            Ok(())
        }
        fn modprobe(&mut self, module: &str) -> Result<()> {
            self.calls.push(format!("modprobe {}", module));
            if self.fail_modules.contains(module) {
                bail!("module not found");
            }
            Ok(())
        }
        fn read_file(&mut self, path: &str) -> Result<Option<String>> {
            Ok(self.files.get(path).cloned())
        }
        fn write_file(&mut self, path: &str, contents: &str) -> Result<()> {
            self.files.insert(path.to_string(), contents.to_string());
            Ok(())
        }
        fn file_exists(&mut self, path: &str) -> bool {
            self.existing.contains(path) || self.files.contains_key(path)
        }
        fn interfaces(&mut self) -> Result<Vec<LiveInterface>> {
            Ok(self.interfaces.clone())
        }
        fn ip(&mut self, args: &[String]) -> Result<()> {
            self.calls.push(format!("ip {}", args.join(" ")));
            Ok(())
        }
        fn dhcp(&mut self, ifname: &str, _timeout: Duration) -> Result<()> {
            self.calls.push(format!("dhcp {}", ifname));
            if self.dhcp_failures > 0 {
                self.dhcp_failures -= 1;
                bail!("no lease");
            }
            Ok(())
        }
        fn import_pools(&mut self) -> Result<Vec<String>> {
            self.calls.push("import".into());
            Ok(self.pools.clone())
        }
        fn generate_host_key(&mut self, path: &str) -> Result<()> {
            self.calls.push(format!("keygen {}", path));
            self.existing.insert(path.to_string());
            Ok(())
        }
        fn start_sshd(&mut self, port: u16, host_keys: &[String]) -> Result<()> {
            self.calls.push(format!("sshd {} {}", port, host_keys.join(",")));
            Ok(())
        }
        fn spawn_console(&mut self, shell: &str) -> Result<u32> {
            self.next_pid += 1;
            self.calls.push(format!("console {} {}", shell, self.next_pid));
            Ok(self.next_pid)
        }
        fn wait_event(&mut self) -> Result<InitEvent> {
            match self.events.pop_front() {
                Some(event) => Ok(event),
                None => bail!("no more events"),
            }
        }
        fn sleep(&mut self, _duration: Duration) {}
        fn announce(&mut self, _text: &str) {}
    }

    fn live(name: &str, mac: &str) -> LiveInterface {
        LiveInterface {
            name: name.into(),
            mac: mac.into(),
        }
    }

    fn has(calls: &[String], prefix: &str) -> bool {
        calls.iter().any(|c| c.starts_with(prefix))
    }

    #[test]
    fn test_boot_reaches_idle_with_console() {
        let mut ops = FakeSystem::default();
        ops.interfaces = vec![live("eth0", "52:54:00:00:00:01")];
        ops.pools = vec!["tank".into()];
        ops.existing
            .insert(HostKeyAlgorithm::Ed25519.dropbear_path());
        ops.existing.insert("/bin/bash".into());

        let mut init = InitController::new(ops, BootConfig::default());
        init.boot_to_idle();

        assert_eq!(init.state(), InitState::Idle);
        assert_eq!(init.completed().len(), 5);
        assert!(init.degradations().is_empty());
        let calls = &init.ops().calls;
        assert!(has(calls, "dhcp eth0"));
        assert!(has(calls, "sshd 22 /etc/dropbear/dropbear_ed25519_host_key"));
        assert_eq!(calls.last().unwrap(), "console /bin/bash 1");

        let status = &init.ops().files[STATUS_PATH];
        assert!(status.starts_with("state: idle\n"));
        assert!(status.contains("completed: start-services\n"));
        assert!(init.ops().files[MOTD_PATH].contains("pools:    tank"));
    }

    #[test]
    fn test_tmpfs_quotas_only_when_configured() {
        let boot = BootConfig {
            tmp_size: Some("50%".into()),
            ..BootConfig::default()
        };
        let mut init = InitController::new(FakeSystem::default(), boot);
        init.step().unwrap();
        let calls = &init.ops().calls;
        assert!(calls.contains(&"mount tmpfs /tmp mode=1777,size=50%".to_string()));
        assert!(calls.contains(&"mount tmpfs /run mode=0755".to_string()));
    }

    #[test]
    fn test_mount_failure_enters_emergency() {
        let ops = FakeSystem {
            fail_mount: Some("/sys"),
            ..FakeSystem::default()
        };
        let mut init = InitController::new(ops, BootConfig::default());
        init.boot_to_idle();

        assert_eq!(init.state(), InitState::Emergency);
        assert!(init.completed().is_empty());
        let calls = &init.ops().calls;
        assert!(!has(calls, "modprobe"));
        assert!(has(calls, "console /bin/sh"));
    }

    #[test]
    fn test_replay_preferred_over_dhcp() {
        let identity = r#"{"interfaces":[{"mac":"52:54:00:00:00:02","host_name":"eno2",
            "addresses":["10.0.0.5/24"],"gateway":"10.0.0.1"}]}"#;
        let mut ops = FakeSystem::default();
        ops.files
            .insert(NETWORK_CONFIG_PATH.to_string(), identity.to_string());
        ops.interfaces = vec![
            live("eth0", "52:54:00:00:00:01"),
            live("eth1", "52:54:00:00:00:02"),
        ];
        let mut init = InitController::new(ops, BootConfig::default());
        init.boot_to_idle();

        let calls = &init.ops().calls;
        assert!(calls.contains(&"ip addr add 10.0.0.5/24 dev eth1".to_string()));
        assert!(calls.contains(&"ip route replace default via 10.0.0.1 dev eth1".to_string()));
        assert!(!has(calls, "dhcp"));
    }

    #[test]
    fn test_kernel_args_select_interface() {
        let mut ops = FakeSystem::default();
        ops.files.insert(
            "/proc/cmdline".into(),
            "rdinit=/init ramroot.mac=52:54:00:00:00:02 ramroot.ip=192.0.2.9/24,192.0.2.1\n"
                .into(),
        );
        ops.interfaces = vec![
            live("eth0", "52:54:00:00:00:01"),
            live("eth1", "52:54:00:00:00:02"),
        ];
        let mut init = InitController::new(ops, BootConfig::default());
        init.boot_to_idle();

        let calls = &init.ops().calls;
        assert!(calls.contains(&"ip addr add 192.0.2.9/24 dev eth1".to_string()));
        assert!(calls.contains(&"ip route replace default via 192.0.2.1 dev eth1".to_string()));
    }

    #[test]
    fn test_kernel_gateway_outside_prefix_is_onlink() {
        let mut ops = FakeSystem::default();
        ops.files.insert(
            "/proc/cmdline".into(),
            "ramroot.ip=203.0.113.10/32,172.31.1.1\n".into(),
        );
        ops.interfaces = vec![live("eth0", "52:54:00:00:00:01")];
        let mut init = InitController::new(ops, BootConfig::default());
        init.boot_to_idle();

        let calls = &init.ops().calls;
        assert!(calls.contains(&"ip route replace default via 172.31.1.1 dev eth0 onlink".to_string()));
    }

    #[test]
    fn test_dhcp_exhaustion_degrades_network() {
        let ops = FakeSystem {
            interfaces: vec![live("eth0", "52:54:00:00:00:01")],
            dhcp_failures: 100,
            ..FakeSystem::default()
        };
        let boot = BootConfig {
            dhcp_retries: 3,
            ..BootConfig::default()
        };
        let mut init = InitController::new(ops, boot);
        init.boot_to_idle();

        assert_eq!(init.state(), InitState::Idle);
        let attempts = init.ops().calls.iter().filter(|c| *c == "dhcp eth0").count();
        assert_eq!(attempts, 3);
        assert!(init.degradations().contains(&Degradation::NetworkDegraded));
    }

    #[test]
    fn test_missing_pool_module_and_pools_are_not_fatal() {
        let mut ops = FakeSystem::default();
        ops.fail_modules.insert("zfs".into());
        let mut init = InitController::new(ops, BootConfig::default());
        init.boot_to_idle();

        assert_eq!(init.state(), InitState::Idle);
        assert!(init
            .degradations()
            .contains(&Degradation::PoolModuleUnavailable));
        assert!(init.degradations().contains(&Degradation::NoStoragePools));
        assert!(has(&init.ops().calls, "import"));
    }

    #[test]
    fn test_ephemeral_key_when_none_provisioned() {
        let mut init = InitController::new(FakeSystem::default(), BootConfig::default());
        init.boot_to_idle();

        let calls = &init.ops().calls;
        let path = HostKeyAlgorithm::Ed25519.dropbear_path();
        assert!(calls.contains(&format!("keygen {}", path)));
        assert!(calls.contains(&format!("sshd 22 {}", path)));
        assert!(init.degradations().contains(&Degradation::EphemeralHostKey));
    }

    #[test]
    fn test_console_respawned_and_sigterm_reboots() {
        let mut ops = FakeSystem::default();
        ops.pools = vec!["tank".into()];
        ops.events = VecDeque::from([
            InitEvent::ChildrenExited(vec![77]),
            InitEvent::ChildrenExited(vec![1]),
            InitEvent::Signal(TerminalAction::Reboot),
        ]);
        let mut init = InitController::new(ops, BootConfig::default());
        let report = init.run();

        assert_eq!(report.exported, vec!["tank"]);
        assert_eq!(init.state(), InitState::ShuttingDown(TerminalAction::Reboot));
        let calls = &init.ops().calls;
        let consoles = calls.iter().filter(|c| c.starts_with("console")).count();
        assert_eq!(consoles, 2);
        assert_eq!(calls.last().unwrap(), "terminal reboot");
    }
}
