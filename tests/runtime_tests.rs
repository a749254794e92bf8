//! Booted-environment scenarios: network replay and safe shutdown.

use anyhow::{bail, Result};
use std::net::Ipv4Addr;

use ramroot::network::capture::parse_capture;
use ramroot::network::replay::{plan_replay, LiveInterface, ReplayAction};
use ramroot::network::NetworkIdentity;
use ramroot::shutdown::{parse_mounts, run_shutdown, MountEntry, ShutdownOps, TerminalAction};

const MAC_A: &str = "52:54:00:aa:00:01";
const MAC_B: &str = "52:54:00:bb:00:02";

fn captured() -> NetworkIdentity {
    let addr = format!(
        r#"[
        {{"ifname":"lo","address":"00:00:00:00:00:00","link_type":"loopback",
          "addr_info":[{{"family":"inet","local":"127.0.0.1","prefixlen":8}}]}},
        {{"ifname":"eth0","address":"{MAC_A}","link_type":"ether",
          "addr_info":[{{"family":"inet","local":"10.0.0.5","prefixlen":24}}]}},
        {{"ifname":"eth1","address":"{MAC_B}","link_type":"ether",
          "addr_info":[{{"family":"inet","local":"192.168.50.5","prefixlen":24}}]}}
    ]"#
    );
    let route = r#"[
        {"dst":"default","gateway":"10.0.0.1","dev":"eth0"},
        {"dst":"10.0.0.0/24","dev":"eth0","protocol":"kernel","prefsrc":"10.0.0.5"},
        {"dst":"192.168.50.0/24","dev":"eth1","protocol":"kernel","prefsrc":"192.168.50.5"}
    ]"#;
    parse_capture(&addr, route).unwrap()
}

fn live(pairs: &[(&str, &str)]) -> Vec<LiveInterface> {
    pairs
        .iter()
        .map(|(name, mac)| LiveInterface {
            name: name.to_string(),
            mac: mac.to_string(),
        })
        .collect()
}

#[test]
fn test_reversed_enumeration_follows_mac() {
    let identity = NetworkIdentity::from_json(&captured().to_json().unwrap()).unwrap();
    let same = plan_replay(&identity, &live(&[("eth0", MAC_A), ("eth1", MAC_B)]));
    let reversed = plan_replay(&identity, &live(&[("eth0", MAC_B), ("eth1", MAC_A)]));

    // The address that lived on MAC_A follows MAC_A, now named eth1
    assert!(reversed.actions.contains(&ReplayAction::AddAddress {
        ifname: "eth1".into(),
        cidr: "10.0.0.5/24".parse().unwrap(),
    }));
    assert!(reversed.actions.contains(&ReplayAction::AddAddress {
        ifname: "eth0".into(),
        cidr: "192.168.50.5/24".parse().unwrap(),
    }));

    // Exactly one default route, through the interface holding MAC_A
    let defaults: Vec<&ReplayAction> = reversed
        .actions
        .iter()
        .filter(|a| matches!(a, ReplayAction::DefaultRoute { .. }))
        .collect();
    assert_eq!(
        defaults,
        [&ReplayAction::DefaultRoute {
            ifname: "eth1".into(),
            via: Ipv4Addr::new(10, 0, 0, 1),
            metric: None,
            onlink: false,
        }]
    );

    // Same assignment per MAC either way
    let by_mac = |plan: &ramroot::network::replay::ReplayPlan, names: &[(&str, &str)]| {
        let mut out: Vec<(String, String)> = plan
            .actions
            .iter()
            .filter_map(|a| match a {
                ReplayAction::AddAddress { ifname, cidr } => {
                    let mac = names.iter().find(|(n, _)| *n == ifname.as_str()).map(|(_, m)| *m)?;
                    Some((mac.to_string(), cidr.to_string()))
                }
                _ => None,
            })
            .collect();
        out.sort();
        out
    };
    assert_eq!(
        by_mac(&same, &[("eth0", MAC_A), ("eth1", MAC_B)]),
        by_mac(&reversed, &[("eth0", MAC_B), ("eth1", MAC_A)])
    );
}

#[test]
fn test_absent_mac_is_reported_not_guessed() {
    let identity = captured();
    let plan = plan_replay(&identity, &live(&[("eth0", MAC_B)]));
    assert_eq!(plan.missing, [MAC_A]);
    assert!(plan
        .actions
        .iter()
        .all(|a| a.ifname() == "eth0"));
    assert!(!plan
        .actions
        .iter()
        .any(|a| matches!(a, ReplayAction::DefaultRoute { .. })));
}

#[test]
fn test_off_subnet_gateway_is_replayed_onlink() {
    let addr = format!(
        r#"[{{"ifname":"eth0","address":"{MAC_A}","link_type":"ether",
             "addr_info":[{{"family":"inet","local":"203.0.113.10","prefixlen":32}}]}}]"#
    );
    let route = r#"[{"dst":"default","gateway":"172.31.1.1","dev":"eth0","flags":["onlink"]}]"#;
    let captured = parse_capture(&addr, route).unwrap();
    let identity = NetworkIdentity::from_json(&captured.to_json().unwrap()).unwrap();

    let plan = plan_replay(&identity, &live(&[("enp7s0", MAC_A)]));
    let commands: Vec<String> = plan.actions.iter().map(|a| a.ip_args().join(" ")).collect();
    assert!(commands.contains(&"addr add 203.0.113.10/32 dev enp7s0".to_string()));
    assert!(commands.contains(&"route replace default via 172.31.1.1 dev enp7s0 onlink".to_string()));
}

#[derive(Default)]
struct Machine {
    log: Vec<String>,
    pools: Vec<String>,
    fail_export: bool,
    mounts: Vec<MountEntry>,
}

impl ShutdownOps for Machine {
    fn sync(&mut self) {
        self.log.push("sync".into());
    }

    fn active_pools(&mut self) -> Result<Vec<String>> {
        Ok(self.pools.clone())
    }

    fn export_pool(&mut self, name: &str) -> Result<()> {
        self.log.push(format!("export {}", name));
        if self.fail_export {
            bail!("pool is busy");
        }
        Ok(())
    }

    fn mounts(&mut self) -> Result<Vec<MountEntry>> {
        Ok(self.mounts.clone())
    }

    fn unmount(&mut self, target: &str) -> Result<()> {
        self.log.push(format!("umount {}", target));
        Ok(())
    }

    fn terminal(&mut self, action: TerminalAction) -> Result<()> {
        self.log.push(format!("terminal {}", action));
        Ok(())
    }
}

fn machine(fail_export: bool) -> Machine {
    let mounts = parse_mounts(
        "rootfs / rootfs rw 0 0\n\
         proc /proc proc rw 0 0\n\
         sysfs /sys sysfs rw 0 0\n\
         devtmpfs /dev devtmpfs rw 0 0\n\
         tmpfs /run tmpfs rw 0 0\n\
         tank/data /tank/data zfs rw 0 0\n\
         /dev/sdb1 /mnt ext4 rw 0 0\n\
         /dev/sdc1 /mnt/boot vfat rw 0 0\n",
    );
    Machine {
        pools: vec!["tank".into()],
        fail_export,
        mounts,
        ..Machine::default()
    }
}

#[test]
fn test_sigterm_exports_before_unmounting() {
    let mut m = machine(false);
    let report = run_shutdown(&mut m, TerminalAction::Reboot);

    assert_eq!(
        m.log,
        [
            "sync",
            "export tank",
            "umount /mnt/boot",
            "umount /mnt",
            "sync",
            "terminal reboot",
        ]
    );
    assert_eq!(report.exported, ["tank"]);
}

#[test]
fn test_reboot_happens_even_when_export_fails() {
    let mut m = machine(true);
    let report = run_shutdown(&mut m, TerminalAction::Reboot);

    assert_eq!(report.export_failures, ["tank"]);
    assert_eq!(m.log.last().map(String::as_str), Some("terminal reboot"));
    let export = m.log.iter().position(|l| l == "export tank").unwrap();
    let first_umount = m.log.iter().position(|l| l.starts_with("umount")).unwrap();
    assert!(export < first_umount);
}
