//! Generated /etc files for the RAM environment.
//!
//! Root has a locked password: the console shell is spawned directly by init
//! and remote access is key-only.

use anyhow::Result;
use std::path::Path;

use super::tree::TreeBuilder;
use crate::config::{BootConfig, BOOT_CONFIG_PATH, DHCP_SCRIPT_PATH};

/// Applies a udhcpc lease with `ip`, and writes resolv.conf only when the
/// launcher did not provide one.
const DHCP_SCRIPT: &str = r#"#!/bin/sh
[ -n "$interface" ] || exit 1
case "$1" in
deconfig)
    ip addr flush dev "$interface"
    ip link set "$interface" up
    ;;
bound|renew)
    ip addr flush dev "$interface"
    ip addr add "$ip/${mask:-24}" dev "$interface"
    for gw in $router; do
        ip route replace default via "$gw" dev "$interface"
        break
    done
    if grep -q "^# replaced at launch" /etc/resolv.conf 2>/dev/null && [ -n "$dns" ]; then
        : > /etc/resolv.conf
        for ns in $dns; do
            echo "nameserver $ns" >> /etc/resolv.conf
        done
    fi
    ;;
esac
exit 0
"#;

/// PATH inside the environment. Dedicated tools shadow busybox applets in /bin.
pub const ENV_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub fn create_etc_files(tree: &mut TreeBuilder, boot: &BootConfig) -> Result<()> {
    create_accounts(tree)?;
    create_identity(tree, &boot.hostname)?;
    create_shell_config(tree)?;

    // Placeholder until the launcher's identity overlay provides the real one
    tree.write_file(
        Path::new("/etc/resolv.conf"),
        b"# replaced at launch with the host's resolvers\nnameserver 1.1.1.1\n",
        0o644,
    )?;
    tree.write_file(Path::new(BOOT_CONFIG_PATH), boot.to_json()?.as_bytes(), 0o644)?;
    tree.write_file(Path::new(DHCP_SCRIPT_PATH), DHCP_SCRIPT.as_bytes(), 0o755)?;
    Ok(())
}

fn create_accounts(tree: &mut TreeBuilder) -> Result<()> {
    tree.write_file(
        Path::new("/etc/passwd"),
        b"root:x:0:0:root:/root:/bin/sh\n\
          daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
          sshd:x:74:65534::/run/sshd:/usr/sbin/nologin\n\
          nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin\n",
        0o644,
    )?;
    tree.write_file(
        Path::new("/etc/shadow"),
        b"root:*:19000:0:99999:7:::\n\
          daemon:*:19000:0:99999:7:::\n\
          sshd:*:19000:0:99999:7:::\n\
          nobody:*:19000:0:99999:7:::\n",
        0o600,
    )?;
    tree.write_file(
        Path::new("/etc/group"),
        b"root:x:0:\n\
          daemon:x:1:\n\
          tty:x:5:\n\
          disk:x:6:\n\
          utmp:x:43:\n\
          nogroup:x:65534:\n",
        0o644,
    )?;
    Ok(())
}

fn create_identity(tree: &mut TreeBuilder, hostname: &str) -> Result<()> {
    tree.write_file(
        Path::new("/etc/hostname"),
        format!("{}\n", hostname).as_bytes(),
        0o644,
    )?;
    tree.write_file(
        Path::new("/etc/hosts"),
        format!(
            "127.0.0.1\tlocalhost\n127.0.1.1\t{}\n::1\tlocalhost ip6-localhost ip6-loopback\n",
            hostname
        )
        .as_bytes(),
        0o644,
    )?;
    tree.write_file(
        Path::new("/etc/os-release"),
        b"NAME=\"ramroot\"\n\
          ID=ramroot\n\
          PRETTY_NAME=\"ramroot maintenance environment\"\n\
          VARIANT=\"memory resident\"\n",
        0o644,
    )?;
    tree.write_file(
        Path::new("/etc/nsswitch.conf"),
        b"passwd: files\n\
          group: files\n\
          shadow: files\n\
          hosts: files dns\n\
          networks: files\n\
          protocols: files\n\
          services: files\n",
        0o644,
    )?;
    Ok(())
}

fn create_shell_config(tree: &mut TreeBuilder) -> Result<()> {
    tree.write_file(
        Path::new("/etc/shells"),
        b"/bin/sh\n/bin/bash\n/usr/bin/bash\n",
        0o644,
    )?;

    let profile = format!(
        "export PATH={}\n\
         export HOME=/root\n\
         export TERM=${{TERM:-linux}}\n\
         export LANG=C.UTF-8\n\
         export PS1='[ramroot \\w]# '\n\
         [ -r /run/ramroot/status ] && cat /run/ramroot/status\n",
        ENV_PATH
    );
    tree.write_file(Path::new("/etc/profile"), profile.as_bytes(), 0o644)?;
    tree.write_file(Path::new("/root/.profile"), b". /etc/profile\n", 0o644)?;
    tree.write_file(Path::new("/root/.bashrc"), b". /etc/profile\n", 0o644)?;
    Ok(())
}
