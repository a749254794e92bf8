//! Kernel command line overrides.

use std::net::Ipv4Addr;

use crate::network::{normalize_mac, Ipv4Cidr};

/// `ramroot.*` arguments from /proc/cmdline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    /// Interface to configure, by MAC.
    pub mac: Option<String>,
    pub ip: Option<Ipv4Cidr>,
    pub gateway: Option<Ipv4Addr>,
    pub debug: bool,
}

impl KernelArgs {
    /// An address was given; a MAC alone is not enough to configure anything.
    pub fn has_static_address(&self) -> bool {
        self.ip.is_some()
    }
}

/// Parse a kernel command line. Unknown and malformed arguments are ignored;
/// a repeated argument takes its last value.
pub fn parse_cmdline(cmdline: &str) -> KernelArgs {
    let mut args = KernelArgs::default();

    for token in cmdline.split_ascii_whitespace() {
        if token == "ramroot.debug" {
            args.debug = true;
        } else if let Some(mac) = token.strip_prefix("ramroot.mac=") {
            match normalize_mac(mac) {
                Some(mac) => args.mac = Some(mac),
                None => tracing::warn!(value = %mac, "ignoring malformed ramroot.mac"),
            }
        } else if let Some(value) = token.strip_prefix("ramroot.ip=") {
            let (cidr, gateway) = match value.split_once(',') {
                Some((cidr, gw)) => (cidr, Some(gw)),
                None => (value, None),
            };
            let Ok(cidr) = cidr.parse::<Ipv4Cidr>() else {
                tracing::warn!(value = %value, "ignoring malformed ramroot.ip");
                continue;
            };
            args.ip = Some(cidr);
            args.gateway = gateway.and_then(|gw| gw.parse().ok());
        }
    }

    args
}
