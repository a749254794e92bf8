//! Host-side capture from `ip -j`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;

use super::{normalize_mac, InterfaceRecord, Ipv4Cidr, NetworkIdentity, RouteRecord};
use crate::process::{self, Cmd};

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    #[serde(default)]
    family: Option<String>,
    local: Option<String>,
    prefixlen: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default, rename = "type")]
    route_type: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
}

impl IpRoute {
    fn onlink(&self) -> bool {
        self.flags.iter().any(|f| f == "onlink")
    }
}

/// Build the replay document from `ip -j -4 addr show` and
/// `ip -j -4 route show table main` output.
///
/// Interfaces are kept in the order `ip` lists them. A MAC seen twice
/// (VLANs and bonds share their parent's) keeps the first interface.
pub fn parse_capture(addr_json: &str, route_json: &str) -> Result<NetworkIdentity> {
    let links: Vec<IpLink> =
        serde_json::from_str(addr_json).context("Failed to parse `ip -j addr` output")?;
    let routes: Vec<IpRoute> = if route_json.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(route_json).context("Failed to parse `ip -j route` output")?
    };

    let mut identity = NetworkIdentity::default();
    for link in links {
        if link.ifname == "lo" || link.link_type.as_deref() == Some("loopback") {
            continue;
        }
        let Some(mac) = link.address.as_deref().and_then(normalize_mac) else {
            continue;
        };
        if mac == "00:00:00:00:00:00" {
            continue;
        }

        let addresses: Vec<Ipv4Cidr> = link
            .addr_info
            .iter()
            .filter(|a| a.family.as_deref().map_or(true, |f| f == "inet"))
            .filter_map(|a| {
                let addr: Ipv4Addr = a.local.as_deref()?.parse().ok()?;
                Ipv4Cidr::new(addr, a.prefixlen?).ok()
            })
            .collect();
        if addresses.is_empty() {
            continue;
        }

        if let Some(first) = identity.interfaces.iter().find(|r| r.mac == mac) {
            tracing::warn!(
                interface = %link.ifname,
                mac = %mac,
                kept = %first.host_name,
                "duplicate MAC, keeping the first interface"
            );
            continue;
        }

        let on_dev: Vec<&IpRoute> = routes
            .iter()
            .filter(|r| r.dev.as_deref() == Some(link.ifname.as_str()))
            .filter(|r| r.route_type.as_deref().map_or(true, |t| t == "unicast"))
            .collect();

        let gateway_route = on_dev
            .iter()
            .find(|r| r.dst == "default")
            .or_else(|| on_dev.iter().find(|r| r.gateway.is_some()));
        let gateway: Option<Ipv4Addr> = gateway_route
            .and_then(|r| r.gateway.as_deref())
            .and_then(|g| g.parse().ok());
        // Kernel flag, or a gateway no captured subnet covers.
        let gateway_onlink = match gateway {
            Some(via) => {
                gateway_route.is_some_and(|r| r.onlink())
                    || !addresses.iter().any(|a| a.contains(via))
            }
            None => false,
        };

        let extra: Vec<RouteRecord> = on_dev
            .iter()
            .filter(|r| r.dst != "default" && r.protocol.as_deref() != Some("kernel"))
            .filter_map(|r| {
                Some(RouteRecord {
                    destination: parse_destination(&r.dst)?,
                    via: r.gateway.as_deref().and_then(|g| g.parse().ok()),
                    onlink: r.onlink(),
                })
            })
            .collect();

        identity.interfaces.push(InterfaceRecord {
            mac,
            host_name: link.ifname,
            addresses,
            gateway,
            gateway_onlink,
            routes: extra,
        });
    }

    Ok(identity)
}

/// `ip` prints host routes without a prefix.
fn parse_destination(dst: &str) -> Option<Ipv4Cidr> {
    if dst.contains('/') {
        dst.parse().ok()
    } else {
        Ipv4Cidr::new(dst.parse().ok()?, 32).ok()
    }
}

/// Capture the live host. No `ip` means an empty identity (DHCP at boot).
pub fn capture_host() -> Result<NetworkIdentity> {
    if !process::exists("ip") {
        tracing::warn!("`ip` not found on host, network identity not captured");
        return Ok(NetworkIdentity::default());
    }
    let addrs = Cmd::new("ip")
        .args(["-j", "-4", "addr", "show"])
        .error_msg("Failed to list host addresses")
        .run()?;
    let routes = Cmd::new("ip")
        .args(["-j", "-4", "route", "show", "table", "main"])
        .error_msg("Failed to list host routes")
        .run()?;
    parse_capture(&addrs.stdout, &routes.stdout)
}
