//! DNS resolver capture.

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use crate::config::host_path;

/// systemd-resolved's view of the real upstream servers.
pub const RESOLVED_UPSTREAM: &str = "/run/systemd/resolve/resolv.conf";
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
pub const FALLBACK_NAMESERVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];

/// Where the captured resolvers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsSource {
    Resolved,
    ResolvConf,
    Fallback,
}

/// `nameserver` entries of a resolv.conf, loopback stubs dropped.
pub fn parse_nameservers(text: &str) -> Vec<IpAddr> {
    let mut servers: Vec<IpAddr> = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(addr) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
            continue;
        };
        if addr.is_loopback() || addr.is_unspecified() || servers.contains(&addr) {
            continue;
        }
        servers.push(addr);
    }
    servers
}

/// Pick resolvers: systemd-resolved upstreams, then resolv.conf, then public.
pub fn select_nameservers(host_root: &Path) -> (Vec<IpAddr>, DnsSource) {
    let read = |path: &str| fs::read_to_string(host_path(host_root, Path::new(path))).ok();

    if let Some(text) = read(RESOLVED_UPSTREAM) {
        let servers = parse_nameservers(&text);
        if !servers.is_empty() {
            return (servers, DnsSource::Resolved);
        }
    }
    if let Some(text) = read(RESOLV_CONF) {
        let servers = parse_nameservers(&text);
        if !servers.is_empty() {
            return (servers, DnsSource::ResolvConf);
        }
    }

    tracing::warn!("no usable host resolvers, falling back to public DNS");
    let servers = FALLBACK_NAMESERVERS
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    (servers, DnsSource::Fallback)
}

pub fn render_resolv_conf(servers: &[IpAddr]) -> String {
    let mut out = String::from("# captured from the host by ramroot\n");
    for server in servers {
        out.push_str(&format!("nameserver {}\n", server));
    }
    out
}
