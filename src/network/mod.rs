//! Network identity replication.
//!
//! The launcher captures each host interface's MAC, IPv4 addresses, gateway
//! and extra routes into `etc/ramroot/network.json`; the init controller
//! replays it by MAC, so kernel renaming or reordering of interfaces does not
//! change who gets which address.

pub mod capture;
pub mod dns;
pub mod replay;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Location of the replay document inside the image.
pub const NETWORK_CONFIG_PATH: &str = "/etc/ramroot/network.json";

/// An IPv4 address with prefix length, serialized as `a.b.c.d/n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            bail!("Prefix length {} out of range", prefix);
        }
        Ok(Self { addr, prefix })
    }

    /// Whether `addr` falls inside this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
        u32::from(self.addr) & mask == u32::from(addr) & mask
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .with_context(|| format!("'{}' is not in address/prefix form", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .with_context(|| format!("Bad IPv4 address in '{}'", s))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("Bad prefix length in '{}'", s))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

/// A route beyond the connected subnet and the default route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub destination: Ipv4Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<Ipv4Addr>,
    /// Next hop is reachable without a covering subnet.
    #[serde(default, skip_serializing_if = "is_false")]
    pub onlink: bool,
}

/// Everything captured about one interface. The MAC is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub mac: String,
    /// Name on the host at capture time; informational only.
    pub host_name: String,
    pub addresses: Vec<Ipv4Cidr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    /// Gateway lies outside every captured subnet (a /32 with an off-link
    /// gateway, as some hosting providers hand out).
    #[serde(default, skip_serializing_if = "is_false")]
    pub gateway_onlink: bool,
    #[serde(default)]
    pub routes: Vec<RouteRecord>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The replay document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub interfaces: Vec<InterfaceRecord>,
}

impl NetworkIdentity {
    pub fn to_json(&self) -> Result<String> {
        let mut json =
            serde_json::to_string_pretty(self).context("Failed to serialize network identity")?;
        json.push('\n');
        Ok(json)
    }

    /// Parse and check MAC uniqueness.
    pub fn from_json(text: &str) -> Result<Self> {
        let identity: Self =
            serde_json::from_str(text).context("Failed to parse network identity")?;
        identity.validate()?;
        Ok(identity)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, record) in self.interfaces.iter().enumerate() {
            if self.interfaces[..i].iter().any(|r| r.mac == record.mac) {
                bail!("MAC {} appears on more than one interface", record.mac);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

/// Canonical lowercase colon-separated form of a MAC address.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let parts: Vec<&str> = mac.trim().split([':', '-']).collect();
    if parts.len() != 6
        || !parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join(":").to_ascii_lowercase())
}
