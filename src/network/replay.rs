//! Replay planning, run by the init controller.
//!
//! [`plan_replay`] is pure: it pairs captured records with live interfaces by
//! MAC and returns the `ip` invocations to run. The plan follows the capture
//! order, so the live enumeration order never changes the outcome.

use std::net::Ipv4Addr;

use super::{normalize_mac, Ipv4Cidr, NetworkIdentity};

/// An interface present at replay time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInterface {
    pub name: String,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayAction {
    LinkUp {
        ifname: String,
    },
    AddAddress {
        ifname: String,
        cidr: Ipv4Cidr,
    },
    AddRoute {
        ifname: String,
        destination: Ipv4Cidr,
        via: Option<Ipv4Addr>,
        onlink: bool,
    },
    DefaultRoute {
        ifname: String,
        via: Ipv4Addr,
        metric: Option<u32>,
        onlink: bool,
    },
}

impl ReplayAction {
    /// Arguments for `ip`.
    pub fn ip_args(&self) -> Vec<String> {
        let mut args: Vec<String> = match self {
            ReplayAction::LinkUp { ifname } => {
                vec!["link".into(), "set".into(), ifname.clone(), "up".into()]
            }
            ReplayAction::AddAddress { ifname, cidr } => vec![
                "addr".into(),
                "add".into(),
                cidr.to_string(),
                "dev".into(),
                ifname.clone(),
            ],
            ReplayAction::AddRoute {
                ifname,
                destination,
                via,
                ..
            } => {
                let mut args = vec!["route".into(), "replace".into(), destination.to_string()];
                if let Some(via) = via {
                    args.extend(["via".into(), via.to_string()]);
                }
                args.extend(["dev".into(), ifname.clone()]);
                args
            }
            ReplayAction::DefaultRoute { ifname, via, .. } => vec![
                "route".into(),
                "replace".into(),
                "default".into(),
                "via".into(),
                via.to_string(),
                "dev".into(),
                ifname.clone(),
            ],
        };
        if let ReplayAction::AddRoute { onlink: true, .. }
        | ReplayAction::DefaultRoute { onlink: true, .. } = self
        {
            args.push("onlink".into());
        }
        if let ReplayAction::DefaultRoute {
            metric: Some(metric),
            ..
        } = self
        {
            args.extend(["metric".into(), metric.to_string()]);
        }
        args
    }

    pub fn ifname(&self) -> &str {
        match self {
            ReplayAction::LinkUp { ifname }
            | ReplayAction::AddAddress { ifname, .. }
            | ReplayAction::AddRoute { ifname, .. }
            | ReplayAction::DefaultRoute { ifname, .. } => ifname,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayPlan {
    pub actions: Vec<ReplayAction>,
    /// MACs captured on the host but absent now.
    pub missing: Vec<String>,
}

impl ReplayPlan {
    pub fn configures_any(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, ReplayAction::AddAddress { .. }))
    }
}

/// Pair records with live interfaces by MAC and plan their configuration.
///
/// Default routes are only planned for records that had a gateway; the
/// first gets no metric, later ones get increasing metrics.
pub fn plan_replay(identity: &NetworkIdentity, live: &[LiveInterface]) -> ReplayPlan {
    let mut plan = ReplayPlan::default();
    let mut defaults = 0u32;

    for record in &identity.interfaces {
        let mac = normalize_mac(&record.mac).unwrap_or_else(|| record.mac.clone());
        let Some(iface) = live
            .iter()
            .find(|l| normalize_mac(&l.mac).as_deref() == Some(mac.as_str()))
        else {
            plan.missing.push(mac);
            continue;
        };
        let ifname = iface.name.clone();

        plan.actions.push(ReplayAction::LinkUp {
            ifname: ifname.clone(),
        });
        for cidr in &record.addresses {
            plan.actions.push(ReplayAction::AddAddress {
                ifname: ifname.clone(),
                cidr: *cidr,
            });
        }
        for route in &record.routes {
            plan.actions.push(ReplayAction::AddRoute {
                ifname: ifname.clone(),
                destination: route.destination,
                via: route.via,
                onlink: route.onlink,
            });
        }
        if let Some(via) = record.gateway {
            plan.actions.push(ReplayAction::DefaultRoute {
                ifname,
                via,
                metric: (defaults > 0).then(|| defaults * 100),
                onlink: record.gateway_onlink,
            });
            defaults += 1;
        }
    }

    plan
}
