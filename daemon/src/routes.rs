//! Kernel route synchronization.
//!
//! The reconciler computes the desired route set each tick; this module
//! diffs it against the main table and applies the difference. Only routes
//! with a gateway are ours to manage. Directly-connected routes (the mesh
//! /16 itself, or anything an operator added) are never removed.

use shared::{wg, RouteEntry};
use std::{io, process::Command};
use wireguard_control::InterfaceName;

/// Splits desired-vs-current into additions and (managed-only) removals.
pub fn diff<'a>(
    current: &'a [RouteEntry],
    desired: &'a [RouteEntry],
) -> (Vec<&'a RouteEntry>, Vec<&'a RouteEntry>) {
    let to_add = desired
        .iter()
        .filter(|route| !current.contains(route))
        .collect();
    let to_remove = current
        .iter()
        .filter(|route| route.is_managed() && !desired.contains(route))
        .collect();
    (to_add, to_remove)
}

/// Applies the route diff. Individual failures are logged and skipped; the
/// next tick retries. Returns whether any route was added.
pub fn sync(interface: &InterfaceName, desired: &[RouteEntry]) -> io::Result<bool> {
    let current = wg::list_routes(interface)?;
    let (to_add, to_remove) = diff(&current, desired);

    let mut added = false;
    for route in to_add {
        match route.gateway {
            Some(gateway) => match wg::add_route_via(interface, route.cidr, gateway) {
                Ok(_) => {
                    log::info!("added route {} via {}", route.cidr, gateway);
                    added = true;
                },
                Err(e) => log::warn!("failed to add route {}: {}", route.cidr, e),
            },
            None => {
                // Desired routes always carry a gateway; connected routes
                // come from address assignment, not from here.
            },
        }
    }
    for route in to_remove {
        match wg::del_route(interface, route) {
            Ok(()) => log::info!("removed route {}", route.cidr),
            Err(e) => log::warn!("failed to remove route {}: {}", route.cidr, e),
        }
    }
    Ok(added)
}

#[cfg(target_os = "linux")]
pub fn enable_ipv4_forwarding() -> io::Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
}

#[cfg(not(target_os = "linux"))]
pub fn enable_ipv4_forwarding() -> io::Result<()> {
    Ok(())
}

fn iptables(args: &[&str]) -> io::Result<bool> {
    let output = Command::new("iptables").args(args).output()?;
    log::trace!("iptables {}: {:?}", args.join(" "), output.status.code());
    Ok(output.status.success())
}

/// Keeps the permissive FORWARD rule for the mesh interface in step with
/// whether any relay route exists. Tracks its own installation so an
/// operator's unrelated rules are left alone.
pub struct ForwardRule {
    interface: String,
    installed: bool,
}

impl ForwardRule {
    pub fn new(interface: &InterfaceName) -> Self {
        Self {
            interface: interface.to_string(),
            installed: false,
        }
    }

    pub fn ensure(&mut self, wanted: bool) {
        if wanted == self.installed {
            return;
        }
        let rule = ["FORWARD", "-i", &self.interface, "-j", "ACCEPT"];
        let result = if wanted {
            let present = iptables(&["-C", rule[0], rule[1], rule[2], rule[3], rule[4]])
                .unwrap_or(false);
            if present {
                Ok(true)
            } else {
                iptables(&["-A", rule[0], rule[1], rule[2], rule[3], rule[4]])
            }
        } else {
            iptables(&["-D", rule[0], rule[1], rule[2], rule[3], rule[4]])
        };
        match result {
            Ok(true) => {
                self.installed = wanted;
                log::info!(
                    "{} FORWARD accept rule for {}",
                    if wanted { "installed" } else { "removed" },
                    self.interface
                );
            },
            Ok(false) | Err(_) => {
                log::warn!(
                    "could not {} FORWARD rule for {}",
                    if wanted { "install" } else { "remove" },
                    self.interface
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(cidr: &str, gateway: Option<&str>) -> RouteEntry {
        RouteEntry {
            cidr: cidr.parse().unwrap(),
            gateway: gateway.map(|g| g.parse().unwrap()),
        }
    }

    #[test]
    fn additions_and_removals() {
        let current = vec![
            route("192.168.5.0/24", Some("10.42.0.1")),
            route("192.168.6.0/24", Some("10.42.0.2")),
        ];
        let desired = vec![
            route("192.168.5.0/24", Some("10.42.0.1")),
            route("192.168.7.0/24", Some("10.42.0.3")),
        ];

        let (to_add, to_remove) = diff(&current, &desired);
        assert_eq!(to_add, vec![&desired[1]]);
        assert_eq!(to_remove, vec![&current[1]]);
    }

    #[test]
    fn connected_routes_are_never_removed() {
        let current = vec![route("10.42.0.0/16", None)];
        let (to_add, to_remove) = diff(&current, &[]);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn gateway_change_is_remove_plus_add() {
        // The same CIDR moving to a new gateway (relay flip) must be both
        // an addition and a removal.
        let current = vec![route("192.168.5.0/24", Some("10.42.0.1"))];
        let desired = vec![route("192.168.5.0/24", Some("10.42.0.9"))];

        let (to_add, to_remove) = diff(&current, &desired);
        assert_eq!(to_add.len(), 1);
        assert_eq!(to_remove.len(), 1);
    }

    #[test]
    fn identical_sets_are_a_noop() {
        let current = vec![route("192.168.5.0/24", Some("10.42.0.1"))];
        let desired = current.clone();
        let (to_add, to_remove) = diff(&current, &desired);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }
}
