use crate::{DesiredPeer, Error, IoErrorContext};
use ipnet::IpNet;
use std::{
    collections::HashMap,
    io,
    time::{Duration, SystemTime},
};
use wireguard_control::{
    Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder, PeerInfo,
};

/// Ports tried, in order, when the preferred WireGuard listen port is
/// already bound by something else on the host.
pub const FALLBACK_PORT_RANGE: std::ops::Range<u16> = 51820..51920;

#[cfg(target_os = "linux")]
pub use super::netlink::{
    add_route, add_route_via, del_addr, del_route, list_routes, set_addr, set_up,
};

/// Brings the mesh interface up: private key, listen port (with fallback
/// when the preferred port is taken), mesh addresses, link state.
///
/// Returns the listen port actually bound.
pub fn up(
    interface: &InterfaceName,
    private_key: &Key,
    ipv4: IpNet,
    ipv6: IpNet,
    listen_port: u16,
    mtu: Option<u32>,
    backend: Backend,
) -> Result<u16, Error> {
    let mut bound_port = None;
    let candidates = std::iter::once(listen_port)
        .chain(FALLBACK_PORT_RANGE.filter(|port| *port != listen_port));
    for port in candidates {
        let result = DeviceUpdate::new()
            .set_private_key(private_key.clone())
            .set_listen_port(port)
            .apply(interface, backend);
        match result {
            Ok(()) => {
                bound_port = Some(port);
                break;
            },
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                log::debug!("listen port {} in use, trying the next candidate", port);
            },
            Err(e) => return Err(e.into()),
        }
    }
    let port = bound_port
        .ok_or_else(|| anyhow::anyhow!("no free WireGuard listen port in {FALLBACK_PORT_RANGE:?}"))?;
    if port != listen_port {
        log::info!("listen port {} was taken; bound {} instead", listen_port, port);
    }

    set_addr(interface, ipv4)?;
    set_addr(interface, ipv6)?;
    set_up(interface, mtu.unwrap_or(1420))?;
    add_route(interface, ipv4.trunc())?;
    add_route(interface, ipv6.trunc())?;
    Ok(port)
}

pub fn down(interface: &InterfaceName, backend: Backend) -> Result<(), Error> {
    Ok(Device::get(interface, backend)
        .with_str(interface.as_str_lossy())?
        .delete()
        .with_str(interface.as_str_lossy())?)
}

fn sorted_allowed_ips(ips: &[wireguard_control::AllowedIp]) -> Vec<(std::net::IpAddr, u8)> {
    let mut sorted: Vec<_> = ips.iter().map(|ip| (ip.address, ip.cidr)).collect();
    sorted.sort();
    sorted
}

/// Diff a live kernel peer list against the reconciler's desired set,
/// producing the minimal list of peer updates. An empty result means the
/// device already matches.
pub fn diff_desired(existing: &[PeerInfo], desired: &[DesiredPeer]) -> Vec<PeerConfigBuilder> {
    let mut updates = vec![];

    for want in desired {
        let current = existing
            .iter()
            .find(|peer| peer.config.public_key == want.public_key);
        let mut builder = PeerConfigBuilder::new(&want.public_key);
        let mut changed = false;

        let want_ips = {
            let mut sorted: Vec<_> = want
                .allowed_ips
                .iter()
                .map(|ip| (ip.address, ip.cidr))
                .collect();
            sorted.sort();
            sorted
        };
        let have_ips = current
            .map(|info| sorted_allowed_ips(&info.config.allowed_ips))
            .unwrap_or_default();
        if current.is_none() || want_ips != have_ips {
            builder = builder
                .replace_allowed_ips()
                .add_allowed_ips(&want.allowed_ips);
            changed = true;
        }

        let have_keepalive = current.and_then(|info| {
            info.config
                .persistent_keepalive_interval
                .filter(|interval| *interval != 0)
        });
        if have_keepalive != want.keepalive {
            builder = match want.keepalive {
                Some(interval) => builder.set_persistent_keepalive_interval(interval),
                None => builder.unset_persistent_keepalive(),
            };
            changed = true;
        }

        if let Some(endpoint) = want.endpoint {
            let have = current.and_then(|info| info.config.endpoint);
            let session_live = current.map(|info| info.is_session_live()).unwrap_or(false);
            // Leave a live session's roamed endpoint alone; a promotion to
            // a better-ranked endpoint only lands once the session is cold.
            if have != Some(endpoint) && !session_live {
                builder = builder.set_endpoint(endpoint);
                changed = true;
            }
        }

        if let Some(psk) = &want.preshared_key {
            let have = current.and_then(|info| info.config.preshared_key.as_ref());
            if have != Some(psk) {
                builder = builder.set_preshared_key(psk.clone());
                changed = true;
            }
        }

        if changed {
            updates.push(builder);
        }
    }

    // Remove any kernel peers that are no longer desired.
    let removals = existing.iter().filter_map(|peer| {
        let key = &peer.config.public_key;
        if desired.iter().any(|want| want.public_key == *key) {
            None
        } else {
            Some(PeerConfigBuilder::new(key).remove())
        }
    });

    updates.extend(removals);
    updates
}

pub trait DeviceExt {
    fn diff_desired(&self, desired: &[DesiredPeer]) -> Vec<PeerConfigBuilder>;

    /// Get a peer by their public key, a helper function.
    fn get_peer(&self, public_key: &Key) -> Option<&PeerInfo>;

    /// Last-handshake timestamps keyed by base64 public key.
    fn handshakes(&self) -> HashMap<String, Option<SystemTime>>;

    /// (rx, tx) byte counters keyed by base64 public key.
    fn transfer(&self) -> HashMap<String, (u64, u64)>;
}

impl DeviceExt for Device {
    fn diff_desired(&self, desired: &[DesiredPeer]) -> Vec<PeerConfigBuilder> {
        diff_desired(&self.peers, desired)
    }

    fn get_peer(&self, public_key: &Key) -> Option<&PeerInfo> {
        self.peers
            .iter()
            .find(|peer| peer.config.public_key == *public_key)
    }

    fn handshakes(&self) -> HashMap<String, Option<SystemTime>> {
        self.peers
            .iter()
            .map(|peer| {
                (
                    peer.config.public_key.to_base64(),
                    peer.stats.last_handshake_time,
                )
            })
            .collect()
    }

    fn transfer(&self) -> HashMap<String, (u64, u64)> {
        self.peers
            .iter()
            .map(|peer| {
                (
                    peer.config.public_key.to_base64(),
                    (peer.stats.rx_bytes, peer.stats.tx_bytes),
                )
            })
            .collect()
    }
}

/// The kernel drops a session's keys once the handshake is old enough, so
/// handshake age doubles as a cheap liveness signal.
pub trait PeerInfoExt {
    /// Time since the last completed handshake, if any.
    fn handshake_age(&self) -> Option<Duration>;

    /// Whether the tunnel still holds a usable session.
    fn is_session_live(&self) -> bool;
}

impl PeerInfoExt for PeerInfo {
    fn handshake_age(&self) -> Option<Duration> {
        self.stats
            .last_handshake_time
            .and_then(|at| at.elapsed().ok())
    }

    fn is_session_live(&self) -> bool {
        // Sessions expire REJECT_AFTER_TIME (180 s) after their handshake.
        const SESSION_WINDOW: Duration = Duration::from_secs(180);

        matches!(self.handshake_age(), Some(age) if age <= SESSION_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireguard_control::{AllowedIp, PeerStats};

    const PUBKEY: &str = "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=";

    fn desired(endpoint: Option<&str>) -> DesiredPeer {
        DesiredPeer {
            public_key: Key::from_base64(PUBKEY).unwrap(),
            endpoint: endpoint.map(|e| e.parse().unwrap()),
            allowed_ips: vec![AllowedIp {
                address: "10.42.0.1".parse().unwrap(),
                cidr: 32,
            }],
            keepalive: Some(25),
            preshared_key: None,
        }
    }

    fn installed(desired: &DesiredPeer) -> PeerInfo {
        let mut builder = PeerConfigBuilder::new(&desired.public_key)
            .add_allowed_ips(&desired.allowed_ips);
        if let Some(endpoint) = desired.endpoint {
            builder = builder.set_endpoint(endpoint);
        }
        if let Some(keepalive) = desired.keepalive {
            builder = builder.set_persistent_keepalive_interval(keepalive);
        }
        PeerInfo {
            config: builder.into_peer_config(),
            stats: PeerStats::default(),
        }
    }

    #[test]
    fn no_changes_no_updates() {
        let want = desired(Some("203.0.113.9:51820"));
        let existing = vec![installed(&want)];
        assert!(diff_desired(&existing, &[want]).is_empty());
    }

    #[test]
    fn new_peer_installed() {
        let updates = diff_desired(&[], &[desired(None)]);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn missing_peer_removed() {
        let want = desired(None);
        let existing = vec![installed(&want)];
        let updates = diff_desired(&existing, &[]);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn endpoint_change_detected() {
        let want = desired(Some("203.0.113.9:51820"));
        let existing = vec![installed(&want)];

        let moved = desired(Some("198.51.100.2:51820"));
        let updates = diff_desired(&existing, &[moved]);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn endpoint_left_alone_while_session_live() {
        let want = desired(Some("203.0.113.9:51820"));
        let mut info = installed(&want);
        info.stats.last_handshake_time = Some(SystemTime::now());
        let existing = vec![info];

        let moved = desired(Some("198.51.100.2:51820"));
        assert!(diff_desired(&existing, &[moved]).is_empty());
    }

    #[test]
    fn allowed_ip_order_is_irrelevant() {
        let mut want = desired(None);
        want.allowed_ips = vec![
            AllowedIp {
                address: "10.42.0.1".parse().unwrap(),
                cidr: 32,
            },
            AllowedIp {
                address: "192.168.7.0".parse().unwrap(),
                cidr: 24,
            },
        ];
        let existing = vec![installed(&want)];

        want.allowed_ips.reverse();
        assert!(diff_desired(&existing, &[want]).is_empty());
    }

    #[test]
    fn relayed_peer_keeps_unset_endpoint() {
        // A relayed peer has no endpoint in its desired config; the diff
        // must not try to "unset" the kernel's last-known endpoint (the
        // allowed-ips move to the introducer instead).
        let direct = desired(Some("203.0.113.9:51820"));
        let existing = vec![installed(&direct)];

        let relayed = desired(None);
        assert!(diff_desired(&existing, &[relayed]).is_empty());
    }

    #[test]
    fn session_liveness_follows_handshake_age() {
        let mut info = installed(&desired(None));
        assert!(info.handshake_age().is_none());
        assert!(!info.is_session_live());

        info.stats.last_handshake_time = Some(SystemTime::now());
        assert!(info.is_session_live());

        info.stats.last_handshake_time =
            Some(SystemTime::now() - Duration::from_secs(10 * 60));
        assert!(!info.is_session_live());
        assert!(info.handshake_age().unwrap() >= Duration::from_secs(10 * 60));
    }
}
