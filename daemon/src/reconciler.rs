//! The reconciliation loop.
//!
//! Every 5 s: snapshot the active peer set, decide who is direct and who
//! goes through an introducer, compute the desired kernel peer set and
//! route table, and apply the minimal difference. Ticks are serialized; a
//! tick that overruns skips its next slot instead of overlapping.

use crate::{routes, MeshContext};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use shared::{
    wg, DesiredPeer, MeshPeer, NatKind, RouteEntry, PERSISTENT_KEEPALIVE_INTERVAL_SECS,
};
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};
use wireguard_control::{AllowedIp, Device, DeviceUpdate};

pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Why a peer is being routed through an introducer. The store conflates
/// these under temporary-offline; keeping them apart here makes the status
/// surface and the logs say which failure mode actually hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayReason {
    NoEndpoint,
    SymmetricNat,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDecision {
    pub peer: String,
    pub introducer: String,
    pub reason: RelayReason,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub peers: Vec<DesiredPeer>,
    pub relays: Vec<RelayDecision>,
    pub routes: Vec<RouteEntry>,
}

fn key_hash(public_key: &str) -> [u8; 32] {
    let bytes = BASE64
        .decode(public_key)
        .unwrap_or_else(|_| public_key.as_bytes().to_vec());
    Sha256::digest(&bytes).into()
}

fn relay_reason(peer: &MeshPeer, self_nat: NatKind, now: SystemTime) -> Option<RelayReason> {
    if peer.endpoint.is_none() {
        Some(RelayReason::NoEndpoint)
    } else if peer.nat == NatKind::Symmetric && self_nat == NatKind::Symmetric {
        Some(RelayReason::SymmetricNat)
    } else if peer.stale_twice || peer.is_temporarily_offline(now) {
        Some(RelayReason::Unreachable)
    } else {
        None
    }
}

/// Picks the introducer for a relayed peer: active, introducer-capable,
/// itself directly reachable, with the lowest public-key hash as the
/// deterministic tiebreak so every tick (and every node) lands on the same
/// choice and routes don't flap.
pub fn eligible_introducer<'a>(
    active: &'a [MeshPeer],
    exclude: &str,
    now: SystemTime,
) -> Option<&'a MeshPeer> {
    active
        .iter()
        .filter(|candidate| {
            candidate.public_key != exclude
                && candidate.introducer
                && candidate.endpoint.is_some()
                && !candidate.stale_twice
                && !candidate.is_temporarily_offline(now)
        })
        .min_by_key(|candidate| key_hash(&candidate.public_key))
}

/// Computes the entire desired state from a store snapshot. Pure: same
/// snapshot in, same plan out, which is what makes reconciliation
/// idempotent.
pub fn plan(active: &[MeshPeer], self_nat: NatKind, now: SystemTime) -> Plan {
    let mut ordered: Vec<&MeshPeer> = active.iter().collect();
    ordered.sort_by(|a, b| a.public_key.cmp(&b.public_key));

    // First pass: who gets relayed, and through whom.
    let mut relays = Vec::new();
    let mut relayed_via: HashMap<&str, &MeshPeer> = HashMap::new();
    for peer in &ordered {
        let Some(reason) = relay_reason(peer, self_nat, now) else {
            continue;
        };
        let Some(introducer) = eligible_introducer(active, &peer.public_key, now) else {
            // No usable introducer: leave the peer direct (possibly
            // endpoint-less) and let discovery try again.
            continue;
        };
        relayed_via.insert(peer.public_key.as_str(), introducer);
        relays.push(RelayDecision {
            peer: peer.public_key.clone(),
            introducer: introducer.public_key.clone(),
            reason,
        });
    }

    // Second pass: per-peer desired configs and routes.
    let mut peers = Vec::new();
    let mut route_entries = Vec::new();
    let mut extra_allowed: HashMap<String, Vec<AllowedIp>> = HashMap::new();

    for peer in &ordered {
        let Ok(public_key) = peer.key() else {
            log::debug!("skipping peer with undecodable key {}", peer.public_key);
            continue;
        };

        if let Some(introducer) = relayed_via.get(peer.public_key.as_str()) {
            // Relayed: empty endpoint, and this peer's cryptokey routing
            // moves over to the introducer.
            peers.push(DesiredPeer {
                public_key,
                endpoint: None,
                allowed_ips: vec![],
                keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
                preshared_key: None,
            });
            let extras = extra_allowed
                .entry(introducer.public_key.clone())
                .or_default();
            extras.push(AllowedIp {
                address: IpAddr::V4(peer.ipv4),
                cidr: 32,
            });
            for network in &peer.routes {
                extras.push(AllowedIp {
                    address: network.network(),
                    cidr: network.prefix_len(),
                });
                route_entries.push(RouteEntry {
                    cidr: *network,
                    gateway: Some(gateway_for(network, introducer)),
                });
            }
        } else {
            let mut allowed_ips = vec![
                AllowedIp {
                    address: IpAddr::V4(peer.ipv4),
                    cidr: 32,
                },
                AllowedIp {
                    address: IpAddr::V6(peer.ipv6),
                    cidr: 128,
                },
            ];
            for network in &peer.routes {
                allowed_ips.push(AllowedIp {
                    address: network.network(),
                    cidr: network.prefix_len(),
                });
                route_entries.push(RouteEntry {
                    cidr: *network,
                    gateway: Some(gateway_for(network, peer)),
                });
            }
            peers.push(DesiredPeer {
                public_key,
                endpoint: peer.endpoint.as_ref().and_then(|e| e.resolve().ok()),
                allowed_ips,
                keepalive: Some(PERSISTENT_KEEPALIVE_INTERVAL_SECS),
                preshared_key: None,
            });
        }
    }

    // Fold the relayed peers' networks into their introducers' configs.
    for desired in &mut peers {
        let key = desired.public_key.to_base64();
        if let Some(extras) = extra_allowed.remove(&key) {
            desired.allowed_ips.extend(extras);
        }
    }

    Plan {
        peers,
        relays,
        routes: route_entries,
    }
}

fn gateway_for(network: &ipnet::IpNet, via: &MeshPeer) -> IpAddr {
    match network {
        ipnet::IpNet::V4(_) => IpAddr::V4(via.ipv4),
        ipnet::IpNet::V6(_) => IpAddr::V6(via.ipv6),
    }
}

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![crate::discovery::spawn_layer("reconciler", run(ctx))]
}

async fn run(ctx: Arc<MeshContext>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = ctx.shutdown.subscribe();
    let mut forward_rule = routes::ForwardRule::new(&ctx.interface);

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = shutdown.recv() => return Ok(()),
        }
        if let Err(e) = tick(&ctx, &mut forward_rule) {
            log::debug!("reconcile tick failed: {}", e);
        }
    }
}

fn tick(ctx: &Arc<MeshContext>, forward_rule: &mut routes::ForwardRule) -> anyhow::Result<()> {
    let active = ctx.store.active();
    let plan = plan(&active, ctx.stun.nat(), SystemTime::now());

    let device = Device::get(&ctx.interface, ctx.backend)?;
    let updates = wg::diff_desired(&device.peers, &plan.peers);
    if !updates.is_empty() {
        log::info!("applying {} kernel peer update(s)", updates.len());
        for relay in &plan.relays {
            log::debug!(
                "relaying {} via {} ({:?})",
                relay.peer,
                relay.introducer,
                relay.reason
            );
        }
        if let Err(e) = DeviceUpdate::new()
            .add_peers(&updates)
            .apply(&ctx.interface, ctx.backend)
        {
            // Other peers in the batch may have landed; next tick retries.
            log::warn!("kernel peer update failed: {}", e);
        }
    }

    match routes::sync(&ctx.interface, &plan.routes) {
        Ok(true) => {
            if let Err(e) = routes::enable_ipv4_forwarding() {
                log::warn!("could not enable IPv4 forwarding: {}", e);
            }
        },
        Ok(false) => {},
        Err(e) => log::warn!("route sync failed: {}", e),
    }

    forward_rule.ensure(!plan.relays.is_empty());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Source;
    use std::collections::BTreeSet;
    use wireguard_control::KeyPair;

    fn peer(ipv4: &str) -> MeshPeer {
        MeshPeer {
            public_key: KeyPair::generate().public.to_base64(),
            ipv4: ipv4.parse().unwrap(),
            ipv6: "fd00::10".parse().unwrap(),
            endpoint: Some("203.0.113.10:51820".parse().unwrap()),
            endpoint_source: Some(Source::Dht),
            routes: vec![],
            nat: NatKind::Cone,
            introducer: false,
            sources: BTreeSet::from([Source::Dht]),
            last_update: SystemTime::now(),
            stale_once: false,
            stale_twice: false,
            offline_until: None,
        }
    }

    fn find<'a>(plan: &'a Plan, key: &str) -> &'a DesiredPeer {
        plan.peers
            .iter()
            .find(|p| p.public_key.to_base64() == key)
            .expect("peer in plan")
    }

    #[test]
    fn healthy_peer_gets_direct_config() {
        let mut p = peer("10.42.1.1");
        p.routes = vec!["192.168.5.0/24".parse().unwrap()];
        let plan = plan(&[p.clone()], NatKind::Cone, SystemTime::now());

        let desired = find(&plan, &p.public_key);
        assert!(desired.endpoint.is_some());
        assert_eq!(desired.allowed_ips.len(), 3); // /32 + /128 + route
        assert_eq!(desired.keepalive, Some(25));
        assert!(plan.relays.is_empty());

        // The advertised network routes via the peer's mesh IP.
        assert_eq!(plan.routes.len(), 1);
        assert_eq!(plan.routes[0].gateway, Some("10.42.1.1".parse().unwrap()));
    }

    #[test]
    fn offline_peer_is_relayed_through_introducer() {
        let mut offline = peer("10.42.1.1");
        offline.offline_until = Some(SystemTime::now() + Duration::from_secs(30));

        let mut introducer = peer("10.42.1.2");
        introducer.introducer = true;

        let plan = plan(
            &[offline.clone(), introducer.clone()],
            NatKind::Cone,
            SystemTime::now(),
        );

        assert_eq!(plan.relays.len(), 1);
        assert_eq!(plan.relays[0].peer, offline.public_key);
        assert_eq!(plan.relays[0].introducer, introducer.public_key);
        assert_eq!(plan.relays[0].reason, RelayReason::Unreachable);

        // (a) the relayed peer's applied endpoint is empty...
        let relayed = find(&plan, &offline.public_key);
        assert!(relayed.endpoint.is_none());
        assert!(relayed.allowed_ips.is_empty());

        // (b) ...and the introducer's allowed-ips cover its mesh /32.
        let via = find(&plan, &introducer.public_key);
        assert!(via.allowed_ips.iter().any(|ip| {
            ip.address == IpAddr::V4(offline.ipv4) && ip.cidr == 32
        }));
    }

    #[test]
    fn symmetric_pair_relays() {
        let mut symmetric = peer("10.42.1.1");
        symmetric.nat = NatKind::Symmetric;
        let mut introducer = peer("10.42.1.2");
        introducer.introducer = true;

        let plan1 = plan(
            &[symmetric.clone(), introducer],
            NatKind::Symmetric,
            SystemTime::now(),
        );
        assert_eq!(plan1.relays.len(), 1);
        assert_eq!(plan1.relays[0].reason, RelayReason::SymmetricNat);

        // From behind a cone NAT the same peer is fine to dial directly.
        let mut introducer2 = peer("10.42.1.3");
        introducer2.introducer = true;
        let mut symmetric2 = peer("10.42.1.1");
        symmetric2.nat = NatKind::Symmetric;
        let plan2 = plan(&[symmetric2, introducer2], NatKind::Cone, SystemTime::now());
        assert!(plan2.relays.is_empty());
    }

    #[test]
    fn stale_twice_triggers_relay() {
        let mut stale = peer("10.42.1.1");
        stale.stale_twice = true;
        let mut introducer = peer("10.42.1.2");
        introducer.introducer = true;

        let plan = plan(&[stale, introducer], NatKind::Cone, SystemTime::now());
        assert_eq!(plan.relays.len(), 1);
        assert_eq!(plan.relays[0].reason, RelayReason::Unreachable);
    }

    #[test]
    fn no_introducer_leaves_peer_direct() {
        let mut offline = peer("10.42.1.1");
        offline.offline_until = Some(SystemTime::now() + Duration::from_secs(30));
        // The only other peer is not introducer-capable.
        let bystander = peer("10.42.1.2");

        let plan = plan(&[offline.clone(), bystander], NatKind::Cone, SystemTime::now());
        assert!(plan.relays.is_empty());
        let desired = find(&plan, &offline.public_key);
        assert!(!desired.allowed_ips.is_empty());
    }

    #[test]
    fn unhealthy_introducers_are_not_eligible() {
        let now = SystemTime::now();
        let mut offline_introducer = peer("10.42.1.2");
        offline_introducer.introducer = true;
        offline_introducer.stale_twice = true;

        assert!(eligible_introducer(&[offline_introducer], "someone-else", now).is_none());
    }

    #[test]
    fn introducer_tiebreak_is_deterministic() {
        let now = SystemTime::now();
        let mut a = peer("10.42.1.2");
        a.introducer = true;
        let mut b = peer("10.42.1.3");
        b.introducer = true;

        let forward = eligible_introducer(&[a.clone(), b.clone()], "x", now)
            .unwrap()
            .public_key
            .clone();
        let backward = eligible_introducer(&[b, a], "x", now)
            .unwrap()
            .public_key
            .clone();
        assert_eq!(forward, backward);
    }

    #[test]
    fn relayed_peer_routes_go_via_introducer() {
        let mut offline = peer("10.42.1.1");
        offline.offline_until = Some(SystemTime::now() + Duration::from_secs(30));
        offline.routes = vec!["192.168.9.0/24".parse().unwrap()];

        let mut introducer = peer("10.42.1.2");
        introducer.introducer = true;

        let plan = plan(
            &[offline, introducer.clone()],
            NatKind::Cone,
            SystemTime::now(),
        );
        assert_eq!(plan.routes.len(), 1);
        assert_eq!(plan.routes[0].gateway, Some(IpAddr::V4(introducer.ipv4)));

        // The introducer's allowed-ips must cover the relayed network too,
        // or the kernel route would dead-end at cryptokey routing.
        let via = find(&plan, &introducer.public_key);
        assert!(via
            .allowed_ips
            .iter()
            .any(|ip| ip.address == "192.168.9.0".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn plan_is_deterministic() {
        let mut offline = peer("10.42.1.1");
        offline.offline_until = Some(SystemTime::now() + Duration::from_secs(30));
        let mut introducer = peer("10.42.1.2");
        introducer.introducer = true;
        let healthy = peer("10.42.1.3");

        let now = SystemTime::now();
        let snapshot = vec![offline, introducer, healthy];
        let first = plan(&snapshot, NatKind::Cone, now);
        let second = plan(&snapshot, NatKind::Cone, now);
        assert_eq!(first, second);

        let mut reversed = snapshot.clone();
        reversed.reverse();
        let third = plan(&reversed, NatKind::Cone, now);
        assert_eq!(first, third);
    }

    #[test]
    fn empty_snapshot_empty_plan() {
        let plan = plan(&[], NatKind::Unknown, SystemTime::now());
        assert!(plan.peers.is_empty());
        assert!(plan.relays.is_empty());
        assert!(plan.routes.is_empty());
    }
}
