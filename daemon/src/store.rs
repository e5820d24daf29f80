//! The peer store: the one mutable structure every component shares.
//!
//! Discovery layers write observations in, the reconciler and health
//! monitor read snapshots out. Updates are atomic per key and event
//! notifications are emitted after the critical section, so subscribers
//! may call back into the store.

use crate::collision;
use parking_lot::RwLock;
use shared::{MeshPeer, Source};
use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};
use tokio::sync::broadcast;

/// Flood guard: a mesh secret leak shouldn't let an attacker balloon our
/// memory with synthetic peers.
pub const PEER_CAP: usize = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Added(String),
    EndpointChanged(String),
    Evicted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Merged (or inserted); nothing else to do.
    Accepted,
    /// Store is at capacity and the peer was new.
    RejectedAtCap,
    /// The observation claims our own mesh IPv4 and wins the tiebreak;
    /// the daemon must re-derive the local address.
    LocalCollision,
    /// The observation carries our own public key and was ignored.
    SelfObservation,
}

pub struct PeerStore {
    local_pubkey: String,
    subnet: u8,
    local_ipv4: RwLock<Ipv4Addr>,
    peers: RwLock<HashMap<String, MeshPeer>>,
    events: broadcast::Sender<Event>,
    rejected_at_cap: AtomicU64,
    dropped_by_source: RwLock<BTreeMap<Source, u64>>,
}

impl PeerStore {
    pub fn new(local_pubkey: String, subnet: u8, local_ipv4: Ipv4Addr) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local_pubkey,
            subnet,
            local_ipv4: RwLock::new(local_ipv4),
            peers: RwLock::new(HashMap::new()),
            events,
            rejected_at_cap: AtomicU64::new(0),
            dropped_by_source: RwLock::new(BTreeMap::new()),
        }
    }

    /// Keeps the collision detector in sync when the local address is
    /// re-derived.
    pub fn set_local_ipv4(&self, ipv4: Ipv4Addr) {
        *self.local_ipv4.write() = ipv4;
    }

    pub fn local_ipv4(&self) -> Ipv4Addr {
        *self.local_ipv4.read()
    }

    /// Merge an observation from a discovery layer. Endpoint replacement
    /// follows the rank order; sources accumulate; `last_update` always
    /// refreshes. New peers are rejected once the store is at capacity.
    pub fn update(&self, mut incoming: MeshPeer, source: Source) -> UpdateOutcome {
        if incoming.public_key == self.local_pubkey {
            return UpdateOutcome::SelfObservation;
        }

        let now = SystemTime::now();
        let mut pending_events = Vec::new();
        let outcome = {
            let mut peers = self.peers.write();

            let local_ipv4 = *self.local_ipv4.read();
            // The incoming peer may win an address collision against us; it
            // is stored as-is either way and the daemon re-derives locally.
            let local_lost = matches!(
                collision::resolve_incoming(
                    self.subnet,
                    &self.local_pubkey,
                    local_ipv4,
                    &mut peers,
                    &mut incoming,
                ),
                collision::Resolution::LocalLoses
            );

            let merge = match peers.get_mut(&incoming.public_key) {
                Some(existing) => {
                    existing.sources.insert(source);
                    if let Some(endpoint) = incoming.endpoint.take() {
                        if existing.should_replace_endpoint(&endpoint, source) {
                            let changed = existing.endpoint.as_ref() != Some(&endpoint);
                            existing.endpoint = Some(endpoint);
                            existing.endpoint_source = Some(source);
                            if changed {
                                pending_events
                                    .push(Event::EndpointChanged(existing.public_key.clone()));
                            }
                        }
                    }
                    existing.ipv4 = incoming.ipv4;
                    existing.ipv6 = incoming.ipv6;
                    if !incoming.routes.is_empty() || source != Source::Cache {
                        existing.routes = incoming.routes;
                    }
                    if incoming.nat != shared::NatKind::Unknown {
                        existing.nat = incoming.nat;
                    }
                    existing.introducer = incoming.introducer;
                    existing.last_update = now;
                    UpdateOutcome::Accepted
                },
                None => {
                    if peers.len() >= PEER_CAP {
                        self.rejected_at_cap.fetch_add(1, Ordering::Relaxed);
                        UpdateOutcome::RejectedAtCap
                    } else {
                        incoming.sources.insert(source);
                        if incoming.endpoint.is_some() {
                            incoming.endpoint_source = Some(source);
                        }
                        incoming.last_update = now;
                        pending_events.push(Event::Added(incoming.public_key.clone()));
                        peers.insert(incoming.public_key.clone(), incoming);
                        UpdateOutcome::Accepted
                    }
                },
            };
            if local_lost && merge == UpdateOutcome::Accepted {
                UpdateOutcome::LocalCollision
            } else {
                merge
            }
        };

        for event in pending_events {
            // Best-effort: lagging subscribers drop events, never block us.
            let _ = self.events.send(event);
        }
        outcome
    }

    pub fn get(&self, public_key: &str) -> Option<MeshPeer> {
        self.peers.read().get(public_key).cloned()
    }

    pub fn all(&self) -> Vec<MeshPeer> {
        self.peers.read().values().cloned().collect()
    }

    /// Peers updated within the active window.
    pub fn active(&self) -> Vec<MeshPeer> {
        let now = SystemTime::now();
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_active(now))
            .cloned()
            .collect()
    }

    /// Peers still retained but past the active window.
    pub fn dead(&self) -> Vec<MeshPeer> {
        let now = SystemTime::now();
        self.peers
            .read()
            .values()
            .filter(|peer| !peer.is_active(now) && !peer.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn mark_temporary_offline(&self, public_key: &str, duration: Duration) {
        if let Some(peer) = self.peers.write().get_mut(public_key) {
            peer.offline_until = Some(SystemTime::now() + duration);
        }
    }

    pub fn clear_temporary_offline(&self, public_key: &str) {
        if let Some(peer) = self.peers.write().get_mut(public_key) {
            peer.offline_until = None;
        }
    }

    /// Records one staleness sample for a peer: a stale sample promotes
    /// stale-once to stale-twice, a fresh one clears both.
    pub fn record_staleness(&self, public_key: &str, stale: bool) {
        if let Some(peer) = self.peers.write().get_mut(public_key) {
            if stale {
                if peer.stale_once {
                    peer.stale_twice = true;
                } else {
                    peer.stale_once = true;
                }
            } else {
                peer.stale_once = false;
                peer.stale_twice = false;
            }
        }
    }

    /// Removes entries past the retention window. Returns how many were
    /// evicted.
    pub fn cleanup_stale(&self) -> usize {
        let now = SystemTime::now();
        let mut evicted = Vec::new();
        {
            let mut peers = self.peers.write();
            peers.retain(|public_key, peer| {
                if peer.is_expired(now) {
                    evicted.push(Event::Evicted(public_key.clone()));
                    false
                } else {
                    true
                }
            });
        }
        let count = evicted.len();
        for event in evicted {
            let _ = self.events.send(event);
        }
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Bumps the reject counter for peer-supplied garbage from a source.
    pub fn note_rejected(&self, source: Source) {
        *self.dropped_by_source.write().entry(source).or_insert(0) += 1;
    }

    pub fn rejected_counts(&self) -> BTreeMap<Source, u64> {
        self.dropped_by_source.read().clone()
    }

    pub fn rejected_at_cap(&self) -> u64 {
        self.rejected_at_cap.load(Ordering::Relaxed)
    }

    /// (active, total, dead) counts for the status surface.
    pub fn counts(&self) -> (usize, usize, usize) {
        let now = SystemTime::now();
        let peers = self.peers.read();
        let total = peers.len();
        let active = peers.values().filter(|peer| peer.is_active(now)).count();
        let dead = peers
            .values()
            .filter(|peer| !peer.is_active(now) && !peer.is_expired(now))
            .count();
        (active, total, dead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::NatKind;
    use std::collections::BTreeSet;

    fn store() -> PeerStore {
        PeerStore::new(
            "LOCALLOCALLOCALLOCALLOCALLOCALLOCALLOCALLOC=".into(),
            42,
            "10.42.0.99".parse().unwrap(),
        )
    }

    fn peer(key: &str, ipv4: &str, endpoint: Option<&str>) -> MeshPeer {
        MeshPeer {
            public_key: key.into(),
            ipv4: ipv4.parse().unwrap(),
            ipv6: "fd00::1".parse().unwrap(),
            endpoint: endpoint.map(|e| e.parse().unwrap()),
            endpoint_source: None,
            routes: vec![],
            nat: NatKind::Unknown,
            introducer: false,
            sources: BTreeSet::new(),
            last_update: SystemTime::now(),
            stale_once: false,
            stale_twice: false,
            offline_until: None,
        }
    }

    #[test]
    fn sources_accumulate() {
        let store = store();
        store.update(peer("a", "10.42.1.1", None), Source::Dht);
        store.update(peer("a", "10.42.1.1", None), Source::Gossip);

        let merged = store.get("a").unwrap();
        assert!(merged.sources.contains(&Source::Dht));
        assert!(merged.sources.contains(&Source::Gossip));
    }

    #[test]
    fn rank_promotion_and_demotion() {
        let store = store();
        store.update(peer("a", "10.42.1.1", Some("1.1.1.1:1000")), Source::Gossip);
        store.update(peer("a", "10.42.1.1", Some("2.2.2.2:2000")), Source::Lan);

        let merged = store.get("a").unwrap();
        assert_eq!(merged.endpoint.unwrap().to_string(), "2.2.2.2:2000");
        assert_eq!(merged.endpoint_source, Some(Source::Lan));

        // A lower-ranked observation afterwards must not displace it.
        store.update(peer("a", "10.42.1.1", Some("3.3.3.3:3000")), Source::Gossip);
        let merged = store.get("a").unwrap();
        assert_eq!(merged.endpoint.unwrap().to_string(), "2.2.2.2:2000");
    }

    #[test]
    fn endpoint_rank_is_order_independent() {
        // lan-then-gossip and gossip-then-lan both settle on the lan one.
        let forward = store();
        forward.update(peer("a", "10.42.1.1", Some("1.1.1.1:1000")), Source::Lan);
        forward.update(peer("a", "10.42.1.1", Some("2.2.2.2:2000")), Source::Gossip);

        let backward = store();
        backward.update(peer("a", "10.42.1.1", Some("2.2.2.2:2000")), Source::Gossip);
        backward.update(peer("a", "10.42.1.1", Some("1.1.1.1:1000")), Source::Lan);

        assert_eq!(
            forward.get("a").unwrap().endpoint,
            backward.get("a").unwrap().endpoint,
        );
        assert_eq!(
            forward.get("a").unwrap().endpoint.unwrap().to_string(),
            "1.1.1.1:1000"
        );
    }

    #[test]
    fn cap_rejects_new_but_keeps_existing_updatable() {
        let store = store();
        for i in 0..2000u32 {
            let outcome = store.update(peer(&format!("key-{i}"), "10.42.1.1", None), Source::Dht);
            if i < PEER_CAP as u32 {
                assert_eq!(outcome, UpdateOutcome::Accepted, "peer {i}");
            } else {
                assert_eq!(outcome, UpdateOutcome::RejectedAtCap, "peer {i}");
            }
        }
        assert_eq!(store.len(), PEER_CAP);
        assert_eq!(store.rejected_at_cap(), 1000);

        // Existing entries still merge fine at cap.
        assert_eq!(
            store.update(peer("key-0", "10.42.1.1", None), Source::Gossip),
            UpdateOutcome::Accepted
        );
    }

    #[test]
    fn self_observations_ignored() {
        let store = store();
        let outcome = store.update(
            peer("LOCALLOCALLOCALLOCALLOCALLOCALLOCALLOCALLOC=", "10.42.0.99", None),
            Source::Lan,
        );
        assert_eq!(outcome, UpdateOutcome::SelfObservation);
        assert!(store.is_empty());
    }

    #[test]
    fn events_emitted_for_add_and_endpoint_change() {
        let store = store();
        let mut events = store.subscribe();

        store.update(peer("a", "10.42.1.1", Some("1.1.1.1:1000")), Source::Gossip);
        assert_eq!(events.try_recv().unwrap(), Event::Added("a".into()));

        store.update(peer("a", "10.42.1.1", Some("2.2.2.2:2000")), Source::Lan);
        assert_eq!(events.try_recv().unwrap(), Event::EndpointChanged("a".into()));

        // Same endpoint again: no event.
        store.update(peer("a", "10.42.1.1", Some("2.2.2.2:2000")), Source::Lan);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn staleness_ladder() {
        let store = store();
        store.update(peer("a", "10.42.1.1", None), Source::Dht);

        store.record_staleness("a", true);
        let merged = store.get("a").unwrap();
        assert!(merged.stale_once && !merged.stale_twice);

        store.record_staleness("a", true);
        let merged = store.get("a").unwrap();
        assert!(merged.stale_twice);

        store.record_staleness("a", false);
        let merged = store.get("a").unwrap();
        assert!(!merged.stale_once && !merged.stale_twice);
    }

    #[test]
    fn temporary_offline_round_trip() {
        let store = store();
        store.update(peer("a", "10.42.1.1", None), Source::Dht);

        store.mark_temporary_offline("a", Duration::from_secs(30));
        assert!(store
            .get("a")
            .unwrap()
            .is_temporarily_offline(SystemTime::now()));

        store.clear_temporary_offline("a");
        assert!(!store
            .get("a")
            .unwrap()
            .is_temporarily_offline(SystemTime::now()));
    }

    #[test]
    fn cleanup_evicts_expired_entries() {
        let store = store();
        store.update(peer("a", "10.42.1.1", None), Source::Dht);
        store.update(peer("b", "10.42.1.2", None), Source::Dht);

        // Age one entry past retention by hand.
        {
            let mut peers = store.peers.write();
            peers.get_mut("a").unwrap().last_update =
                SystemTime::now() - Duration::from_secs(11 * 60);
        }

        let mut events = store.subscribe();
        assert_eq!(store.cleanup_stale(), 1);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_some());
        assert_eq!(events.try_recv().unwrap(), Event::Evicted("a".into()));
    }

    #[test]
    fn rejected_counters() {
        let store = store();
        store.note_rejected(Source::Lan);
        store.note_rejected(Source::Lan);
        store.note_rejected(Source::Gossip);
        let counts = store.rejected_counts();
        assert_eq!(counts.get(&Source::Lan), Some(&2));
        assert_eq!(counts.get(&Source::Gossip), Some(&1));
    }
}
