//! Mesh IPv4 collision resolution.
//!
//! Two public keys can hash into the same host part of the mesh /16. The
//! winner is always the byte-lexicographically smaller public key; the
//! loser re-derives with an incrementing nonce byte until its address is
//! free. Because derivation is deterministic, every node reaches the same
//! verdict locally without any negotiation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use shared::{identity, MeshPeer};
use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    NoCollision,
    /// The incoming observation (or a stored peer) was re-derived locally.
    Resolved,
    /// The incoming peer wins against our own address; the daemon must
    /// re-derive the local identity.
    LocalLoses,
}

/// Raw key bytes for the lexicographic tiebreak. Keys that fail to decode
/// (which a well-formed peer never produces) compare as their raw text.
fn key_bytes(public_key: &str) -> Vec<u8> {
    BASE64
        .decode(public_key)
        .unwrap_or_else(|_| public_key.as_bytes().to_vec())
}

/// `true` when `a` beats `b` and keeps its address.
pub fn wins(a: &str, b: &str) -> bool {
    key_bytes(a) < key_bytes(b)
}

/// Finds the nonce a peer's current address was derived at, so
/// re-derivation continues the chain instead of restarting it.
pub fn infer_nonce(subnet: u8, public_key: &str, ipv4: Ipv4Addr) -> Option<u8> {
    let bytes = key_bytes(public_key);
    (0..=u8::MAX).find(|nonce| identity::mesh_ipv4(subnet, &bytes, *nonce) == ipv4)
}

/// The first nonce strictly after `start` whose derived address isn't
/// taken. Returns `None` only if the entire nonce space is exhausted.
pub fn next_free(
    subnet: u8,
    public_key: &str,
    start: u8,
    taken: &HashSet<Ipv4Addr>,
) -> Option<(u8, Ipv4Addr)> {
    let bytes = key_bytes(public_key);
    ((start.saturating_add(1))..=u8::MAX).find_map(|nonce| {
        let candidate = identity::mesh_ipv4(subnet, &bytes, nonce);
        (!taken.contains(&candidate)).then_some((nonce, candidate))
    })
}

/// Applies collision resolution to an incoming observation against the
/// local node and the stored peer set. Stored losers are rewritten in
/// place (they'll re-announce the same verdict themselves); an incoming
/// loser has its claimed address replaced before the merge.
pub fn resolve_incoming(
    subnet: u8,
    local_pubkey: &str,
    local_ipv4: Ipv4Addr,
    peers: &mut HashMap<String, MeshPeer>,
    incoming: &mut MeshPeer,
) -> Resolution {
    let mut resolution = Resolution::NoCollision;

    // Bounded: each pass either returns or re-derives someone onto a free
    // address, so a second conflict with the same party is impossible.
    for _ in 0..=u8::MAX as usize {
        let taken: HashSet<Ipv4Addr> = peers
            .values()
            .filter(|peer| peer.public_key != incoming.public_key)
            .map(|peer| peer.ipv4)
            .chain(std::iter::once(local_ipv4))
            .collect();

        if incoming.ipv4 == local_ipv4 {
            if wins(&incoming.public_key, local_pubkey) {
                return Resolution::LocalLoses;
            }
            if !rederive(subnet, incoming, &taken) {
                return resolution;
            }
            resolution = Resolution::Resolved;
            continue;
        }

        let conflicting = peers
            .values()
            .find(|peer| {
                peer.public_key != incoming.public_key && peer.ipv4 == incoming.ipv4
            })
            .map(|peer| peer.public_key.clone());

        let Some(existing_key) = conflicting else {
            return resolution;
        };

        if wins(&incoming.public_key, &existing_key) {
            // The stored peer loses; rewrite it to where it will land.
            let mut taken = taken;
            taken.insert(incoming.ipv4);
            if let Some(existing) = peers.get_mut(&existing_key) {
                if rederive(subnet, existing, &taken) {
                    log::debug!(
                        "peer {} lost address collision, now {}",
                        existing_key,
                        existing.ipv4
                    );
                }
            }
            resolution = Resolution::Resolved;
            return resolution;
        } else if !rederive(subnet, incoming, &taken) {
            return resolution;
        }
        resolution = Resolution::Resolved;
    }
    resolution
}

fn rederive(subnet: u8, peer: &mut MeshPeer, taken: &HashSet<Ipv4Addr>) -> bool {
    let start = infer_nonce(subnet, &peer.public_key, peer.ipv4).unwrap_or(0);
    match next_free(subnet, &peer.public_key, start, taken) {
        Some((nonce, ipv4)) => {
            log::debug!(
                "re-derived {} from {} to {} (nonce {})",
                peer.public_key,
                peer.ipv4,
                ipv4,
                nonce
            );
            peer.ipv4 = ipv4;
            true
        },
        None => {
            log::warn!("nonce space exhausted resolving collision for {}", peer.public_key);
            false
        },
    }
}
