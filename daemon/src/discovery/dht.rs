//! BitTorrent-swarm rendezvous.
//!
//! The mainline DHT is used strictly as a black box: we announce our
//! exchange port under the network-id infohash and collect other
//! announcers' addresses. Mainline speaks IPv4 only, so a parallel IPv6
//! path announces the same infohash to v6-capable open trackers and
//! harvests their compact `peers6` lists. A raw swarm address proves
//! nothing either way, so every candidate is then dialed over the
//! encrypted exchange transport and only nodes that authenticate land in
//! the store (source `dht`).

use crate::{discovery::exchange, MeshContext};
use anyhow::{bail, Context, Result};
use mainline::{Dht, Id};
use sha2::{Digest, Sha256};
use shared::Source;
use std::{
    collections::HashMap,
    io::Read,
    net::{Ipv6Addr, SocketAddr, SocketAddrV6},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::time::timeout;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(15 * 60);
pub const QUERY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Hard deadline for one DHT or tracker operation.
pub const QUERY_DEADLINE: Duration = Duration::from_secs(5);

/// How long before an unresponsive candidate may be dialed again.
const CANDIDATE_COOLDOWN: Duration = Duration::from_secs(10 * 60);

/// At most this many fresh candidates are dialed per query round.
const DIALS_PER_ROUND: usize = 16;

const MAX_TRACKER_RESPONSE: u64 = 64 * 1024;

pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Open trackers with working AAAA records, for the IPv6 swarm.
pub const DEFAULT_V6_TRACKERS: &[&str] = &[
    "http://tracker.opentrackr.org:1337/announce",
    "http://open.acgnxtracker.com:80/announce",
];

fn build(bootstrap: &[String]) -> Result<Dht> {
    let dht = if bootstrap.is_empty() {
        Dht::client()?
    } else {
        Dht::builder().bootstrap(bootstrap).build()?
    };
    Ok(dht)
}

fn info_hash(network_id: &[u8; 20]) -> Result<Id> {
    Id::from_bytes(network_id).context("network id is not a valid DHT infohash")
}

pub fn start(ctx: Arc<MeshContext>, bootstrap: Vec<String>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        super::spawn_layer("dht", run(ctx.clone(), bootstrap)),
        super::spawn_layer("dht-v6", v6_swarm_loop(ctx)),
    ]
}

async fn run(ctx: Arc<MeshContext>, bootstrap: Vec<String>) -> Result<()> {
    let info_hash = info_hash(&ctx.identity.network_id)?;
    let dht = match tokio::task::spawn_blocking({
        let bootstrap = bootstrap.clone();
        move || build(&bootstrap)
    })
    .await?
    {
        Ok(dht) => Arc::new(dht),
        Err(e) => {
            // The registry fallback (if configured) takes over from here.
            ctx.note_dht_bootstrap_failed();
            return Err(e).context("DHT bootstrap failed");
        },
    };
    ctx.remember_dht_nodes(&bootstrap);

    let announcer = tokio::spawn(announce_loop(ctx.clone(), dht.clone(), info_hash));
    let result = query_loop(ctx.clone(), dht, info_hash).await;
    announcer.abort();
    result
}

async fn announce_loop(ctx: Arc<MeshContext>, dht: Arc<Dht>, info_hash: Id) {
    let port = ctx.identity.exchange_port();
    loop {
        let announced = timeout(QUERY_DEADLINE, {
            let dht = dht.clone();
            tokio::task::spawn_blocking(move || dht.announce_peer(info_hash, Some(port)))
        })
        .await;
        match announced {
            Ok(Ok(Ok(_))) => log::debug!("announced to DHT on port {}", port),
            Ok(Ok(Err(e))) => {
                log::debug!("DHT announce failed: {}", e);
                ctx.note_dht_bootstrap_failed();
            },
            Ok(Err(e)) => log::debug!("DHT announce task failed: {}", e),
            Err(_) => log::debug!("DHT announce exceeded {:?} deadline", QUERY_DEADLINE),
        }

        let mut shutdown = ctx.shutdown.subscribe();
        if ctx.shutdown_requested() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {},
            _ = ctx.announce_now.notified() => {},
            _ = shutdown.recv() => return,
        }
    }
}

/// Dials candidates that aren't our own reflection and aren't cooling
/// down, at most `DIALS_PER_ROUND` per call. Shared by both swarm paths.
fn dial_candidates(
    ctx: &Arc<MeshContext>,
    candidates: Vec<SocketAddr>,
    recently_dialed: &mut HashMap<SocketAddr, Instant>,
) {
    let external = ctx.stun.external();
    recently_dialed.retain(|_, dialed| dialed.elapsed() < CANDIDATE_COOLDOWN);

    let mut dialed = 0;
    for addr in candidates {
        if dialed >= DIALS_PER_ROUND {
            break;
        }
        if external.map(|ours| ours.ip() == addr.ip()).unwrap_or(false)
            || recently_dialed.contains_key(&addr)
        {
            continue;
        }
        recently_dialed.insert(addr, Instant::now());
        dialed += 1;
        ctx.remember_dht_nodes(&[addr.to_string()]);

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = exchange::exchange_with(&ctx, addr, Source::Dht).await {
                log::debug!("swarm candidate {} did not authenticate: {}", addr, e);
            }
        });
    }
    if dialed > 0 {
        log::debug!("dialing {} swarm candidates", dialed);
    }
}

async fn query_loop(ctx: Arc<MeshContext>, dht: Arc<Dht>, info_hash: Id) -> Result<()> {
    let mut recently_dialed: HashMap<SocketAddr, Instant> = HashMap::new();

    loop {
        let found = timeout(QUERY_DEADLINE, {
            let dht = dht.clone();
            tokio::task::spawn_blocking(move || -> Vec<SocketAddr> {
                let mut found = Vec::new();
                let response = match dht.get_peers(info_hash) {
                    Ok(response) => response,
                    Err(_) => return found,
                };
                for item in response {
                    found.extend(item);
                }
                found
            })
        })
        .await;
        match found {
            Ok(Ok(candidates)) => dial_candidates(&ctx, candidates, &mut recently_dialed),
            Ok(Err(e)) => log::debug!("DHT query task failed: {}", e),
            Err(_) => log::debug!("DHT query exceeded {:?} deadline", QUERY_DEADLINE),
        }

        if !super::sleep_or_shutdown(&ctx, QUERY_INTERVAL).await {
            return Ok(());
        }
    }
}

/// The IPv6 half of the rendezvous: one tracker GET both announces our
/// exchange port and returns the current v6 swarm.
async fn v6_swarm_loop(ctx: Arc<MeshContext>) -> Result<()> {
    let info_hash = ctx.identity.network_id;
    let peer_id = swarm_peer_id(&ctx);
    let port = ctx.identity.exchange_port();
    let mut recently_dialed: HashMap<SocketAddr, Instant> = HashMap::new();

    loop {
        for tracker in DEFAULT_V6_TRACKERS {
            let announced = timeout(
                QUERY_DEADLINE,
                tokio::task::spawn_blocking(move || {
                    tracker_announce(tracker, &info_hash, &peer_id, port)
                }),
            )
            .await;
            match announced {
                Ok(Ok(Ok(candidates))) => {
                    dial_candidates(&ctx, candidates, &mut recently_dialed)
                },
                Ok(Ok(Err(e))) => log::debug!("tracker {} announce failed: {}", tracker, e),
                Ok(Err(e)) => log::debug!("tracker announce task failed: {}", e),
                Err(_) => {
                    log::debug!("tracker {} exceeded {:?} deadline", tracker, QUERY_DEADLINE)
                },
            }
        }

        if !super::sleep_or_shutdown(&ctx, QUERY_INTERVAL).await {
            return Ok(());
        }
    }
}

/// A stable 20-byte swarm peer id derived from our public key, so trackers
/// see one consistent member per node.
fn swarm_peer_id(ctx: &MeshContext) -> [u8; 20] {
    let digest = Sha256::digest(ctx.identity.keypair.public.as_bytes());
    let mut id = [0u8; 20];
    id.copy_from_slice(&digest[..20]);
    id
}

fn percent_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("%{byte:02X}")).collect()
}

/// Announces to one HTTP tracker and returns its compact IPv6 peer list.
fn tracker_announce(
    tracker: &str,
    info_hash: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
) -> Result<Vec<SocketAddr>> {
    let url = format!(
        "{tracker}?info_hash={}&peer_id={}&port={port}\
         &uploaded=0&downloaded=0&left=0&compact=1",
        percent_encode(info_hash),
        percent_encode(peer_id),
    );
    let response = ureq::AgentBuilder::new()
        .timeout(QUERY_DEADLINE)
        .build()
        .get(&url)
        .call()
        .with_context(|| format!("announcing to tracker {tracker}"))?;

    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_TRACKER_RESPONSE)
        .read_to_end(&mut body)?;

    if let Some(reason) = bencode_bytes(&body, b"failure reason") {
        bail!("tracker refused: {}", String::from_utf8_lossy(reason));
    }
    let peers6 = bencode_bytes(&body, b"peers6").unwrap_or_default();
    Ok(decode_compact_v6(peers6))
}

/// BEP-7 compact form: 16 address bytes plus a big-endian port, repeated.
fn decode_compact_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect()
}

/// Pulls one byte-string value out of a bencoded top-level dictionary.
/// This is the whole bencode surface we need from a tracker response.
fn bencode_bytes<'a>(body: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    if body.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    while pos < body.len() && body[pos] != b'e' {
        let (name, value_start) = bencode_string(body, pos)?;
        if name == key {
            let (value, _) = bencode_string(body, value_start)?;
            return Some(value);
        }
        pos = bencode_skip(body, value_start)?;
    }
    None
}

fn bencode_string(body: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let colon = body[pos..].iter().position(|b| *b == b':')? + pos;
    let len: usize = std::str::from_utf8(&body[pos..colon]).ok()?.parse().ok()?;
    let start = colon + 1;
    let end = start.checked_add(len)?;
    (end <= body.len()).then(|| (&body[start..end], end))
}

fn bencode_skip(body: &[u8], pos: usize) -> Option<usize> {
    match body.get(pos)? {
        b'i' => Some(body[pos..].iter().position(|b| *b == b'e')? + pos + 1),
        b'l' | b'd' => {
            let mut inner = pos + 1;
            while *body.get(inner)? != b'e' {
                inner = bencode_skip(body, inner)?;
            }
            Some(inner + 1)
        },
        b'0'..=b'9' => bencode_string(body, pos).map(|(_, end)| end),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encoding_is_uppercase_hex() {
        assert_eq!(percent_encode(&[0x00, 0xff, 0x41]), "%00%FF%41");
    }

    #[test]
    fn compact_v6_decoding() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets());
        bytes.extend_from_slice(&51820u16.to_be_bytes());
        bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        bytes.extend_from_slice(&80u16.to_be_bytes());

        let peers = decode_compact_v6(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "[2001:db8::1]:51820".parse().unwrap());
        assert_eq!(peers[1], "[::1]:80".parse().unwrap());

        // A trailing partial chunk is ignored, not misparsed.
        bytes.push(0);
        assert_eq!(decode_compact_v6(&bytes).len(), 2);
    }

    #[test]
    fn bencode_value_extraction() {
        let body = b"d8:intervali1800e5:peers6:\x01\x02\x03\x04\x05\x066:peers618:\
            \x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x01\xca\x6ce";
        let peers6 = bencode_bytes(body, b"peers6").unwrap();
        assert_eq!(peers6.len(), 18);
        let decoded = decode_compact_v6(peers6);
        assert_eq!(decoded[0], "[::1]:51820".parse().unwrap());

        assert_eq!(bencode_bytes(body, b"peers").unwrap().len(), 6);
        assert!(bencode_bytes(body, b"missing").is_none());
    }

    #[test]
    fn bencode_skips_nested_values() {
        // The wanted key sits after an integer, a list, and a dict.
        let body = b"d1:ai7e1:bl4:spam4:eggse1:cd1:xi1ee6:wanted3:yese";
        assert_eq!(bencode_bytes(body, b"wanted"), Some(&b"yes"[..]));
    }

    #[test]
    fn bencode_rejects_garbage() {
        assert!(bencode_bytes(b"", b"k").is_none());
        assert!(bencode_bytes(b"le", b"k").is_none());
        assert!(bencode_bytes(b"d3:keyi5", b"other").is_none());
        assert!(bencode_bytes(b"d999999999999:x", b"x").is_none());
    }

    #[test]
    fn failure_reason_is_surfaced() {
        let body = b"d14:failure reason12:unregisterede";
        assert_eq!(
            bencode_bytes(body, b"failure reason"),
            Some(&b"unregistered"[..])
        );
    }
}
