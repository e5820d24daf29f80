//! In-mesh gossip.
//!
//! Once any transport has produced a working tunnel, gossip keeps the
//! mesh's knowledge converging: every 10 s each node sends its active peer
//! set to a few random peers over the mesh itself. During a stem epoch the
//! fanout is funneled through the current stem relays instead.

use crate::MeshContext;
use anyhow::{Context, Result};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use shared::{
    envelope::{self, MsgType},
    Announcement, Source,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::UdpSocket;

pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(10);

/// How many peers a non-stem round targets.
const FANOUT: usize = 3;

const MAX_DATAGRAM: usize = 60 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct GossipPayload {
    pub from: Announcement,
    pub peers: Vec<Announcement>,
}

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![super::spawn_layer("gossip", run(ctx))]
}

async fn run(ctx: Arc<MeshContext>) -> Result<()> {
    // Bound wild rather than to the mesh address: gossip traffic is
    // envelope-authenticated anyway, and a collision re-derivation can
    // replace the mesh address underneath a bound socket.
    let bind_addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, ctx.identity.gossip_udp_port()));
    let socket = Arc::new(
        UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("binding gossip socket on {bind_addr}"))?,
    );
    log::info!("gossip listening on {}", bind_addr);

    let receiver = tokio::spawn(receive_loop(ctx.clone(), socket.clone()));

    loop {
        if !super::sleep_or_shutdown(&ctx, GOSSIP_INTERVAL).await {
            receiver.abort();
            return Ok(());
        }
        if let Err(e) = send_round(&ctx, &socket).await {
            log::debug!("gossip round failed: {}", e);
        }
    }
}

async fn send_round(ctx: &Arc<MeshContext>, socket: &UdpSocket) -> Result<()> {
    let active = ctx.store.active();
    if active.is_empty() {
        return Ok(());
    }

    let payload = GossipPayload {
        from: ctx.our_announcement(),
        peers: active.iter().map(|peer| ctx.announcement_for(peer)).collect(),
    };
    let sealed = envelope::seal_message(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Gossip,
        &payload,
    )?;
    if sealed.len() > MAX_DATAGRAM {
        log::debug!("gossip payload too large ({} bytes), skipping round", sealed.len());
        return Ok(());
    }

    let targets: Vec<_> = {
        let mut rng = rand::thread_rng();
        let stems = ctx.current_stems();
        let stem_round = !stems.is_empty() && rng.gen_bool(ctx.epoch.stem_probability());
        if stem_round {
            // Stem phase: hand the whole round to the epoch's relays.
            active
                .iter()
                .filter(|peer| stems.contains(&peer.public_key))
                .map(|peer| peer.ipv4)
                .collect()
        } else {
            active
                .choose_multiple(&mut rng, FANOUT)
                .map(|peer| peer.ipv4)
                .collect()
        }
    };

    let port = ctx.identity.gossip_udp_port();
    for ipv4 in targets {
        if let Err(e) = socket.send_to(&sealed, (ipv4, port)).await {
            log::debug!("gossip send to {} failed: {}", ipv4, e);
        }
    }
    Ok(())
}

async fn receive_loop(ctx: Arc<MeshContext>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!("gossip receive error: {}", e);
                continue;
            },
        };
        let plaintext = match envelope::open(
            &ctx.identity.envelope_key,
            &ctx.identity.network_id,
            &buf[..len],
        ) {
            Ok((MsgType::Gossip, plaintext)) => plaintext,
            Ok((other, _)) => {
                log::debug!("unexpected {:?} on gossip socket from {}", other, src);
                continue;
            },
            Err(e) => {
                log::debug!("dropping gossip datagram from {}: {}", src, e);
                ctx.store.note_rejected(Source::Gossip);
                continue;
            },
        };
        if let Err(e) = handle_payload(&ctx, &plaintext) {
            log::debug!("bad gossip payload from {}: {}", src, e);
            ctx.store.note_rejected(Source::Gossip);
        }
    }
}

/// Publishes one decrypted gossip payload: the originator is a first-hand
/// observation, everything else it reports is transitive.
pub(crate) fn handle_payload(ctx: &Arc<MeshContext>, plaintext: &[u8]) -> Result<()> {
    let payload: GossipPayload = serde_json::from_slice(plaintext)?;
    let originator = payload.from.public_key.clone();
    ctx.accept_announcement(payload.from, None, Source::Gossip);
    for entry in payload.peers {
        let source = if entry.public_key == originator {
            Source::Gossip
        } else {
            Source::GossipTransitive
        };
        ctx.accept_announcement(entry, None, source);
    }
    Ok(())
}
