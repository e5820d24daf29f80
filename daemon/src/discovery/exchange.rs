//! Encrypted peer exchange over TCP.
//!
//! The exchange port is the externally-reachable rendezvous transport: a
//! connecting node sends `Hello` with its own announcement plus its view
//! of the mesh, and gets a `Reply` in kind. The same socket multiplexes
//! rendezvous forwarding and probes; frames are length-prefixed envelopes
//! and dispatch switches on the envelope's message type.

use crate::MeshContext;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared::{
    envelope::{self, MsgType},
    Announcement, Source,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_IDLE: Duration = Duration::from_secs(30);
const MAX_FRAME: usize = 256 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct PeerSetPayload {
    pub from: Announcement,
    pub peers: Vec<Announcement>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RendezvousRequestPayload {
    /// Public key of the peer the requester wants punched through to.
    pub target: String,
    pub requester: Announcement,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RendezvousResponsePayload {
    pub responder: Announcement,
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        bail!("oversized exchange frame ({len} bytes)");
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(frame)
}

fn peer_set(ctx: &MeshContext) -> PeerSetPayload {
    PeerSetPayload {
        from: ctx.our_announcement(),
        peers: ctx
            .store
            .active()
            .iter()
            .map(|peer| ctx.announcement_for(peer))
            .collect(),
    }
}

fn publish_peer_set(ctx: &Arc<MeshContext>, payload: PeerSetPayload, source: Source, remote: Option<SocketAddr>) {
    let endpoint =
        remote.map(|addr| SocketAddr::new(addr.ip(), payload.from.wg_port).into());
    ctx.accept_announcement(payload.from, endpoint, source);
    for entry in payload.peers {
        ctx.accept_announcement(entry, None, source);
    }
}

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![super::spawn_layer("exchange", server(ctx))]
}

async fn server(ctx: Arc<MeshContext>) -> Result<()> {
    let port = ctx.identity.exchange_port();
    // Dual-stack: the v6 swarm advertises this port to IPv6 peers, and
    // Linux's default v4-mapped handling covers IPv4 dialers on the same
    // socket.
    let listener = TcpListener::bind(("::", port))
        .await
        .with_context(|| format!("binding exchange listener on port {port}"))?;
    log::info!("peer exchange listening on port {}", port);

    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        let (stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::debug!("exchange accept failed: {}", e);
                    continue;
                },
            },
            _ = shutdown.recv() => return Ok(()),
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = timeout(SESSION_IDLE, session(ctx, stream, remote)).await {
                log::debug!("exchange session with {} timed out: {}", remote, e);
            }
        });
    }
}

async fn session(ctx: Arc<MeshContext>, mut stream: TcpStream, remote: SocketAddr) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        let (msg_type, plaintext) = match envelope::open(
            &ctx.identity.envelope_key,
            &ctx.identity.network_id,
            &frame,
        ) {
            Ok(opened) => opened,
            Err(e) => {
                log::debug!("dropping exchange frame from {}: {}", remote, e);
                ctx.store.note_rejected(Source::Exchange);
                return;
            },
        };

        let result = match msg_type {
            MsgType::Hello => handle_hello(&ctx, &mut stream, remote, &plaintext).await,
            MsgType::Announce => handle_announce(&ctx, remote, &plaintext),
            MsgType::Gossip => crate::discovery::gossip::handle_payload(&ctx, &plaintext),
            MsgType::Probe => handle_probe(&ctx, &mut stream, &plaintext).await,
            MsgType::RendezvousRequest => {
                handle_rendezvous_request(&ctx, &mut stream, remote, &plaintext).await
            },
            MsgType::Reply | MsgType::RendezvousResponse => {
                log::debug!("unsolicited {:?} from {}, dropping", msg_type, remote);
                Ok(())
            },
        };
        if let Err(e) = result {
            log::debug!("exchange dispatch error from {}: {}", remote, e);
            return;
        }
    }
}

async fn handle_hello(
    ctx: &Arc<MeshContext>,
    stream: &mut TcpStream,
    remote: SocketAddr,
    plaintext: &[u8],
) -> Result<()> {
    let payload: PeerSetPayload = serde_json::from_slice(plaintext)?;
    publish_peer_set(ctx, payload, Source::Exchange, Some(remote));

    let reply = envelope::seal_message(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Reply,
        &peer_set(ctx),
    )?;
    write_frame(stream, &reply).await?;
    Ok(())
}

fn handle_announce(ctx: &Arc<MeshContext>, remote: SocketAddr, plaintext: &[u8]) -> Result<()> {
    let announcement: Announcement = serde_json::from_slice(plaintext)?;
    let endpoint = SocketAddr::new(remote.ip(), announcement.wg_port).into();
    ctx.accept_announcement(announcement, Some(endpoint), Source::Exchange);
    Ok(())
}

async fn handle_probe(
    ctx: &Arc<MeshContext>,
    stream: &mut TcpStream,
    plaintext: &[u8],
) -> Result<()> {
    // Echo the ping payload back, re-sealed.
    let pong = envelope::seal(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Probe,
        plaintext,
    )?;
    write_frame(stream, &pong).await?;
    Ok(())
}

/// Introducer duty: relay a rendezvous request to the target and pipe the
/// target's response back to the requester.
async fn handle_rendezvous_request(
    ctx: &Arc<MeshContext>,
    stream: &mut TcpStream,
    remote: SocketAddr,
    plaintext: &[u8],
) -> Result<()> {
    let payload: RendezvousRequestPayload = serde_json::from_slice(plaintext)?;

    if payload.target == ctx.identity.keypair.public.to_base64() {
        // We are the target: learn the requester's punched endpoint at top
        // direct-reachability rank and answer so it can do the same.
        ctx.accept_rendezvous(payload.requester);
        let response = envelope::seal_message(
            &ctx.identity.envelope_key,
            &ctx.identity.network_id,
            MsgType::RendezvousResponse,
            &RendezvousResponsePayload {
                responder: ctx.our_announcement(),
            },
        )?;
        write_frame(stream, &response).await?;
        return Ok(());
    }

    let Some(target) = ctx.store.get(&payload.target) else {
        bail!("rendezvous target {} unknown to this introducer", payload.target);
    };
    let Some(endpoint) = target.endpoint.as_ref().and_then(|e| e.resolve().ok()) else {
        bail!("rendezvous target {} has no dialable endpoint", payload.target);
    };
    let target_addr = SocketAddr::new(endpoint.ip(), ctx.identity.exchange_port());

    log::debug!(
        "forwarding rendezvous request from {} to {} at {}",
        remote,
        payload.target,
        target_addr
    );

    let forwarded = envelope::seal_message(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::RendezvousRequest,
        &payload,
    )?;
    let mut target_stream = timeout(DIAL_TIMEOUT, TcpStream::connect(target_addr)).await??;
    write_frame(&mut target_stream, &forwarded).await?;
    let response = timeout(DIAL_TIMEOUT, read_frame(&mut target_stream)).await??;

    // Relay the (still sealed) response back verbatim.
    write_frame(stream, &response).await?;
    Ok(())
}

/// Dials a candidate, exchanges peer sets, and publishes the results under
/// the given source tag (`exchange` for seeded peers, `dht` for candidates
/// handed to us by the rendezvous service).
pub async fn exchange_with(ctx: &Arc<MeshContext>, addr: SocketAddr, source: Source) -> Result<()> {
    let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .with_context(|| format!("dialing exchange peer {addr}"))??;

    let hello = envelope::seal_message(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Hello,
        &peer_set(ctx),
    )?;
    write_frame(&mut stream, &hello).await?;

    let frame = timeout(DIAL_TIMEOUT, read_frame(&mut stream)).await??;
    let payload: PeerSetPayload = envelope::open_expected(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Reply,
        &frame,
    )?;
    publish_peer_set(ctx, payload, source, Some(addr));
    Ok(())
}

/// Asks the introducer to relay a rendezvous request; returns the target's
/// announcement on success.
pub async fn request_rendezvous(
    ctx: &Arc<MeshContext>,
    introducer_addr: SocketAddr,
    target: String,
) -> Result<Announcement> {
    let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(introducer_addr))
        .await
        .with_context(|| format!("dialing introducer {introducer_addr}"))??;

    let request = envelope::seal_message(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::RendezvousRequest,
        &RendezvousRequestPayload {
            target,
            requester: ctx.our_announcement(),
        },
    )?;
    write_frame(&mut stream, &request).await?;

    let frame = timeout(DIAL_TIMEOUT, read_frame(&mut stream)).await??;
    let response: RendezvousResponsePayload = envelope::open_expected(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::RendezvousResponse,
        &frame,
    )?;
    Ok(response.responder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        write_frame(&mut client, b"hello frame").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame, b"hello frame");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client
            .write_all(&(u32::MAX).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn empty_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"").await.unwrap();
        assert!(read_frame(&mut server).await.unwrap().is_empty());
    }
}
