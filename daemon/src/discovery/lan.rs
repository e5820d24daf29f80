//! LAN multicast discovery.
//!
//! Nodes on the same L2 find each other without any outside help: every
//! 5 s each node multicasts a signed, enveloped announcement to a group
//! derived from the network id. Receivers pair the announcement with the
//! datagram's source address, which on a LAN is directly dialable.

use crate::MeshContext;
use anyhow::{Context, Result};
use shared::{
    envelope::{self, MsgType},
    Announcement, Source,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio::net::UdpSocket;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 2048;

fn multicast_socket(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating multicast socket")?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(false)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    let (group, port) = ctx.identity.multicast_group();
    log::info!("LAN discovery on {}:{}", group, port);

    let announcer = super::spawn_layer("lan-announcer", announcer(ctx.clone(), group, port));
    let receiver = super::spawn_layer("lan-receiver", receiver(ctx, group, port));
    vec![announcer, receiver]
}

async fn announcer(ctx: Arc<MeshContext>, group: Ipv4Addr, port: u16) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0u16)).await?;
    let destination = SocketAddr::from((group, port));

    loop {
        let announcement = ctx.our_announcement();
        match envelope::seal_message(
            &ctx.identity.envelope_key,
            &ctx.identity.network_id,
            MsgType::Announce,
            &announcement,
        ) {
            Ok(sealed) => {
                if let Err(e) = socket.send_to(&sealed, destination).await {
                    log::debug!("LAN announce failed: {}", e);
                }
            },
            Err(e) => log::debug!("sealing LAN announcement failed: {}", e),
        }

        // An endpoint change (new STUN mapping, collision re-derive)
        // triggers an immediate re-announce between intervals.
        let mut shutdown = ctx.shutdown.subscribe();
        if ctx.shutdown_requested() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {},
            _ = ctx.announce_now.notified() => {},
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

async fn receiver(ctx: Arc<MeshContext>, group: Ipv4Addr, port: u16) -> Result<()> {
    let socket = multicast_socket(group, port)?;
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut shutdown = ctx.shutdown.subscribe();

    // Our own datagrams can still loop back through a second interface on
    // the same segment; dropping them by source address skips the decrypt.
    let local_addrs: std::collections::HashSet<std::net::IpAddr> = shared::local_addrs()
        .map(|addrs| addrs.into_iter().collect())
        .unwrap_or_default();

    loop {
        let (len, src) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    log::debug!("LAN receive error: {}", e);
                    continue;
                },
            },
            _ = shutdown.recv() => return Ok(()),
        };
        if local_addrs.contains(&src.ip()) {
            continue;
        }

        // Envelope AAD covers the network id, so foreign meshes sharing
        // the group (or garbage) die here.
        let announcement: Announcement = match envelope::open_expected(
            &ctx.identity.envelope_key,
            &ctx.identity.network_id,
            MsgType::Announce,
            &buf[..len],
        ) {
            Ok(announcement) => announcement,
            Err(e) => {
                log::debug!("dropping LAN datagram from {}: {}", src, e);
                ctx.store.note_rejected(Source::Lan);
                continue;
            },
        };

        // On the local segment the source address is the best endpoint we
        // will ever learn; pair it with the announced WireGuard port.
        let endpoint = SocketAddr::new(src.ip(), announcement.wg_port).into();
        ctx.accept_announcement(announcement, Some(endpoint), Source::Lan);
    }
}
