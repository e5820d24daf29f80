//! External endpoint discovery and NAT classification via STUN.
//!
//! A minimal RFC 5389 binding-request client: we only ever need the
//! (XOR-)mapped address out of the response. Querying several servers from
//! one socket also classifies the NAT: identical mappings mean cone,
//! destination-dependent ports mean symmetric.

use crate::MeshContext;
use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use shared::NatKind;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, time::timeout};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Last-known external mapping and NAT classification, shared with the
/// announcement builder and the reconciler.
#[derive(Default)]
pub struct StunState {
    external: RwLock<Option<SocketAddr>>,
    nat: RwLock<NatKind>,
}

impl StunState {
    pub fn external(&self) -> Option<SocketAddr> {
        *self.external.read()
    }

    pub fn nat(&self) -> NatKind {
        *self.nat.read()
    }

    fn record(&self, external: Option<SocketAddr>, nat: NatKind) -> bool {
        let changed = {
            let mut slot = self.external.write();
            let changed = *slot != external;
            *slot = external;
            changed
        };
        *self.nat.write() = nat;
        changed
    }
}

fn encode_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut packet = [0u8; 20];
    packet[..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Message length 0: no attributes.
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..].copy_from_slice(transaction_id);
    packet
}

fn decode_mapped_address(packet: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if packet.len() < 20 {
        bail!("STUN response too short");
    }
    let msg_type = u16::from_be_bytes([packet[0], packet[1]]);
    if msg_type != BINDING_RESPONSE {
        bail!("unexpected STUN message type {msg_type:#06x}");
    }
    if packet[8..20] != transaction_id[..] {
        bail!("STUN transaction id mismatch");
    }
    let msg_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let mut attrs = &packet[20..packet.len().min(20 + msg_len)];

    let mut plain = None;
    while attrs.len() >= 4 {
        let attr_type = u16::from_be_bytes([attrs[0], attrs[1]]);
        let attr_len = u16::from_be_bytes([attrs[2], attrs[3]]) as usize;
        if attrs.len() < 4 + attr_len {
            break;
        }
        let value = &attrs[4..4 + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => return parse_address(value, true, transaction_id),
            ATTR_MAPPED_ADDRESS => plain = Some(parse_address(value, false, transaction_id)?),
            _ => {},
        }
        // Attributes are padded to 4-byte boundaries.
        let advance = 4 + attr_len + ((4 - attr_len % 4) % 4);
        attrs = &attrs[advance.min(attrs.len())..];
    }
    plain.context("STUN response carried no mapped address")
}

fn parse_address(value: &[u8], xored: bool, transaction_id: &[u8; 12]) -> Result<SocketAddr> {
    if value.len() < 8 {
        bail!("truncated STUN address attribute");
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xored {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    let ip = match family {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xored {
                let cookie = MAGIC_COOKIE.to_be_bytes();
                for (octet, mask) in octets.iter_mut().zip(cookie) {
                    *octet ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        },
        0x02 => {
            if value.len() < 20 {
                bail!("truncated STUN IPv6 address");
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xored {
                let mut mask = [0u8; 16];
                mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                mask[4..].copy_from_slice(transaction_id);
                for (octet, mask) in octets.iter_mut().zip(mask) {
                    *octet ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        },
        other => bail!("unknown STUN address family {other:#04x}"),
    };
    Ok(SocketAddr::new(ip, port))
}

/// One binding request to one server through the given socket.
async fn query(socket: &UdpSocket, server: &str) -> Result<SocketAddr> {
    let mut transaction_id = [0u8; 12];
    OsRng.fill_bytes(&mut transaction_id);
    let request = encode_binding_request(&transaction_id);

    socket
        .send_to(&request, server)
        .await
        .with_context(|| format!("sending STUN request to {server}"))?;

    let mut buf = [0u8; 512];
    let (len, _) = timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .with_context(|| format!("STUN query to {server} timed out"))??;
    decode_mapped_address(&buf[..len], &transaction_id)
}

/// Queries all servers from one socket and classifies the NAT.
pub async fn probe(servers: &[String]) -> Result<(Option<SocketAddr>, NatKind)> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0u16)).await?;

    let mut mappings = Vec::new();
    for server in servers {
        match query(&socket, server).await {
            Ok(mapped) => mappings.push(mapped),
            Err(e) => log::debug!("{}", e),
        }
    }

    let nat = match mappings.as_slice() {
        [] | [_] => NatKind::Unknown,
        [first, rest @ ..] => {
            if rest.iter().all(|mapped| mapped == first) {
                NatKind::Cone
            } else if rest.iter().any(|mapped| mapped.port() != first.port()) {
                NatKind::Symmetric
            } else {
                NatKind::Unknown
            }
        },
    };
    Ok((mappings.first().copied(), nat))
}

pub fn start(ctx: Arc<MeshContext>, servers: Vec<String>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![super::spawn_layer("stun", refresher(ctx, servers))]
}

async fn refresher(ctx: Arc<MeshContext>, servers: Vec<String>) -> Result<()> {
    loop {
        match probe(&servers).await {
            Ok((mapped, nat)) => {
                // The mapped port belongs to the probe socket; what peers
                // must dial is our WireGuard listen port at that address.
                let external = mapped
                    .map(|addr| SocketAddr::new(addr.ip(), ctx.listen_port));
                let changed = ctx.stun.record(external, nat);
                log::debug!(
                    "STUN refresh: external={:?} nat={}",
                    ctx.stun.external(),
                    nat
                );
                if changed {
                    log::info!("external endpoint changed, re-announcing to all layers");
                    ctx.announce_now.notify_waiters();
                }
            },
            Err(e) => log::debug!("STUN probe failed: {}", e),
        }

        if !super::sleep_or_shutdown(&ctx, REFRESH_INTERVAL).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_response(
        transaction_id: &[u8; 12],
        attr_type: u16,
        value: &[u8],
    ) -> Vec<u8> {
        let padded = value.len() + ((4 - value.len() % 4) % 4);
        let mut packet = Vec::new();
        packet.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&((4 + padded) as u16).to_be_bytes());
        packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet.extend_from_slice(transaction_id);
        packet.extend_from_slice(&attr_type.to_be_bytes());
        packet.extend_from_slice(&(value.len() as u16).to_be_bytes());
        packet.extend_from_slice(value);
        packet.resize(packet.len() + (padded - value.len()), 0);
        packet
    }

    #[test]
    fn parses_xor_mapped_v4() {
        let transaction_id = [3u8; 12];
        let expected: SocketAddr = "203.0.113.7:51820".parse().unwrap();

        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port = 51820u16 ^ (MAGIC_COOKIE >> 16) as u16;
        let ip = match expected.ip() {
            IpAddr::V4(v4) => v4.octets(),
            _ => unreachable!(),
        };
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        for (octet, mask) in ip.iter().zip(cookie) {
            value.push(octet ^ mask);
        }

        let packet = binding_response(&transaction_id, ATTR_XOR_MAPPED_ADDRESS, &value);
        assert_eq!(
            decode_mapped_address(&packet, &transaction_id).unwrap(),
            expected
        );
    }

    #[test]
    fn parses_plain_mapped_v4() {
        let transaction_id = [9u8; 12];
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&4242u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 23]);

        let packet = binding_response(&transaction_id, ATTR_MAPPED_ADDRESS, &value);
        assert_eq!(
            decode_mapped_address(&packet, &transaction_id).unwrap(),
            "198.51.100.23:4242".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn rejects_wrong_transaction_id() {
        let transaction_id = [1u8; 12];
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&4242u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 23]);
        let packet = binding_response(&transaction_id, ATTR_MAPPED_ADDRESS, &value);

        let other_id = [2u8; 12];
        assert!(decode_mapped_address(&packet, &other_id).is_err());
    }

    #[test]
    fn rejects_short_packets() {
        assert!(decode_mapped_address(&[0u8; 8], &[0u8; 12]).is_err());
    }

    #[test]
    fn state_records_changes() {
        let state = StunState::default();
        assert!(state.external().is_none());

        let endpoint: SocketAddr = "203.0.113.7:51820".parse().unwrap();
        assert!(state.record(Some(endpoint), NatKind::Cone));
        assert_eq!(state.external(), Some(endpoint));
        assert_eq!(state.nat(), NatKind::Cone);

        // Same mapping again: not a change.
        assert!(!state.record(Some(endpoint), NatKind::Cone));
    }
}
