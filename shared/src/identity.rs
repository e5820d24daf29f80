//! Deterministic mesh identity derivation.
//!
//! Every node in a mesh derives the same network-level parameters (network
//! id, gossip port, envelope key) and its own node-level parameters
//! (WireGuard keypair, mesh addresses) from the one shared secret. No
//! coordination server ever hands out addresses.

use crate::{atomic_write, IoErrorContext, WrappedIoError};
use anyhow::{anyhow, bail, Error};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::Read,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
};
use wireguard_control::{InterfaceName, Key, KeyPair};

pub const SECRET_URI_PREFIX: &str = "wgmesh://v1/";
pub const MIN_SECRET_LEN: usize = 16;

const HKDF_SALT: &[u8] = b"wgmesh/v1";

/// Process-wide immutable identity, byte-identical across nodes for all
/// network-level fields given the same secret.
#[derive(Clone)]
pub struct MeshIdentity {
    pub keypair: KeyPair,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub network_id: [u8; 20],
    pub gossip_port: u16,
    pub envelope_key: [u8; 32],
    pub membership_key: [u8; 32],
    pub rendezvous_id: [u8; 32],
    pub subnet: u8,
    pub ipv6_prefix: [u8; 8],
    pub nonce: u8,
}

impl std::fmt::Debug for MeshIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let secret-derived key material hit logs via {:?}.
        f.debug_struct("MeshIdentity")
            .field("public_key", &self.keypair.public.to_base64())
            .field("ipv4", &self.ipv4)
            .field("ipv6", &self.ipv6)
            .field("network_id", &hex::encode(self.network_id))
            .field("gossip_port", &self.gossip_port)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

/// Accepts either a raw secret or the `wgmesh://v1/<opaque>` URI form.
/// Any other scheme or version is rejected rather than guessed at.
pub fn parse_secret(input: &str) -> Result<&str, Error> {
    let secret = if let Some(rest) = input.strip_prefix(SECRET_URI_PREFIX) {
        rest
    } else if input.contains("://") {
        bail!("unrecognized secret URI (expected {}<secret>)", SECRET_URI_PREFIX);
    } else {
        input
    };

    if secret.len() < MIN_SECRET_LEN {
        bail!("mesh secret must be at least {} bytes", MIN_SECRET_LEN);
    }
    Ok(secret)
}

fn expand(hk: &Hkdf<Sha256>, info: &[u8], okm: &mut [u8]) -> Result<(), Error> {
    hk.expand(info, okm)
        .map_err(|_| anyhow!("HKDF expand failed for label {:?}", String::from_utf8_lossy(info)))
}

/// Derives the full identity at nonce 0.
pub fn derive(secret: &str) -> Result<MeshIdentity, Error> {
    let secret = parse_secret(secret)?;
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.as_bytes());

    let mut wg_key = [0u8; 32];
    expand(&hk, b"wg-key", &mut wg_key)?;
    // Clamp per the Curve25519 spec so the scalar is a valid private key.
    wg_key[0] &= 248;
    wg_key[31] &= 127;
    wg_key[31] |= 64;
    let keypair = KeyPair::from_private(Key(wg_key));

    let mut subnet = [0u8; 1];
    expand(&hk, b"subnet", &mut subnet)?;
    let subnet = subnet[0];

    let mut ipv6_prefix = [0u8; 8];
    expand(&hk, b"ipv6-prefix", &mut ipv6_prefix)?;
    // Pin the prefix into fd00::/8 so mesh traffic stays within ULA space.
    ipv6_prefix[0] = 0xfd;

    let mut network_id = [0u8; 20];
    expand(&hk, b"network-id", &mut network_id)?;

    let mut port_bytes = [0u8; 2];
    expand(&hk, b"gossip-port", &mut port_bytes)?;
    let gossip_port = 1024 + u16::from_be_bytes(port_bytes) % (65535 - 1024);

    let mut envelope_key = [0u8; 32];
    expand(&hk, b"envelope-key", &mut envelope_key)?;

    let mut membership_key = [0u8; 32];
    expand(&hk, b"membership-key", &mut membership_key)?;

    let mut rendezvous_id = [0u8; 32];
    expand(&hk, b"rendezvous-id", &mut rendezvous_id)?;

    let nonce = 0;
    let ipv4 = mesh_ipv4(subnet, keypair.public.as_bytes(), nonce);
    let ipv6 = mesh_ipv6(&ipv6_prefix, keypair.public.as_bytes());

    Ok(MeshIdentity {
        keypair,
        ipv4,
        ipv6,
        network_id,
        gossip_port,
        envelope_key,
        membership_key,
        rendezvous_id,
        subnet,
        ipv6_prefix,
        nonce,
    })
}

/// Mesh IPv4 for a given public key inside `10.<subnet>.0.0/16`.
///
/// Nonce 0 hashes the bare public key; collision losers re-derive with the
/// nonce byte appended, incrementing until the address is free. The network
/// and broadcast host parts are clamped to their nearest neighbors so the
/// result is always a usable host address.
pub fn mesh_ipv4(subnet: u8, public_key: &[u8], nonce: u8) -> Ipv4Addr {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    if nonce > 0 {
        hasher.update([nonce]);
    }
    let digest = hasher.finalize();

    let mut host = u16::from_be_bytes([digest[30], digest[31]]);
    if host == 0 {
        host = 1;
    } else if host == 0xffff {
        host = 0xfffe;
    }
    let [x, y] = host.to_be_bytes();
    Ipv4Addr::new(10, subnet, x, y)
}

/// Mesh IPv6: the derived /64 prefix with the low 64 bits of the public-key
/// hash as the interface identifier.
pub fn mesh_ipv6(prefix: &[u8; 8], public_key: &[u8]) -> Ipv6Addr {
    let digest = Sha256::digest(public_key);
    let mut octets = [0u8; 16];
    octets[..8].copy_from_slice(prefix);
    octets[8..].copy_from_slice(&digest[24..32]);
    Ipv6Addr::from(octets)
}

impl MeshIdentity {
    /// Recomputes the mesh IPv4 at a new collision nonce. All other fields
    /// are nonce-independent.
    pub fn with_nonce(mut self, nonce: u8) -> Self {
        self.nonce = nonce;
        self.ipv4 = mesh_ipv4(self.subnet, self.keypair.public.as_bytes(), nonce);
        self
    }

    /// The LAN multicast rendezvous group and port for this mesh, derived
    /// from the network id so unrelated meshes on one L2 don't hear each
    /// other.
    pub fn multicast_group(&self) -> (Ipv4Addr, u16) {
        let group = Ipv4Addr::new(239, 192, self.network_id[0], self.network_id[1]);
        let port = 1024 + u16::from_be_bytes([self.network_id[2], self.network_id[3]]) % (65535 - 1024);
        (group, port)
    }

    /// Exchange (TCP) listens on the derived gossip port; gossip datagrams
    /// and mesh probes ride `gossip_port + 1000`.
    pub fn exchange_port(&self) -> u16 {
        self.gossip_port
    }

    pub fn gossip_udp_port(&self) -> u16 {
        self.gossip_port.wrapping_add(1000)
    }
}

/// The node-local portion of identity that must survive restarts: the
/// collision nonce and any listen-port fallback are chosen at runtime and
/// can't be re-derived from the secret alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub pubkey: String,
    pub privkey: String,
    pub mesh_ipv4: Ipv4Addr,
    pub mesh_ipv6: Ipv6Addr,
    pub nonce: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl StoredIdentity {
    pub fn path(data_dir: &Path, interface: &InterfaceName) -> PathBuf {
        data_dir.join(format!("{interface}-identity"))
    }

    pub fn from_identity(identity: &MeshIdentity, listen_port: Option<u16>) -> Self {
        Self {
            pubkey: identity.keypair.public.to_base64(),
            privkey: identity.keypair.private.to_base64(),
            mesh_ipv4: identity.ipv4,
            mesh_ipv6: identity.ipv6,
            nonce: identity.nonce,
            listen_port,
        }
    }

    pub fn open(path: &Path) -> Result<Option<Self>, WrappedIoError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_path(path),
        };
        crate::audit_private_mode(path)?;
        let mut json = String::new();
        file.read_to_string(&mut json).with_path(path)?;
        Ok(serde_json::from_str(&json).ok())
    }

    pub fn write(&self, path: &Path) -> Result<(), WrappedIoError> {
        let json = serde_json::to_string_pretty(self).expect("identity serialization is infallible");
        atomic_write(path, json.as_bytes(), 0o600)
    }

    /// Checks that a stored identity still matches the secret it was
    /// derived from, catching secret changes under an existing state dir.
    pub fn matches(&self, identity: &MeshIdentity) -> bool {
        BASE64
            .decode(&self.pubkey)
            .map(|bytes| bytes.as_slice() == identity.keypair.public.as_bytes())
            .unwrap_or(false)
    }
}
