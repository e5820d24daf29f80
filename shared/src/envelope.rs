//! The authenticated envelope wrapping every inter-node message.
//!
//! Layout: version byte, type byte, 12-byte random nonce, then the
//! AES-256-GCM ciphertext with its tag appended. The version, type, and
//! network id are bound in as AAD, so a message can neither be replayed
//! into a different mesh nor re-labeled as a different type.

use crate::types::Announcement;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, bail, Error};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

pub const ENVELOPE_VERSION: u8 = 0x01;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 2 + NONCE_LEN;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    Reply = 0x02,
    Announce = 0x03,
    RendezvousRequest = 0x04,
    RendezvousResponse = 0x05,
    Gossip = 0x06,
    Probe = 0x07,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Error> {
        Ok(match byte {
            0x01 => MsgType::Hello,
            0x02 => MsgType::Reply,
            0x03 => MsgType::Announce,
            0x04 => MsgType::RendezvousRequest,
            0x05 => MsgType::RendezvousResponse,
            0x06 => MsgType::Gossip,
            0x07 => MsgType::Probe,
            other => bail!("unknown envelope message type {other:#04x}"),
        })
    }
}

fn aad(msg_type: MsgType, network_id: &[u8; 20]) -> [u8; 22] {
    let mut aad = [0u8; 22];
    aad[0] = ENVELOPE_VERSION;
    aad[1] = msg_type as u8;
    aad[2..].copy_from_slice(network_id);
    aad
}

pub fn seal(
    envelope_key: &[u8; 32],
    network_id: &[u8; 20],
    msg_type: MsgType,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let cipher = Aes256Gcm::new_from_slice(envelope_key)
        .map_err(|_| anyhow!("envelope key must be 32 bytes"))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad(msg_type, network_id),
            },
        )
        .map_err(|_| anyhow!("envelope encryption failed"))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.push(msg_type as u8);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(
    envelope_key: &[u8; 32],
    network_id: &[u8; 20],
    bytes: &[u8],
) -> Result<(MsgType, Vec<u8>), Error> {
    if bytes.len() < HEADER_LEN + TAG_LEN {
        bail!("envelope too short ({} bytes)", bytes.len());
    }
    if bytes[0] != ENVELOPE_VERSION {
        bail!("unsupported envelope version {:#04x}", bytes[0]);
    }
    let msg_type = MsgType::try_from(bytes[1])?;
    let nonce = &bytes[2..HEADER_LEN];
    let ciphertext = &bytes[HEADER_LEN..];

    let cipher = Aes256Gcm::new_from_slice(envelope_key)
        .map_err(|_| anyhow!("envelope key must be 32 bytes"))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad(msg_type, network_id),
            },
        )
        .map_err(|_| anyhow!("envelope authentication failed"))?;

    Ok((msg_type, plaintext))
}

/// Seals a JSON-encodable payload.
pub fn seal_message<T: Serialize>(
    envelope_key: &[u8; 32],
    network_id: &[u8; 20],
    msg_type: MsgType,
    payload: &T,
) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(payload)?;
    seal(envelope_key, network_id, msg_type, &json)
}

/// Opens an envelope and decodes its JSON payload, requiring the expected
/// message type.
pub fn open_expected<T: DeserializeOwned>(
    envelope_key: &[u8; 32],
    network_id: &[u8; 20],
    expected: MsgType,
    bytes: &[u8],
) -> Result<T, Error> {
    let (msg_type, plaintext) = open(envelope_key, network_id, bytes)?;
    if msg_type != expected {
        bail!("expected {expected:?} envelope, got {msg_type:?}");
    }
    Ok(serde_json::from_slice(&plaintext)?)
}

fn membership_mac(membership_key: &[u8; 32], body: &[u8]) -> HmacSha256 {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(membership_key)
        .expect("HMAC accepts any key length");
    mac.update(body);
    mac
}

/// Authenticates an announcement with the derived membership key. X25519
/// keys can't sign, so membership of the mesh (knowledge of the secret)
/// stands in for a per-node signature; the public key inside the body pins
/// the announcement to its author.
pub fn sign_announcement(membership_key: &[u8; 32], announcement: &mut Announcement) {
    let mac = membership_mac(membership_key, &announcement.canonical_bytes());
    announcement.sig = Some(BASE64.encode(mac.finalize().into_bytes()));
}

pub fn verify_announcement(membership_key: &[u8; 32], announcement: &Announcement) -> bool {
    let Some(sig) = &announcement.sig else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(sig) else {
        return false;
    };
    membership_mac(membership_key, &announcement.canonical_bytes())
        .verify_slice(&sig_bytes)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NatKind;

    const KEY: [u8; 32] = [7u8; 32];
    const NETWORK_ID: [u8; 20] = [9u8; 20];

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal(&KEY, &NETWORK_ID, MsgType::Gossip, b"hello mesh").unwrap();
        assert_eq!(sealed[0], ENVELOPE_VERSION);
        assert_eq!(sealed[1], MsgType::Gossip as u8);

        let (msg_type, plaintext) = open(&KEY, &NETWORK_ID, &sealed).unwrap();
        assert_eq!(msg_type, MsgType::Gossip);
        assert_eq!(plaintext, b"hello mesh");
    }

    #[test]
    fn wrong_network_id_rejected() {
        let sealed = seal(&KEY, &NETWORK_ID, MsgType::Hello, b"payload").unwrap();
        let other_network = [1u8; 20];
        assert!(open(&KEY, &other_network, &sealed).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let sealed = seal(&KEY, &NETWORK_ID, MsgType::Hello, b"payload").unwrap();
        let other_key = [8u8; 32];
        assert!(open(&other_key, &NETWORK_ID, &sealed).is_err());
    }

    #[test]
    fn type_confusion_rejected() {
        // Flipping the type byte breaks the AAD binding even though the
        // new byte is itself a valid message type.
        let mut sealed = seal(&KEY, &NETWORK_ID, MsgType::Hello, b"payload").unwrap();
        sealed[1] = MsgType::Reply as u8;
        assert!(open(&KEY, &NETWORK_ID, &sealed).is_err());
    }

    #[test]
    fn truncated_and_foreign_versions_rejected() {
        assert!(open(&KEY, &NETWORK_ID, &[]).is_err());
        assert!(open(&KEY, &NETWORK_ID, &[0x01, 0x02, 0x03]).is_err());

        let mut sealed = seal(&KEY, &NETWORK_ID, MsgType::Probe, b"x").unwrap();
        sealed[0] = 0x02;
        assert!(open(&KEY, &NETWORK_ID, &sealed).is_err());
    }

    #[test]
    fn json_payload_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            seq: u64,
        }

        let sealed = seal_message(&KEY, &NETWORK_ID, MsgType::Probe, &Ping { seq: 42 }).unwrap();
        let ping: Ping = open_expected(&KEY, &NETWORK_ID, MsgType::Probe, &sealed).unwrap();
        assert_eq!(ping, Ping { seq: 42 });

        let err: Result<Ping, _> = open_expected(&KEY, &NETWORK_ID, MsgType::Hello, &sealed);
        assert!(err.is_err());
    }

    fn test_announcement() -> Announcement {
        Announcement {
            public_key: "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=".into(),
            ipv4: "10.42.1.2".parse().unwrap(),
            ipv6: "fd00::2".parse().unwrap(),
            endpoint: Some("203.0.113.5:51820".parse().unwrap()),
            wg_port: 51820,
            nat: NatKind::Cone,
            routes: vec![],
            introducer: false,
            timestamp: 1_700_000_000,
            sig: None,
        }
    }

    #[test]
    fn announcement_sign_and_verify() {
        let mut announcement = test_announcement();
        sign_announcement(&KEY, &mut announcement);
        assert!(verify_announcement(&KEY, &announcement));

        let other_key = [3u8; 32];
        assert!(!verify_announcement(&other_key, &announcement));
    }

    #[test]
    fn tampered_announcement_rejected() {
        let mut announcement = test_announcement();
        sign_announcement(&KEY, &mut announcement);
        announcement.introducer = true;
        assert!(!verify_announcement(&KEY, &announcement));
    }

    #[test]
    fn unsigned_announcement_rejected() {
        let announcement = test_announcement();
        assert!(!verify_announcement(&KEY, &announcement));
    }
}
