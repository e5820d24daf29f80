use crate::{PEER_ACTIVE_WINDOW, PEER_RETENTION_WINDOW};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    ops::Deref,
    path::Path,
    str::FromStr,
    time::SystemTime,
};
use url::Host;
use wireguard_control::{AllowedIp, Key};

#[derive(Clone, Debug, PartialEq, Eq)]
/// An external endpoint that supports both IP and domain name hosts.
pub struct Endpoint {
    host: Host,
    port: u16,
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4addr) => Self {
                host: Host::Ipv4(*v4addr.ip()),
                port: v4addr.port(),
            },
            SocketAddr::V6(v6addr) => Self {
                host: Host::Ipv6(*v6addr.ip()),
                port: v6addr.port(),
            },
        }
    }
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplitn(2, ':').collect::<Vec<&str>>().as_slice() {
            [port, host] => {
                let port = port.parse().map_err(|_| "couldn't parse port")?;
                let host = Host::parse(host).map_err(|_| "couldn't parse host")?;
                Ok(Endpoint { host, port })
            },
            _ => Err("couldn't parse in form of 'host:port'"),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EndpointVisitor;
        impl serde::de::Visitor<'_> for EndpointVisitor {
            type Value = Endpoint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a valid host:port endpoint")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                s.parse().map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(EndpointVisitor)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.host.fmt(f)?;
        f.write_str(":")?;
        self.port.fmt(f)
    }
}

impl Endpoint {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.host, Host::Ipv6(_))
    }

    pub fn resolve(&self) -> Result<SocketAddr, io::Error> {
        let mut addrs = self.to_string().to_socket_addrs()?;
        addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "failed to resolve address".to_string(),
            )
        })
    }
}

/// Which discovery layer produced an observation. Declared in ascending
/// rank order: a higher source displaces a lower one's endpoint, IPv6 wins
/// ties, and among equals the newer observation wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Cache,
    Registry,
    GossipTransitive,
    Gossip,
    Dht,
    Exchange,
    DhtRendezvous,
    Lan,
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Cache => "cache",
            Source::Registry => "registry",
            Source::GossipTransitive => "gossip-transitive",
            Source::Gossip => "gossip",
            Source::Dht => "dht",
            Source::Exchange => "exchange",
            Source::DhtRendezvous => "dht-rendezvous",
            Source::Lan => "lan",
        };
        f.write_str(s)
    }
}

/// NAT classification from STUN probing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    #[default]
    Unknown,
    Cone,
    Symmetric,
}

impl Display for NatKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NatKind::Unknown => f.write_str("unknown"),
            NatKind::Cone => f.write_str("cone"),
            NatKind::Symmetric => f.write_str("symmetric"),
        }
    }
}

/// One remote node as the peer store knows it. Everything here is
/// peer-supplied (and envelope-authenticated) except the bookkeeping
/// fields, which are local observations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshPeer {
    pub public_key: String,
    pub ipv4: std::net::Ipv4Addr,
    pub ipv6: std::net::Ipv6Addr,
    pub endpoint: Option<Endpoint>,
    pub endpoint_source: Option<Source>,
    #[serde(default)]
    pub routes: Vec<IpNet>,
    #[serde(default)]
    pub nat: NatKind,
    #[serde(default)]
    pub introducer: bool,
    pub sources: BTreeSet<Source>,
    pub last_update: SystemTime,

    // Liveness bookkeeping is runtime-only and never persisted.
    #[serde(skip)]
    pub stale_once: bool,
    #[serde(skip)]
    pub stale_twice: bool,
    #[serde(skip)]
    pub offline_until: Option<SystemTime>,
}

impl MeshPeer {
    pub fn key(&self) -> Result<Key, wireguard_control::InvalidKey> {
        Key::from_base64(&self.public_key)
    }

    pub fn is_active(&self, now: SystemTime) -> bool {
        now.duration_since(self.last_update)
            .map(|age| age < PEER_ACTIVE_WINDOW)
            .unwrap_or(true)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.last_update)
            .map(|age| age >= PEER_RETENTION_WINDOW)
            .unwrap_or(false)
    }

    pub fn is_temporarily_offline(&self, now: SystemTime) -> bool {
        self.offline_until.map(|until| now < until).unwrap_or(false)
    }

    /// The endpoint-rank partial order from the store contract: a
    /// higher-ranked source always displaces, IPv6 displaces IPv4 at equal
    /// rank, and an equal-rank same-family observation wins by recency.
    pub fn should_replace_endpoint(&self, candidate: &Endpoint, source: Source) -> bool {
        match (&self.endpoint, self.endpoint_source) {
            (None, _) | (_, None) => true,
            (Some(existing), Some(existing_source)) => {
                if source != existing_source {
                    source > existing_source
                } else if candidate.is_ipv6() != existing.is_ipv6() {
                    candidate.is_ipv6()
                } else {
                    true
                }
            },
        }
    }
}

impl Display for MeshPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ipv4, &self.public_key)
    }
}

/// What the reconciler wants one kernel peer to look like. Computed fresh
/// each tick from the store snapshot plus relay decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPeer {
    pub public_key: Key,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<AllowedIp>,
    pub keepalive: Option<u16>,
    pub preshared_key: Option<Key>,
}

/// A single kernel route. Routes with a gateway were installed by the
/// reconciler and may be removed by it; gateway-less routes are
/// directly-connected and must never be touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub cidr: IpNet,
    pub gateway: Option<IpAddr>,
}

impl RouteEntry {
    pub fn is_managed(&self) -> bool {
        self.gateway.is_some()
    }
}

/// The authenticated announcement body every discovery layer trades in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Announcement {
    pub public_key: String,
    pub ipv4: std::net::Ipv4Addr,
    pub ipv6: std::net::Ipv6Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    /// The WireGuard listen port, so LAN observers can pair it with the
    /// datagram's source address.
    pub wg_port: u16,
    #[serde(default)]
    pub nat: NatKind,
    #[serde(default)]
    pub routes: Vec<IpNet>,
    #[serde(default)]
    pub introducer: bool,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Announcement {
    /// Canonical byte serialization covered by the membership MAC. Field
    /// order is fixed; the signature itself is excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(self.public_key.as_bytes());
        bytes.extend_from_slice(&self.ipv4.octets());
        bytes.extend_from_slice(&self.ipv6.octets());
        if let Some(endpoint) = &self.endpoint {
            bytes.extend_from_slice(endpoint.to_string().as_bytes());
        }
        bytes.extend_from_slice(&self.wg_port.to_be_bytes());
        bytes.push(match self.nat {
            NatKind::Unknown => 0,
            NatKind::Cone => 1,
            NatKind::Symmetric => 2,
        });
        for route in &self.routes {
            bytes.extend_from_slice(route.to_string().as_bytes());
        }
        bytes.push(self.introducer as u8);
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes
    }

    pub fn into_peer(self, source: Source, now: SystemTime) -> MeshPeer {
        MeshPeer {
            public_key: self.public_key,
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            endpoint: self.endpoint,
            endpoint_source: None,
            routes: self.routes,
            nat: self.nat,
            introducer: self.introducer,
            sources: BTreeSet::from([source]),
            last_update: now,
            stale_once: false,
            stale_twice: false,
            offline_until: None,
        }
    }
}

pub trait IoErrorContext<T> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError>;
    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError>;
}

impl<T> IoErrorContext<T> for Result<T, std::io::Error> {
    fn with_path<P: AsRef<Path>>(self, path: P) -> Result<T, WrappedIoError> {
        self.with_str(path.as_ref().to_string_lossy())
    }

    fn with_str<S: Into<String>>(self, context: S) -> Result<T, WrappedIoError> {
        self.map_err(|e| WrappedIoError {
            io_error: e,
            context: context.into(),
        })
    }
}

#[derive(Debug)]
pub struct WrappedIoError {
    io_error: std::io::Error,
    context: String,
}

impl Display for WrappedIoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{} - {}", self.context, self.io_error)
    }
}

impl Deref for WrappedIoError {
    type Target = std::io::Error;

    fn deref(&self) -> &Self::Target {
        &self.io_error
    }
}

impl std::error::Error for WrappedIoError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_peer(endpoint: Option<(&str, Source)>) -> MeshPeer {
        MeshPeer {
            public_key: "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=".into(),
            ipv4: "10.42.0.1".parse().unwrap(),
            ipv6: "fd00::1".parse().unwrap(),
            endpoint: endpoint.map(|(e, _)| e.parse().unwrap()),
            endpoint_source: endpoint.map(|(_, s)| s),
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
    fn source_rank_ordering() {
        assert!(Source::Lan > Source::DhtRendezvous);
        assert!(Source::DhtRendezvous > Source::Exchange);
        assert!(Source::Exchange > Source::Dht);
        assert!(Source::Dht > Source::Gossip);
        assert!(Source::Gossip > Source::GossipTransitive);
        assert!(Source::Gossip > Source::Registry);
        assert!(Source::Registry > Source::Cache);
    }

    #[test]
    fn endpoint_parsing() {
        let endpoint: Endpoint = "1.2.3.4:51820".parse().unwrap();
        assert_eq!(endpoint.port(), 51820);
        assert!(!endpoint.is_ipv6());

        let endpoint: Endpoint = "[fd00::1]:51820".parse().unwrap();
        assert!(endpoint.is_ipv6());

        assert!("nonsense".parse::<Endpoint>().is_err());
    }

    #[test]
    fn endpoint_serde_as_string() {
        let endpoint: Endpoint = "1.2.3.4:51820".parse().unwrap();
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, "\"1.2.3.4:51820\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, endpoint);
    }

    #[test]
    fn higher_rank_displaces() {
        let peer = test_peer(Some(("1.1.1.1:1000", Source::Gossip)));
        let candidate: Endpoint = "2.2.2.2:2000".parse().unwrap();
        assert!(peer.should_replace_endpoint(&candidate, Source::Lan));
    }

    #[test]
    fn lower_rank_never_displaces() {
        let peer = test_peer(Some(("1.1.1.1:1000", Source::Lan)));
        let candidate: Endpoint = "2.2.2.2:2000".parse().unwrap();
        assert!(!peer.should_replace_endpoint(&candidate, Source::Gossip));
        assert!(!peer.should_replace_endpoint(&candidate, Source::Cache));
    }

    #[test]
    fn ipv6_beats_ipv4_at_equal_rank() {
        let peer = test_peer(Some(("[fd00::2]:1000", Source::Dht)));
        let v4: Endpoint = "2.2.2.2:2000".parse().unwrap();
        assert!(!peer.should_replace_endpoint(&v4, Source::Dht));

        let peer = test_peer(Some(("1.1.1.1:1000", Source::Dht)));
        let v6: Endpoint = "[fd00::2]:1000".parse().unwrap();
        assert!(peer.should_replace_endpoint(&v6, Source::Dht));
    }

    #[test]
    fn newer_wins_at_equal_rank_and_family() {
        let peer = test_peer(Some(("1.1.1.1:1000", Source::Dht)));
        let candidate: Endpoint = "2.2.2.2:2000".parse().unwrap();
        assert!(peer.should_replace_endpoint(&candidate, Source::Dht));
    }

    #[test]
    fn activity_windows() {
        let now = SystemTime::now();
        let mut peer = test_peer(None);
        assert!(peer.is_active(now));
        assert!(!peer.is_expired(now));

        peer.last_update = now - Duration::from_secs(6 * 60);
        assert!(!peer.is_active(now));
        assert!(!peer.is_expired(now));

        peer.last_update = now - Duration::from_secs(11 * 60);
        assert!(peer.is_expired(now));
    }

    #[test]
    fn canonical_bytes_exclude_signature() {
        let mut announcement = Announcement {
            public_key: "key".into(),
            ipv4: "10.1.2.3".parse().unwrap(),
            ipv6: "fd00::3".parse().unwrap(),
            endpoint: Some("9.9.9.9:999".parse().unwrap()),
            wg_port: 51820,
            nat: NatKind::Cone,
            routes: vec!["192.168.5.0/24".parse().unwrap()],
            introducer: true,
            timestamp: 1234,
            sig: None,
        };
        let unsigned = announcement.canonical_bytes();
        announcement.sig = Some("deadbeef".into());
        assert_eq!(unsigned, announcement.canonical_bytes());
    }
}
