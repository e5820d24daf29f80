//! The wgmesh daemon core.
//!
//! `run` wires everything together: derive the identity from the secret,
//! own the kernel interface, start the discovery layers, and keep the
//! reconciler and health loops turning until a shutdown signal arrives.

pub mod collision;
pub mod discovery;
pub mod epoch;
pub mod health;
pub mod reconciler;
pub mod routes;
pub mod store;

use anyhow::{bail, Context as _, Result};
use discovery::stun::StunState;
use epoch::EpochManager;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::Serialize;
use shared::{
    envelope,
    identity::{self, MeshIdentity, StoredIdentity},
    wg, Announcement, Endpoint, MeshPeer, NatKind, Source,
};
use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io::Write as _,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use store::PeerStore;
use tokio::sync::{broadcast, Notify};
use wireguard_control::{Backend, InterfaceName};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Announcements older (or more futuristic) than this are replays or badly
/// skewed clocks; either way they don't update the store.
const ANNOUNCEMENT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STEM_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const MAX_REMEMBERED_DHT_NODES: usize = 200;

#[derive(Debug, Clone)]
pub struct DaemonOpts {
    pub secret: String,
    pub interface: InterfaceName,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub mtu: Option<u32>,
    pub listen_port: Option<u16>,
    pub introducer: bool,
    pub advertise_routes: Vec<IpNet>,
    pub stun_servers: Vec<String>,
    pub dht_bootstrap: Vec<String>,
    pub registry_url: Option<String>,
    pub registry_token: Option<String>,
    pub stem_probability: f64,
}

/// Everything the long-running tasks share. The peer store handles its own
/// synchronization; the rest is immutable after startup except where noted.
pub struct MeshContext {
    pub interface: InterfaceName,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub identity: MeshIdentity,
    pub listen_port: u16,
    pub store: PeerStore,
    pub stun: StunState,
    pub epoch: EpochManager,
    pub announce_now: Notify,
    pub shutdown: broadcast::Sender<()>,
    started_wall: SystemTime,
    started: Instant,
    nonce: AtomicU8,
    introducer: AtomicBool,
    advertised_routes: RwLock<Vec<IpNet>>,
    current_stems: RwLock<Vec<String>>,
    shutting_down: AtomicBool,
    dht_bootstrap_failed: AtomicBool,
    dht_nodes: RwLock<BTreeSet<String>>,
    local_collision: Notify,
}

impl MeshContext {
    fn new(opts: &DaemonOpts, identity: MeshIdentity, listen_port: u16) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let store = PeerStore::new(
            identity.keypair.public.to_base64(),
            identity.subnet,
            identity.ipv4,
        );
        let epoch = EpochManager::new(identity.rendezvous_id, opts.stem_probability);
        let nonce = identity.nonce;
        Self {
            interface: opts.interface,
            backend: opts.backend,
            data_dir: opts.data_dir.clone(),
            identity,
            listen_port,
            store,
            stun: StunState::default(),
            epoch,
            announce_now: Notify::new(),
            shutdown,
            started_wall: SystemTime::now(),
            started: Instant::now(),
            nonce: AtomicU8::new(nonce),
            introducer: AtomicBool::new(opts.introducer),
            advertised_routes: RwLock::new(opts.advertise_routes.clone()),
            current_stems: RwLock::new(vec![]),
            shutting_down: AtomicBool::new(false),
            dht_bootstrap_failed: AtomicBool::new(false),
            dht_nodes: RwLock::new(BTreeSet::new()),
            local_collision: Notify::new(),
        }
    }

    /// Whether this node offers itself as an introducer: either configured
    /// by the operator, or detected (cone NAT with a public mapping).
    pub fn is_introducer(&self) -> bool {
        if self.introducer.load(Ordering::Relaxed) {
            return true;
        }
        self.stun.nat() == NatKind::Cone
            && self
                .stun
                .external()
                .map(|addr| match addr.ip() {
                    std::net::IpAddr::V4(v4) => {
                        !v4.is_private() && !v4.is_loopback() && !v4.is_link_local()
                    },
                    std::net::IpAddr::V6(_) => true,
                })
                .unwrap_or(false)
    }

    /// Our own signed announcement, as every layer broadcasts it.
    pub fn our_announcement(&self) -> Announcement {
        let mut announcement = Announcement {
            public_key: self.identity.keypair.public.to_base64(),
            ipv4: self.store.local_ipv4(),
            ipv6: self.identity.ipv6,
            endpoint: self.stun.external().map(Endpoint::from),
            wg_port: self.listen_port,
            nat: self.stun.nat(),
            routes: self.advertised_routes.read().clone(),
            introducer: self.is_introducer(),
            timestamp: unix_now(),
            sig: None,
        };
        envelope::sign_announcement(&self.identity.membership_key, &mut announcement);
        announcement
    }

    /// Re-announces a stored peer on its behalf (gossip and exchange relay
    /// whole peer sets; the membership MAC is a shared key, so any member
    /// can vouch for a record it holds).
    pub fn announcement_for(&self, peer: &MeshPeer) -> Announcement {
        let mut announcement = Announcement {
            public_key: peer.public_key.clone(),
            ipv4: peer.ipv4,
            ipv6: peer.ipv6,
            endpoint: peer.endpoint.clone(),
            wg_port: peer
                .endpoint
                .as_ref()
                .map(|e| e.port())
                .unwrap_or(self.listen_port),
            nat: peer.nat,
            routes: peer.routes.clone(),
            introducer: peer.introducer,
            timestamp: unix_now(),
            sig: None,
        };
        envelope::sign_announcement(&self.identity.membership_key, &mut announcement);
        announcement
    }

    /// The single funnel every discovery layer publishes through:
    /// authenticate, freshness-check, convert, merge. Collisions that cost
    /// us our own address wake the re-derivation task.
    pub fn accept_announcement(
        &self,
        announcement: Announcement,
        endpoint_override: Option<Endpoint>,
        source: Source,
    ) {
        if !envelope::verify_announcement(&self.identity.membership_key, &announcement) {
            log::debug!("rejecting unauthenticated announcement via {}", source);
            self.store.note_rejected(source);
            return;
        }
        let age = unix_now().abs_diff(announcement.timestamp);
        if age > ANNOUNCEMENT_MAX_AGE.as_secs() {
            log::debug!("rejecting stale announcement via {} ({}s old)", source, age);
            self.store.note_rejected(source);
            return;
        }

        let mut peer = announcement.into_peer(source, SystemTime::now());
        if let Some(endpoint) = endpoint_override {
            peer.endpoint = Some(endpoint);
        }

        match self.store.update(peer, source) {
            store::UpdateOutcome::LocalCollision => {
                log::warn!("mesh address collision lost; re-deriving local address");
                self.local_collision.notify_one();
            },
            store::UpdateOutcome::RejectedAtCap => {
                log::debug!("peer store at capacity, rejecting new peer via {}", source);
            },
            store::UpdateOutcome::Accepted | store::UpdateOutcome::SelfObservation => {},
        }
    }

    /// A rendezvous success: the endpoint in this announcement has just
    /// been punched through, so it enters at the top direct rank.
    pub fn accept_rendezvous(&self, announcement: Announcement) {
        let endpoint = announcement.endpoint.clone();
        self.accept_announcement(announcement, endpoint, Source::DhtRendezvous);
    }

    pub fn current_stems(&self) -> Vec<String> {
        self.current_stems.read().clone()
    }

    /// Level-triggered shutdown check. The broadcast channel only reaches
    /// receivers subscribed before the send, so loops that re-subscribe
    /// per iteration consult this flag after subscribing.
    pub fn shutdown_requested(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let _ = self.shutdown.send(());
    }

    pub fn note_dht_bootstrap_failed(&self) {
        self.dht_bootstrap_failed.store(true, Ordering::Relaxed);
    }

    pub fn dht_bootstrap_failed(&self) -> bool {
        self.dht_bootstrap_failed.load(Ordering::Relaxed)
    }

    /// Remembers DHT contact points for the `<iface>-dht-nodes` snapshot.
    pub fn remember_dht_nodes(&self, nodes: &[String]) {
        let mut known = self.dht_nodes.write();
        for node in nodes {
            if known.len() >= MAX_REMEMBERED_DHT_NODES {
                break;
            }
            known.insert(node.clone());
        }
    }

    pub fn status(&self) -> DaemonStatus {
        let (active, total, dead) = self.store.counts();
        DaemonStatus {
            interface: self.interface.to_string(),
            public_key: self.identity.keypair.public.to_base64(),
            mesh_ipv4: self.store.local_ipv4(),
            mesh_ipv6: self.identity.ipv6,
            network_id: hex::encode(self.identity.network_id),
            listen_port: self.listen_port,
            gossip_port: self.identity.gossip_port,
            uptime_secs: self.started.elapsed().as_secs(),
            started_at: self.started_wall,
            nat: self.stun.nat(),
            external_endpoint: self.stun.external().map(|addr| addr.to_string()),
            introducer: self.is_introducer(),
            peers_active: active,
            peers_total: total,
            peers_dead: dead,
            rejected_at_cap: self.store.rejected_at_cap(),
            rejected_by_source: self.store.rejected_counts(),
        }
    }

    pub fn active_peers(&self) -> Vec<MeshPeer> {
        self.store.active()
    }

    pub fn peer(&self, public_key: &str) -> Option<MeshPeer> {
        self.store.get(public_key)
    }
}

/// The read-only daemon status snapshot the query surface serves.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub interface: String,
    pub public_key: String,
    pub mesh_ipv4: std::net::Ipv4Addr,
    pub mesh_ipv6: std::net::Ipv6Addr,
    pub network_id: String,
    pub listen_port: u16,
    pub gossip_port: u16,
    pub uptime_secs: u64,
    pub started_at: SystemTime,
    pub nat: NatKind,
    pub external_endpoint: Option<String>,
    pub introducer: bool,
    pub peers_active: usize,
    pub peers_total: usize,
    pub peers_dead: usize,
    pub rejected_at_cap: u64,
    pub rejected_by_source: std::collections::BTreeMap<Source, u64>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn lock_path(data_dir: &Path, interface: &InterfaceName) -> PathBuf {
    data_dir.join(format!("{interface}.lock"))
}

pub fn reload_path(data_dir: &Path, interface: &InterfaceName) -> PathBuf {
    data_dir.join(format!("{interface}.reload"))
}

fn dht_nodes_path(data_dir: &Path, interface: &InterfaceName) -> PathBuf {
    data_dir.join(format!("{interface}-dht-nodes"))
}

/// Refuses to run two daemons against one interface: the kernel device is
/// a global resource with exactly one legitimate owner.
fn acquire_lock(data_dir: &Path, interface: &InterfaceName) -> Result<File> {
    let path = lock_path(data_dir, interface);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("opening lock file {}", path.display()))?;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        bail!(
            "another wgmesh daemon already owns interface {} (lock {})",
            interface,
            path.display()
        );
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

/// Changes accepted on reload. Identity and mesh addressing are not
/// reloadable; only these knobs are.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadSettings {
    pub advertise_routes: Option<Vec<IpNet>>,
    pub log_level: Option<log::LevelFilter>,
}

pub fn parse_reload(contents: &str) -> ReloadSettings {
    let mut settings = ReloadSettings::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            log::warn!("ignoring malformed reload line: {line}");
            continue;
        };
        match key.trim() {
            "advertise-routes" => {
                let routes: Vec<IpNet> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| match s.parse() {
                        Ok(net) => Some(net),
                        Err(_) => {
                            log::warn!("ignoring unparseable route {s:?} in reload file");
                            None
                        },
                    })
                    .collect();
                settings.advertise_routes = Some(routes);
            },
            "log-level" => match value.trim() {
                "debug" => settings.log_level = Some(log::LevelFilter::Debug),
                "info" => settings.log_level = Some(log::LevelFilter::Info),
                "warn" => settings.log_level = Some(log::LevelFilter::Warn),
                "error" => settings.log_level = Some(log::LevelFilter::Error),
                other => log::warn!("ignoring unknown log level {other:?} in reload file"),
            },
            other => log::warn!("ignoring unknown reload key {other:?}"),
        }
    }
    settings
}

fn apply_reload(ctx: &Arc<MeshContext>) {
    let path = reload_path(&ctx.data_dir, &ctx.interface);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("reload requested but {} unreadable: {}", path.display(), e);
            return;
        },
    };
    let settings = parse_reload(&contents);
    if let Some(routes) = settings.advertise_routes {
        log::info!("reload: advertising {} route(s)", routes.len());
        *ctx.advertised_routes.write() = routes;
        ctx.announce_now.notify_waiters();
    }
    if let Some(level) = settings.log_level {
        log::info!("reload: log level -> {}", level);
        log::set_max_level(level);
    }
}

/// Re-derives the local mesh address after losing a collision, swaps the
/// interface address atomically, and re-announces everywhere.
fn handle_local_collision(ctx: &Arc<MeshContext>) -> Result<()> {
    let taken: std::collections::HashSet<_> =
        ctx.store.all().iter().map(|peer| peer.ipv4).collect();
    let current_nonce = ctx.nonce.load(Ordering::Relaxed);
    let public_key = ctx.identity.keypair.public.to_base64();

    let Some((nonce, ipv4)) =
        collision::next_free(ctx.identity.subnet, &public_key, current_nonce, &taken)
    else {
        bail!("no free mesh address found while resolving collision");
    };

    let old = ctx.store.local_ipv4();
    log::warn!("replacing mesh address {} with {} (nonce {})", old, ipv4, nonce);

    wg::set_addr(&ctx.interface, IpNet::new(ipv4.into(), 16)?)?;
    wg::del_addr(&ctx.interface, IpNet::new(old.into(), 16)?)?;

    ctx.store.set_local_ipv4(ipv4);
    ctx.nonce.store(nonce, Ordering::Relaxed);

    StoredIdentity {
        nonce,
        mesh_ipv4: ipv4,
        ..StoredIdentity::from_identity(&ctx.identity, Some(ctx.listen_port))
    }
    .write(&StoredIdentity::path(&ctx.data_dir, &ctx.interface))?;

    ctx.announce_now.notify_waiters();
    Ok(())
}

async fn collision_task(ctx: Arc<MeshContext>) -> Result<()> {
    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = ctx.local_collision.notified() => {
                if let Err(e) = handle_local_collision(&ctx) {
                    log::error!("collision re-derivation failed: {}", e);
                }
            },
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

async fn sweeper_task(ctx: Arc<MeshContext>) -> Result<()> {
    loop {
        if !discovery::sleep_or_shutdown(&ctx, SWEEP_INTERVAL).await {
            return Ok(());
        }
        let evicted = ctx.store.cleanup_stale();
        if evicted > 0 {
            log::debug!("swept {} expired peer(s)", evicted);
        }
    }
}

async fn stem_task(ctx: Arc<MeshContext>) -> Result<()> {
    let mut last_epoch = None;
    loop {
        let epoch = ctx.epoch.current_epoch(SystemTime::now());
        let keys: Vec<String> = ctx
            .store
            .active()
            .into_iter()
            .map(|peer| peer.public_key)
            .collect();
        let stems = ctx.epoch.stems(epoch, &keys);
        if last_epoch != Some(epoch) {
            log::debug!("epoch {} stems: {:?}", epoch, stems);
            last_epoch = Some(epoch);
        }
        *ctx.current_stems.write() = stems;

        if !discovery::sleep_or_shutdown(&ctx, STEM_REFRESH_INTERVAL).await {
            return Ok(());
        }
    }
}

fn load_dht_bootstrap(opts: &DaemonOpts) -> Vec<String> {
    if !opts.dht_bootstrap.is_empty() {
        return opts.dht_bootstrap.clone();
    }
    let path = dht_nodes_path(&opts.data_dir, &opts.interface);
    if let Ok(json) = std::fs::read_to_string(&path) {
        if let Ok(nodes) = serde_json::from_str::<Vec<String>>(&json) {
            if !nodes.is_empty() {
                log::info!("restored {} DHT nodes from {}", nodes.len(), path.display());
                return nodes;
            }
        }
    }
    discovery::dht::DEFAULT_BOOTSTRAP
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn persist_state(ctx: &Arc<MeshContext>) {
    let cache_path = discovery::cache::path(&ctx.data_dir, &ctx.interface);
    match discovery::cache::persist(&ctx.store, &cache_path) {
        Ok(count) => log::info!("persisted {} peer(s) to cache", count),
        Err(e) => log::warn!("final cache persist failed: {}", e),
    }

    let nodes: Vec<String> = ctx.dht_nodes.read().iter().cloned().collect();
    if !nodes.is_empty() {
        let path = dht_nodes_path(&ctx.data_dir, &ctx.interface);
        match serde_json::to_string_pretty(&nodes) {
            Ok(json) => {
                if let Err(e) = shared::atomic_write(&path, json.as_bytes(), 0o644) {
                    log::warn!("DHT node persist failed: {}", e);
                }
            },
            Err(e) => log::warn!("DHT node serialization failed: {}", e),
        }
    }
}

/// Brings the mesh up and runs until SIGINT/SIGTERM. SIGHUP reloads
/// `<iface>.reload`.
pub async fn run(opts: DaemonOpts) -> Result<()> {
    shared::prepare_state_dir(&opts.data_dir)?;
    let _lock = acquire_lock(&opts.data_dir, &opts.interface)?;

    let mut identity = identity::derive(&opts.secret)?;

    // A previous run's collision nonce and fallback port take precedence
    // over fresh derivation so restarts keep their addresses.
    let identity_path = StoredIdentity::path(&opts.data_dir, &opts.interface);
    let stored = StoredIdentity::open(&identity_path)?;
    let mut preferred_port = opts.listen_port;
    if let Some(stored) = stored.filter(|stored| stored.matches(&identity)) {
        if stored.nonce > 0 {
            identity = identity.with_nonce(stored.nonce);
        }
        preferred_port = preferred_port.or(stored.listen_port);
    }

    log::info!(
        "bringing up {} as {} ({})",
        opts.interface,
        identity.ipv4,
        identity.keypair.public.to_base64()
    );

    let listen_port = wg::up(
        &opts.interface,
        &identity.keypair.private,
        IpNet::new(identity.ipv4.into(), 16)?,
        IpNet::new(identity.ipv6.into(), 64)?,
        preferred_port.unwrap_or(51820),
        opts.mtu,
        opts.backend,
    )?;

    StoredIdentity::from_identity(&identity, Some(listen_port)).write(&identity_path)?;

    let ctx = Arc::new(MeshContext::new(&opts, identity, listen_port));

    let cache_path = discovery::cache::path(&ctx.data_dir, &ctx.interface);
    match discovery::cache::restore(&ctx.store, &cache_path) {
        Ok(0) => {},
        Ok(count) => log::info!("restored {} cached peer(s)", count),
        Err(e) => log::warn!("peer cache restore failed: {}", e),
    }

    let mut tasks = Vec::new();
    tasks.extend(reconciler::start(ctx.clone()));
    tasks.extend(health::start(ctx.clone()));
    tasks.extend(discovery::lan::start(ctx.clone()));
    tasks.extend(discovery::stun::start(ctx.clone(), opts.stun_servers.clone()));
    tasks.extend(discovery::dht::start(ctx.clone(), load_dht_bootstrap(&opts)));
    tasks.extend(discovery::gossip::start(ctx.clone()));
    tasks.extend(discovery::exchange::start(ctx.clone()));
    tasks.extend(discovery::rendezvous::start(ctx.clone()));
    tasks.extend(discovery::cache::start(ctx.clone()));
    if let Some(url) = opts.registry_url.clone() {
        tasks.extend(discovery::registry::start(
            ctx.clone(),
            discovery::registry::RegistryConfig {
                url,
                token: opts.registry_token.clone(),
            },
        ));
    }
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            let _ = sweeper_task(ctx).await;
        }
    }));
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            let _ = stem_task(ctx).await;
        }
    }));
    tasks.push(tokio::spawn({
        let ctx = ctx.clone();
        async move {
            let _ = collision_task(ctx).await;
        }
    }));

    log::info!(
        "mesh daemon up: {} peers cached, gossip port {}, exchange port {}",
        ctx.store.len(),
        ctx.identity.gossip_udp_port(),
        ctx.identity.exchange_port()
    );

    wait_for_signals(&ctx).await?;

    log::info!("shutting down");
    ctx.begin_shutdown();

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    for task in tasks {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, task).await.is_err() {
            log::debug!("a task exceeded the shutdown grace window, detaching it");
        }
    }

    persist_state(&ctx);

    if let Err(e) = wg::down(&ctx.interface, ctx.backend) {
        log::warn!("interface teardown failed: {}", e);
    }
    log::info!("interface {} torn down", ctx.interface);
    Ok(())
}

async fn wait_for_signals(ctx: &Arc<MeshContext>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => return Ok(()),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => {
                log::info!("SIGHUP: reloading {}", reload_path(&ctx.data_dir, &ctx.interface).display());
                apply_reload(ctx);
            },
        }
    }
}

/// Tears down a mesh interface from outside the daemon (the `down`
/// subcommand). The running daemon, if any, must be stopped first.
pub fn down(interface: &InterfaceName, backend: Backend, data_dir: &Path) -> Result<()> {
    wg::down(interface, backend)?;
    let _ = std::fs::remove_file(lock_path(data_dir, interface));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_parses_routes_and_level() {
        let settings = parse_reload(
            "# comment\n\
             advertise-routes=192.168.5.0/24, 10.99.0.0/16\n\
             log-level=debug\n",
        );
        assert_eq!(
            settings.advertise_routes,
            Some(vec![
                "192.168.5.0/24".parse().unwrap(),
                "10.99.0.0/16".parse().unwrap()
            ])
        );
        assert_eq!(settings.log_level, Some(log::LevelFilter::Debug));
    }

    #[test]
    fn reload_tolerates_junk() {
        let settings = parse_reload(
            "bogus line without equals\n\
             unknown-key=whatever\n\
             log-level=shouting\n\
             advertise-routes=not-a-cidr\n",
        );
        assert_eq!(settings.advertise_routes, Some(vec![]));
        assert_eq!(settings.log_level, None);
    }

    #[test]
    fn reload_empty_file_changes_nothing() {
        assert_eq!(parse_reload(""), ReloadSettings::default());
    }

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let interface: InterfaceName = "wgtest0".parse().unwrap();

        let first = acquire_lock(dir.path(), &interface).unwrap();
        assert!(acquire_lock(dir.path(), &interface).is_err());
        drop(first);
        assert!(acquire_lock(dir.path(), &interface).is_ok());
    }
}
