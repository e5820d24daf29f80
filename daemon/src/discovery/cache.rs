//! Peer cache persistence.
//!
//! The store is snapshotted to disk every few minutes and on shutdown, so
//! a restarted daemon can rejoin the mesh from its last-known peers
//! instead of waiting out a full rediscovery cycle. Restored entries come
//! back at the bottom of the endpoint-rank order.

use crate::{store::PeerStore, MeshContext};
use anyhow::{Context, Result};
use shared::{atomic_write, MeshPeer, Source};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use wireguard_control::InterfaceName;

pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Entries older than this at startup are not worth re-trying.
pub const RESTORE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub fn path(data_dir: &Path, interface: &InterfaceName) -> PathBuf {
    data_dir.join(format!("{interface}-peers"))
}

/// Serializes the full store. Liveness flags are runtime-only and never
/// written (see `MeshPeer`'s serde attributes).
pub fn persist(store: &PeerStore, path: &Path) -> Result<usize> {
    let peers = store.all();
    let json = serde_json::to_string_pretty(&peers)?;
    atomic_write(path, json.as_bytes(), 0o644)
        .with_context(|| format!("writing peer cache {}", path.display()))?;
    Ok(peers.len())
}

/// Re-inserts cached entries younger than the restore window with source
/// `cache`. Returns how many were restored.
pub fn restore(store: &PeerStore, path: &Path) -> Result<usize> {
    let json = match std::fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("reading peer cache {}", path.display())),
    };
    let peers: Vec<MeshPeer> = serde_json::from_str(&json).unwrap_or_default();

    let now = SystemTime::now();
    let mut restored = 0;
    for mut peer in peers {
        let age = now
            .duration_since(peer.last_update)
            .unwrap_or(Duration::ZERO);
        if age > RESTORE_WINDOW {
            continue;
        }
        // The cached lineage is stale; everything restored re-enters the
        // store as a cache observation and has to re-earn its rank.
        peer.sources.clear();
        peer.endpoint_source = None;
        store.update(peer, Source::Cache);
        restored += 1;
    }
    Ok(restored)
}

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![super::spawn_layer("cache", run(ctx))]
}

async fn run(ctx: Arc<MeshContext>) -> Result<()> {
    let path = path(&ctx.data_dir, &ctx.interface);
    loop {
        if !super::sleep_or_shutdown(&ctx, PERSIST_INTERVAL).await {
            // The daemon writes the final snapshot during shutdown.
            return Ok(());
        }
        match persist(&ctx.store, &path) {
            Ok(count) => log::debug!("persisted {} peers to {}", count, path.display()),
            Err(e) => log::warn!("peer cache persist failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::NatKind;
    use std::collections::BTreeSet;

    fn store() -> PeerStore {
        PeerStore::new("LOCAL".into(), 42, "10.42.0.99".parse().unwrap())
    }

    fn peer(key: &str, age: Duration) -> MeshPeer {
        MeshPeer {
            public_key: key.into(),
            ipv4: "10.42.1.1".parse().unwrap(),
            ipv6: "fd00::1".parse().unwrap(),
            endpoint: Some("203.0.113.9:51820".parse().unwrap()),
            endpoint_source: Some(Source::Lan),
            routes: vec![],
            nat: NatKind::Cone,
            introducer: true,
            sources: BTreeSet::from([Source::Lan, Source::Dht]),
            last_update: SystemTime::now() - age,
            stale_once: true,
            stale_twice: true,
            offline_until: Some(SystemTime::now()),
        }
    }

    #[test]
    fn round_trip_restores_fresh_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0-peers");

        let source = store();
        source.update(peer("fresh", Duration::ZERO), Source::Lan);
        assert_eq!(persist(&source, &path).unwrap(), 1);

        let target = store();
        assert_eq!(restore(&target, &path).unwrap(), 1);

        let restored = target.get("fresh").unwrap();
        assert!(restored.sources.contains(&Source::Cache));
        // Rank lineage reset: the cached endpoint re-enters at cache rank.
        assert_eq!(restored.endpoint_source, Some(Source::Cache));
        // Liveness flags never survive the round trip.
        assert!(!restored.stale_once && !restored.stale_twice);
        assert!(restored.offline_until.is_none());
    }

    #[test]
    fn stale_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0-peers");

        let source = store();
        source.update(peer("fresh", Duration::ZERO), Source::Lan);
        // Backdate one entry past the restore window directly in the file.
        let mut peers = source.all();
        peers.push({
            let mut old = peer("ancient", Duration::ZERO);
            old.last_update = SystemTime::now() - Duration::from_secs(25 * 60 * 60);
            old
        });
        let json = serde_json::to_string(&peers).unwrap();
        std::fs::write(&path, json).unwrap();

        let target = store();
        assert_eq!(restore(&target, &path).unwrap(), 1);
        assert!(target.get("ancient").is_none());
    }

    #[test]
    fn missing_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let target = store();
        assert_eq!(restore(&target, &dir.path().join("nope")).unwrap(), 0);
    }

    #[test]
    fn corrupt_file_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg0-peers");
        std::fs::write(&path, b"{not json!").unwrap();
        assert_eq!(restore(&store(), &path).unwrap(), 0);
    }
}
