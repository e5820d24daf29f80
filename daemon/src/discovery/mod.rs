//! Discovery layers.
//!
//! Every layer follows the same small contract: it is spawned as one or
//! more independent tasks, it may announce the local node, and whenever it
//! observes a candidate peer it publishes into the peer store with its
//! source tag. Layers never call each other; the store is the only
//! meeting point, which keeps the component graph acyclic.

pub mod cache;
pub mod dht;
pub mod exchange;
pub mod gossip;
pub mod lan;
pub mod registry;
pub mod rendezvous;
pub mod stun;

use crate::MeshContext;
use std::{future::Future, sync::Arc};
use tokio::task::JoinHandle;

/// Spawns one discovery loop. A panicking or erroring layer logs and dies
/// alone; the rest of the daemon keeps running.
pub(crate) fn spawn_layer<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match future.await {
            Ok(()) => log::debug!("{} layer stopped", name),
            Err(e) => log::warn!("{} layer exited with error: {}", name, e),
        }
    })
}

/// Sleeps for the interval unless shutdown arrives first. Returns `false`
/// on shutdown so loops can use `while tick(..).await`.
pub(crate) async fn sleep_or_shutdown(
    ctx: &Arc<MeshContext>,
    interval: std::time::Duration,
) -> bool {
    let mut shutdown = ctx.shutdown.subscribe();
    if ctx.shutdown_requested() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = shutdown.recv() => false,
    }
}
