//! Introducer-assisted rendezvous.
//!
//! When a peer is unreachable but some mutual, introducer-capable peer is
//! healthy, we ask that introducer to relay a rendezvous request. Both
//! sides learn each other's externally-observed endpoint at the top
//! direct-reachability rank and install it; the WireGuard keepalives that
//! follow perform the simultaneous-open hole punch. Symmetric-to-symmetric
//! pairs skip this entirely and go straight to relay routing.

use crate::{reconciler, MeshContext};
use anyhow::Result;
use shared::NatKind;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum spacing between punch attempts toward one peer.
const ATTEMPT_COOLDOWN: Duration = Duration::from_secs(60);

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![super::spawn_layer("rendezvous", run(ctx))]
}

async fn run(ctx: Arc<MeshContext>) -> Result<()> {
    let mut last_attempt: HashMap<String, Instant> = HashMap::new();

    loop {
        if !super::sleep_or_shutdown(&ctx, SCAN_INTERVAL).await {
            return Ok(());
        }

        let now = SystemTime::now();
        let active = ctx.store.active();
        let our_nat = ctx.stun.nat();
        last_attempt.retain(|_, attempted| attempted.elapsed() < ATTEMPT_COOLDOWN);

        for peer in &active {
            let unreachable = peer.stale_twice || peer.is_temporarily_offline(now);
            if !unreachable {
                continue;
            }
            if peer.nat == NatKind::Symmetric && our_nat == NatKind::Symmetric {
                continue;
            }
            if last_attempt.contains_key(&peer.public_key) {
                continue;
            }

            let Some(introducer) =
                reconciler::eligible_introducer(&active, &peer.public_key, now)
            else {
                continue;
            };
            let Some(endpoint) = introducer.endpoint.as_ref().and_then(|e| e.resolve().ok())
            else {
                continue;
            };
            let introducer_addr = SocketAddr::new(endpoint.ip(), ctx.identity.exchange_port());

            last_attempt.insert(peer.public_key.clone(), Instant::now());
            log::debug!(
                "requesting rendezvous with {} via introducer {}",
                peer.public_key,
                introducer.public_key
            );

            let ctx = ctx.clone();
            let target = peer.public_key.clone();
            tokio::spawn(async move {
                match super::exchange::request_rendezvous(&ctx, introducer_addr, target.clone())
                    .await
                {
                    Ok(responder) => {
                        log::info!("rendezvous with {} succeeded", target);
                        ctx.accept_rendezvous(responder);
                    },
                    Err(e) => log::debug!("rendezvous with {} failed: {}", target, e),
                }
            });
        }
    }
}
