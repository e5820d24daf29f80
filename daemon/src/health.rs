//! Dual-signal peer health.
//!
//! Signal one: WireGuard handshake age combined with transfer counters,
//! sampled every 20 s. Signal two: a side-channel TCP ping over the mesh
//! itself, once a second. The two are independent on purpose; the
//! reconciler ORs them, so a wedged tunnel is caught even while the kernel
//! still reports a recent-enough handshake.

use crate::{
    discovery::exchange::{read_frame, write_frame},
    MeshContext,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::{
    envelope::{self, MsgType},
    HANDSHAKE_STALE_SECS,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::timeout,
};
use wireguard_control::Device;

pub const HANDSHAKE_SAMPLE_INTERVAL: Duration = Duration::from_secs(20);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(900);
pub const PROBE_FAILURE_THRESHOLD: u32 = 8;
pub const TEMPORARY_OFFLINE: Duration = Duration::from_secs(30);

/// The mesh probe listens at the WireGuard port plus this offset.
pub const PROBE_PORT_OFFSET: u16 = 2000;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct ProbePing {
    from: String,
    seq: u64,
}

pub fn probe_port(listen_port: u16) -> u16 {
    listen_port.wrapping_add(PROBE_PORT_OFFSET)
}

pub fn start(ctx: Arc<MeshContext>) -> Vec<tokio::task::JoinHandle<()>> {
    use crate::discovery::spawn_layer;
    vec![
        spawn_layer("handshake-monitor", handshake_monitor(ctx.clone())),
        spawn_layer("prober", prober(ctx.clone())),
        spawn_layer("probe-listener", probe_listener(ctx)),
    ]
}

/// Decides staleness for one peer from one sample: no handshake within the
/// threshold AND no growth in receive counters since the last sample.
fn sample_is_stale(
    handshake: Option<SystemTime>,
    previous_rx: Option<u64>,
    current_rx: u64,
    now: SystemTime,
) -> bool {
    let handshake_stale = match handshake {
        Some(at) => now
            .duration_since(at)
            .map(|age| age > HANDSHAKE_STALE_SECS)
            .unwrap_or(false),
        None => true,
    };
    let transferred = previous_rx.map(|prev| current_rx > prev).unwrap_or(false);
    handshake_stale && !transferred
}

async fn handshake_monitor(ctx: Arc<MeshContext>) -> Result<()> {
    let mut previous_rx: HashMap<String, u64> = HashMap::new();

    loop {
        if !crate::discovery::sleep_or_shutdown(&ctx, HANDSHAKE_SAMPLE_INTERVAL).await {
            return Ok(());
        }

        let device = match Device::get(&ctx.interface, ctx.backend) {
            Ok(device) => device,
            Err(e) => {
                log::debug!("handshake sample failed to read device: {}", e);
                continue;
            },
        };

        let now = SystemTime::now();
        let mut current_rx = HashMap::new();
        for info in &device.peers {
            let key = info.config.public_key.to_base64();
            let stale = sample_is_stale(
                info.stats.last_handshake_time,
                previous_rx.get(&key).copied(),
                info.stats.rx_bytes,
                now,
            );
            ctx.store.record_staleness(&key, stale);
            current_rx.insert(key, info.stats.rx_bytes);
        }
        previous_rx = current_rx;
    }
}

async fn probe_once(ctx: &Arc<MeshContext>, addr: SocketAddr, seq: u64) -> Result<()> {
    let mut stream = timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await??;

    let ping = ProbePing {
        from: ctx.identity.keypair.public.to_base64(),
        seq,
    };
    let sealed = envelope::seal_message(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Probe,
        &ping,
    )?;
    timeout(PROBE_TIMEOUT, write_frame(&mut stream, &sealed)).await??;

    let frame = timeout(PROBE_TIMEOUT, read_frame(&mut stream)).await??;
    let pong: ProbePing = envelope::open_expected(
        &ctx.identity.envelope_key,
        &ctx.identity.network_id,
        MsgType::Probe,
        &frame,
    )?;
    if pong.seq != ping.seq {
        anyhow::bail!("probe sequence mismatch");
    }
    Ok(())
}

async fn prober(ctx: Arc<MeshContext>) -> Result<()> {
    let port = probe_port(ctx.listen_port);
    let mut failures: HashMap<String, u32> = HashMap::new();
    let mut seq = 0u64;

    let mut interval = tokio::time::interval(PROBE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = shutdown.recv() => return Ok(()),
        }
        seq = seq.wrapping_add(1);

        let active = ctx.store.active();
        failures.retain(|key, _| active.iter().any(|peer| &peer.public_key == key));

        let probes: Vec<_> = active
            .iter()
            .map(|peer| {
                let ctx = ctx.clone();
                let key = peer.public_key.clone();
                let addr = SocketAddr::from((peer.ipv4, port));
                tokio::spawn(async move { (key, probe_once(&ctx, addr, seq).await.is_ok()) })
            })
            .collect();

        for probe in probes {
            let Ok((key, success)) = probe.await else {
                continue;
            };
            if success {
                failures.remove(&key);
                ctx.store.clear_temporary_offline(&key);
            } else {
                let count = failures.entry(key.clone()).or_insert(0);
                *count += 1;
                if *count >= PROBE_FAILURE_THRESHOLD {
                    if *count == PROBE_FAILURE_THRESHOLD {
                        log::info!(
                            "peer {} failed {} probes, marking temporarily offline",
                            key,
                            count
                        );
                    }
                    ctx.store.mark_temporary_offline(&key, TEMPORARY_OFFLINE);
                }
            }
        }
    }
}

async fn probe_listener(ctx: Arc<MeshContext>) -> Result<()> {
    // Wildcard-bound for the same reason as gossip: the mesh address can
    // be swapped out by collision resolution. Pings authenticate via the
    // envelope, not via the bind address.
    let addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, probe_port(ctx.listen_port)));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding probe listener on {addr}"))?;
    log::info!("mesh probe listener on {}", addr);

    let mut shutdown = ctx.shutdown.subscribe();
    loop {
        let (mut stream, remote) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::debug!("probe accept failed: {}", e);
                    continue;
                },
            },
            _ = shutdown.recv() => return Ok(()),
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let respond = async {
                let frame = timeout(PROBE_TIMEOUT, read_frame(&mut stream)).await??;
                let ping: ProbePing = envelope::open_expected(
                    &ctx.identity.envelope_key,
                    &ctx.identity.network_id,
                    MsgType::Probe,
                    &frame,
                )?;
                let pong = envelope::seal_message(
                    &ctx.identity.envelope_key,
                    &ctx.identity.network_id,
                    MsgType::Probe,
                    &ping,
                )?;
                timeout(PROBE_TIMEOUT, write_frame(&mut stream, &pong)).await??;
                anyhow::Ok(())
            };
            if let Err(e) = respond.await {
                log::debug!("probe exchange with {} failed: {}", remote, e);
            }
        });
    }
}
