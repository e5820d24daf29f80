//! External bootstrap registry.
//!
//! A last-resort rendezvous for meshes whose DHT egress is blocked: nodes
//! post envelope-encrypted advertisements into an issue-tracker comment
//! thread and poll it for others. The ciphertext makes the thread useless
//! to anyone without the mesh secret. Only started when the DHT reports
//! bootstrap failure and a registry URL is configured.

use crate::MeshContext;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use shared::{
    envelope::{self, MsgType},
    Announcement, Source,
};
use std::{sync::Arc, time::Duration};
use ureq::{Agent, AgentBuilder};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Re-post our advertisement once per this many polls.
const POSTS_EVERY_N_POLLS: u32 = 12;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    body: String,
}

fn agent() -> Agent {
    AgentBuilder::new().timeout(Duration::from_secs(10)).build()
}

fn post_advertisement(config: &RegistryConfig, body: String) -> Result<()> {
    let mut request = agent().post(&config.url);
    if let Some(token) = &config.token {
        request = request.set("Authorization", &format!("token {token}"));
    }
    request
        .send_json(serde_json::json!({ "body": body }))
        .context("posting registry advertisement")?;
    Ok(())
}

fn fetch_comments(config: &RegistryConfig) -> Result<Vec<Comment>> {
    let mut request = agent().get(&config.url);
    if let Some(token) = &config.token {
        request = request.set("Authorization", &format!("token {token}"));
    }
    Ok(request
        .call()
        .context("fetching registry comments")?
        .into_json()?)
}

pub fn start(ctx: Arc<MeshContext>, config: RegistryConfig) -> Vec<tokio::task::JoinHandle<()>> {
    vec![super::spawn_layer("registry", run(ctx, config))]
}

async fn run(ctx: Arc<MeshContext>, config: RegistryConfig) -> Result<()> {
    // Hold off until the DHT declares bootstrap failure; most meshes never
    // need this layer at all.
    loop {
        if ctx.dht_bootstrap_failed() {
            break;
        }
        if !super::sleep_or_shutdown(&ctx, Duration::from_secs(30)).await {
            return Ok(());
        }
    }
    log::info!("DHT bootstrap failed; starting registry fallback at {}", config.url);

    let mut polls = 0u32;
    loop {
        if polls % POSTS_EVERY_N_POLLS == 0 {
            let announcement = ctx.our_announcement();
            match envelope::seal_message(
                &ctx.identity.envelope_key,
                &ctx.identity.network_id,
                MsgType::Announce,
                &announcement,
            ) {
                Ok(sealed) => {
                    let body = BASE64.encode(sealed);
                    let config = config.clone();
                    let posted =
                        tokio::task::spawn_blocking(move || post_advertisement(&config, body))
                            .await;
                    match posted {
                        Ok(Ok(())) => log::debug!("posted registry advertisement"),
                        Ok(Err(e)) => log::debug!("registry post failed: {}", e),
                        Err(e) => log::debug!("registry post task failed: {}", e),
                    }
                },
                Err(e) => log::debug!("sealing registry advertisement failed: {}", e),
            }
        }
        polls = polls.wrapping_add(1);

        let fetched = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || fetch_comments(&config)).await
        };
        match fetched {
            Ok(Ok(comments)) => {
                for comment in comments {
                    let Ok(sealed) = BASE64.decode(comment.body.trim()) else {
                        continue;
                    };
                    match envelope::open_expected::<Announcement>(
                        &ctx.identity.envelope_key,
                        &ctx.identity.network_id,
                        MsgType::Announce,
                        &sealed,
                    ) {
                        Ok(announcement) => {
                            ctx.accept_announcement(announcement, None, Source::Registry);
                        },
                        Err(_) => ctx.store.note_rejected(Source::Registry),
                    }
                }
            },
            Ok(Err(e)) => log::debug!("registry poll failed: {}", e),
            Err(e) => log::debug!("registry poll task failed: {}", e),
        }

        if !super::sleep_or_shutdown(&ctx, POLL_INTERVAL).await {
            return Ok(());
        }
    }
}
