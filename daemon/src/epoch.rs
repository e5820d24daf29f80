//! Dandelion-style stem relay rotation.
//!
//! Each epoch, every node independently computes the same small set of
//! "stem" peers from the secret-derived rendezvous id. Outbound gossip has
//! a configurable chance of being funneled through the stems instead of
//! broadcast, so a passive observer can't pin an announcement's origin.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How many stem peers an epoch selects.
pub const STEM_COUNT: usize = 2;

pub struct EpochManager {
    rendezvous_id: [u8; 32],
    epoch_len: Duration,
    stem_probability: f64,
}

impl EpochManager {
    pub fn new(rendezvous_id: [u8; 32], stem_probability: f64) -> Self {
        // Roughly ten minutes, skewed per-mesh so epoch boundaries of
        // unrelated meshes don't line up on the wire.
        let epoch_len = Duration::from_secs(540 + (rendezvous_id[0] as u64 % 120));
        Self {
            rendezvous_id,
            epoch_len,
            stem_probability: stem_probability.clamp(0.0, 1.0),
        }
    }

    pub fn epoch_len(&self) -> Duration {
        self.epoch_len
    }

    pub fn stem_probability(&self) -> f64 {
        self.stem_probability
    }

    pub fn current_epoch(&self, now: SystemTime) -> u64 {
        let unix = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        unix / self.epoch_len.as_secs()
    }

    /// The deterministic per-epoch seed: HKDF(rendezvous_id ‖ epoch).
    fn epoch_seed(&self, epoch: u64) -> [u8; 32] {
        let mut ikm = Vec::with_capacity(40);
        ikm.extend_from_slice(&self.rendezvous_id);
        ikm.extend_from_slice(&epoch.to_be_bytes());
        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut seed = [0u8; 32];
        hk.expand(b"stem-epoch", &mut seed)
            .expect("32 bytes is a valid HKDF output length");
        seed
    }

    /// Selects up to `STEM_COUNT` stems from the given active peer keys.
    /// Every node with the same view of the active set picks the same
    /// stems.
    pub fn stems(&self, epoch: u64, active_keys: &[String]) -> Vec<String> {
        let seed = self.epoch_seed(epoch);
        let mut scored: Vec<(Vec<u8>, &String)> = active_keys
            .iter()
            .map(|key| {
                let mut hasher = Sha256::new();
                hasher.update(seed);
                hasher.update(key.as_bytes());
                (hasher.finalize().to_vec(), key)
            })
            .collect();
        scored.sort();
        scored
            .into_iter()
            .take(STEM_COUNT)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EpochManager {
        EpochManager::new([5u8; 32], 0.5)
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("peer-{i}")).collect()
    }

    #[test]
    fn epoch_length_near_ten_minutes() {
        let manager = manager();
        let len = manager.epoch_len().as_secs();
        assert!((540..660).contains(&len));
    }

    #[test]
    fn selection_is_deterministic() {
        let manager = manager();
        let active = keys(10);
        assert_eq!(manager.stems(7, &active), manager.stems(7, &active));
    }

    #[test]
    fn selection_is_order_independent() {
        let manager = manager();
        let active = keys(10);
        let mut shuffled = active.clone();
        shuffled.reverse();
        assert_eq!(manager.stems(7, &active), manager.stems(7, &shuffled));
    }

    #[test]
    fn epochs_rotate_the_set() {
        let manager = manager();
        let active = keys(50);
        // With 50 candidates, identical picks across many epochs would
        // mean the epoch number isn't feeding the seed.
        let rotated = (0..20).any(|epoch| manager.stems(epoch, &active) != manager.stems(20, &active));
        assert!(rotated);
    }

    #[test]
    fn small_pools_are_handled() {
        let manager = manager();
        assert!(manager.stems(1, &[]).is_empty());
        assert_eq!(manager.stems(1, &keys(1)).len(), 1);
        assert_eq!(manager.stems(1, &keys(5)).len(), STEM_COUNT);
    }

    #[test]
    fn probability_is_clamped() {
        assert_eq!(EpochManager::new([0u8; 32], 7.0).stem_probability(), 1.0);
        assert_eq!(EpochManager::new([0u8; 32], -1.0).stem_probability(), 0.0);
    }
}
