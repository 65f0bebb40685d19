use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use idcycle_core::config::RetryConfig;

/// Seed for a step's backoff sequence: the first 8 bytes (big-endian) of
/// SHA-256 over `correlation_id|step_type|step_name|index`.
///
/// Identical inputs always yield the identical delay sequence.
pub fn retry_seed(correlation_id: &str, step_type: &str, step_name: &str, index: usize) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}|{}", correlation_id, step_type, step_name, index).as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Exponential backoff with a capped delay and bounded, seeded jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    multiplier: f64,
    jitter_ratio: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms.max(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Total attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self, seed: u64) -> Backoff {
        Backoff {
            policy: self.clone(),
            rng: StdRng::seed_from_u64(seed),
            retry: 0,
        }
    }

    /// Every delay a step with this seed could sleep, in order.
    pub fn schedule(&self, seed: u64) -> Vec<Duration> {
        self.backoff(seed)
            .take(self.max_attempts.saturating_sub(1) as usize)
            .collect()
    }
}

/// Delay sequence for one step. Never ends; callers stop at the attempt limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    rng: StdRng,
    retry: u32,
}

impl Backoff {
    /// Delay before the next attempt: `min(max, initial * multiplier^(n-1))`
    /// scaled by a factor in `[1 - jitter, 1 + jitter]`, clamped to `max`.
    pub fn next_delay(&mut self) -> Duration {
        self.retry += 1;
        let p = &self.policy;
        let exponent = (self.retry - 1).min(i32::MAX as u32) as i32;
        let base = (p.initial_backoff_ms as f64 * p.multiplier.powi(exponent))
            .min(p.max_backoff_ms as f64);
        let factor = if p.jitter_ratio > 0.0 {
            self.rng
                .gen_range((1.0 - p.jitter_ratio)..=(1.0 + p.jitter_ratio))
        } else {
            1.0
        };
        let ms = (base * factor).clamp(0.0, p.max_backoff_ms as f64);
        Duration::from_millis(ms.round() as u64)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}
