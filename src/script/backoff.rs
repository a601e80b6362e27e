// src/script/backoff.rs
//! Equal-jitter exponential backoff
//!
//! `target = min(cap, base * 2^attempt)`, then the sleep is half the target
//! plus a uniform random share of the other half. Firmware gets the result in
//! whole seconds.

use rand::Rng;
use std::time::Duration;

pub const DEFAULT_BASE_MS: u64 = 10_000;
pub const DEFAULT_CAP_MS: u64 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BASE_MS,
            cap_ms: DEFAULT_CAP_MS,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base_ms = base.as_millis().clamp(1, u64::MAX as u128) as u64;
        let cap_ms = (cap.as_millis().min(u64::MAX as u128) as u64).max(base_ms);
        Self { base_ms, cap_ms }
    }

    /// Capped exponential target for `attempt`
    pub fn target_ms(&self, attempt: u32) -> u64 {
        match 1u64.checked_shl(attempt) {
            Some(factor) => self.base_ms.saturating_mul(factor).min(self.cap_ms),
            None => self.cap_ms,
        }
    }

    pub fn sleep_ms(&self, attempt: u32) -> u64 {
        self.sleep_ms_with(attempt, &mut rand::thread_rng())
    }

    /// Sleep for `attempt`, in `[target/2, target)`
    pub fn sleep_ms_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let target = self.target_ms(attempt);
        let half = target / 2;
        let jitter = if target - half > 0 {
            rng.gen_range(0..target - half)
        } else {
            0
        };
        half + jitter
    }

    /// Sleep in whole seconds, as written into retry scripts
    pub fn sleep_secs(&self, attempt: u32) -> u64 {
        self.sleep_ms(attempt) / 1000
    }
}
