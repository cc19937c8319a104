// src/manifest/restart.rs

//! Restart policy and retry backoff.
//!
//! The delay for retry attempt `k` (0-indexed) is derived purely from the
//! attempt number:
//!
//! ```text
//! ceiling(k) = min(base * 2^k, cap)
//! delay(k)   = ceiling(k) - jitter_sample * jitter * ceiling(k)
//! ```
//!
//! Jitter is subtracted, so every delay lies in `[0, ceiling(k)]` and a random
//! draw never feeds into later attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::RestartPolicyKind;

/// Exponential backoff parameters for one service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry (before jitter).
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// `min(base * 2^attempt, cap)`; saturates to `cap` on overflow.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exp);
        let cap = self.cap.as_secs_f64();

        if !secs.is_finite() || secs < 0.0 || secs > cap {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay for the given attempt using a fresh random jitter sample.
    pub fn delay(&self, attempt: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_sample(attempt, sample)
    }

    /// Deterministic variant of [`Backoff::delay`]; `sample` is clamped to
    /// `[0, 1]`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        ceiling.mul_f64(1.0 - jitter)
    }
}

/// Retry budget as written in the manifest: a count or `"unbounded"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawMaxRetries")]
pub enum MaxRetries {
    Limited(u32),
    /// Capped at runtime by `[supervisor].retry_ceiling`.
    Unbounded,
}

impl Default for MaxRetries {
    fn default() -> Self {
        MaxRetries::Limited(5)
    }
}

impl MaxRetries {
    /// Effective budget once the deployment ceiling is applied.
    pub fn effective(&self, ceiling: u32) -> u32 {
        match self {
            MaxRetries::Limited(n) => *n,
            MaxRetries::Unbounded => ceiling,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMaxRetries {
    Count(u32),
    Word(String),
}

impl TryFrom<RawMaxRetries> for MaxRetries {
    type Error = String;

    fn try_from(raw: RawMaxRetries) -> Result<Self, Self::Error> {
        match raw {
            RawMaxRetries::Count(n) => Ok(MaxRetries::Limited(n)),
            RawMaxRetries::Word(w) if w.trim().eq_ignore_ascii_case("unbounded") => {
                Ok(MaxRetries::Unbounded)
            }
            RawMaxRetries::Word(w) => Err(format!(
                "invalid max_retries '{w}' (expected a number or \"unbounded\")"
            )),
        }
    }
}

/// Validated restart policy of one service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartPolicy {
    pub kind: RestartPolicyKind,
    pub backoff: Backoff,
    pub max_retries: MaxRetries,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            kind: RestartPolicyKind::default(),
            backoff: Backoff::default(),
            max_retries: MaxRetries::default(),
        }
    }
}
