//! Admission control.
//!
//! `always-admit` and continuous-fill `token-bucket`. A rejected request is
//! terminal — it is counted in conservation but never queued.

use blis_common::{BlisError, Micros, Result};

#[derive(Debug, Clone)]
pub enum AdmissionPolicy {
    AlwaysAdmit,
    TokenBucket(TokenBucket),
}

impl AdmissionPolicy {
    pub fn always_admit() -> Self {
        AdmissionPolicy::AlwaysAdmit
    }

    pub fn token_bucket(capacity: f64, refill_rate_per_sec: f64) -> Result<Self> {
        Ok(AdmissionPolicy::TokenBucket(TokenBucket::new(
            capacity,
            refill_rate_per_sec,
        )?))
    }

    /// Attempt to admit one request arriving at `now`. Mutates internal
    /// token-bucket state as a side effect.
    pub fn try_admit(&mut self, now: Micros) -> bool {
        match self {
            AdmissionPolicy::AlwaysAdmit => true,
            AdmissionPolicy::TokenBucket(bucket) => bucket.try_consume(now),
        }
    }
}

/// Continuous-fill token bucket: tokens accumulate at `refill_rate_per_sec`
/// tokens/second since the last inspection, clamped to `capacity`. A
/// request consumes exactly one token; if none is available it is
/// rejected, not queued.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_sec: f64,
    tokens: f64,
    last_checked: Micros,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate_per_sec: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity < 0.0 {
            return Err(BlisError::Validation(format!(
                "token-bucket-capacity must be finite and non-negative, got {capacity}"
            )));
        }
        if !refill_rate_per_sec.is_finite() || refill_rate_per_sec < 0.0 {
            return Err(BlisError::Validation(format!(
                "token-bucket-refill-rate must be finite and non-negative, got {refill_rate_per_sec}"
            )));
        }
        Ok(Self {
            capacity,
            refill_rate_per_sec,
            tokens: capacity,
            last_checked: 0,
        })
    }

    fn refill(&mut self, now: Micros) {
        let elapsed_us = (now - self.last_checked).max(0) as f64;
        let elapsed_s = elapsed_us / 1_000_000.0;
        self.tokens = (self.tokens + elapsed_s * self.refill_rate_per_sec).min(self.capacity);
        self.last_checked = now;
    }

    pub fn try_consume(&mut self, now: Micros) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
