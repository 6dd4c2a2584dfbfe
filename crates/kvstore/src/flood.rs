//! Flood rate limiting and the buffer for suppressed publications.

use std::collections::{BTreeSet, HashMap};

use meridian_primitives::Publication;
use tokio::time::Instant;

/// Token bucket: `rate` tokens per second, up to `burst` banked.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32, burst: u32, now: Instant) -> Self {
        Self {
            rate_per_sec: f64::from(rate_per_sec),
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: now,
        }
    }

    /// Takes `tokens` if available, refilling for the elapsed time first.
    pub fn consume(&mut self, tokens: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last_refill = now;

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }
}

/// Keys whose flood was suppressed by the rate limiter, grouped by flood
/// root. Only key names are kept: values are re-read from the store at
/// drain time, so a key overwritten in between floods its newest record
/// and a key expired in between floods as a tombstone.
#[derive(Debug, Default)]
pub struct PublicationBuffer {
    pending: HashMap<Option<String>, BTreeSet<String>>,
}

impl PublicationBuffer {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn buffer(&mut self, publication: &Publication) {
        let keys = self
            .pending
            .entry(publication.flood_root_id.clone())
            .or_default();
        for key in publication.key_vals.keys() {
            let _ = keys.insert(key.clone());
        }
        for key in &publication.expired_keys {
            let _ = keys.insert(key.clone());
        }
    }

    pub fn drain(&mut self) -> Vec<(Option<String>, BTreeSet<String>)> {
        self.pending.drain().collect()
    }
}

#[cfg(test)]
#[path = "flood_tests.rs"]
mod flood_tests;
