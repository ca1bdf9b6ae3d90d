//! Connection admission rate limiting
//!
//! Every new connection waits on the token bucket of its source address,
//! if that address has one. Addresses only get a bucket after a failed
//! connection, and every further failure halves the bucket's rate. Rates
//! never recover: an entry simply expires `idle_ttl` after it was created,
//! whatever happened to it since, and the address is treated as unseen
//! again.
//!
//! Entries live in a sharded map so a throttled address never blocks
//! admission of unrelated ones. No lock is held while a caller waits.

mod bucket;
mod sweeper;

pub use bucket::TokenBucket;
pub use sweeper::run_sweeper;

use std::net::IpAddr;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use podssh_core::config::RateLimitSettings;

/// Limiter state for one source address
#[derive(Debug)]
struct AddressEntry {
    bucket: TokenBucket,
    /// When the first failure created the entry; later penalties leave it
    created: Instant,
}

impl AddressEntry {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created) >= ttl
    }
}

/// Address-keyed admission limiter shared by all connections
pub struct RateLimiter {
    settings: RateLimitSettings,
    entries: DashMap<IpAddr, AddressEntry>,
}

impl RateLimiter {
    /// Create an empty limiter
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            entries: DashMap::new(),
        }
    }

    /// Wait until a connection from `addr` may proceed.
    ///
    /// Unseen addresses are admitted immediately. Never fails.
    pub async fn admit(&self, addr: IpAddr) {
        let delay = self.reserve(addr, Instant::now());
        if delay.is_zero() {
            return;
        }

        tracing::debug!(peer = %addr, delay = ?delay, "Throttling connection");
        tokio::time::sleep(delay).await;
    }

    /// Record a failed connection from `addr` and return its new rate.
    ///
    /// The first failure creates a bucket at the penalty rate; each later
    /// failure halves it.
    pub fn penalize(&self, addr: IpAddr) -> f64 {
        let now = Instant::now();

        let rate = match self.entries.entry(addr) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.is_expired(now, self.settings.idle_ttl) {
                    *entry = self.fresh_entry(now);
                } else {
                    let halved = entry.bucket.rate() / 2.0;
                    entry.bucket.set_rate(halved, now);
                }
                entry.bucket.rate()
            }
            Entry::Vacant(slot) => slot.insert(self.fresh_entry(now)).bucket.rate(),
        };

        tracing::info!(peer = %addr, rate, "Penalized failed connection");
        rate
    }

    /// Current rate for `addr`, if it has a live entry
    pub fn rate(&self, addr: IpAddr) -> Option<f64> {
        let now = Instant::now();
        self.entries
            .get(&addr)
            .filter(|entry| !entry.is_expired(now, self.settings.idle_ttl))
            .map(|entry| entry.bucket.rate())
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.settings.idle_ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, ttl));
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked addresses (expired ones included until swept)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no address is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take a token for `addr` and return the wait, capped at the idle
    /// window since the entry is gone by then anyway
    fn reserve(&self, addr: IpAddr, now: Instant) -> Duration {
        let Entry::Occupied(mut slot) = self.entries.entry(addr) else {
            return Duration::ZERO;
        };

        if slot.get().is_expired(now, self.settings.idle_ttl) {
            slot.remove();
            return Duration::ZERO;
        }

        slot.get_mut()
            .bucket
            .reserve(now)
            .min(self.settings.idle_ttl)
    }

    fn fresh_entry(&self, now: Instant) -> AddressEntry {
        AddressEntry {
            bucket: TokenBucket::new(
                self.settings.penalty_rate,
                self.settings.penalty_burst,
                now,
            ),
            created: now,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitSettings::default())
    }
}
