//! Expired-entry sweeping
//!
//! Expiry is checked lazily whenever an address is looked up, so the
//! sweeper only bounds memory held by addresses that never come back.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::RateLimiter;

/// Periodically purge expired entries until cancelled.
///
/// A zero interval disables sweeping; expiry is still checked on lookup.
pub async fn run_sweeper(
    limiter: Arc<RateLimiter>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if interval.is_zero() {
        tracing::warn!("Rate limiter sweep interval is zero, sweeper disabled");
        return;
    }

    let mut ticker = tokio::time::interval(interval);

    tracing::debug!("Starting rate limiter sweeper (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = limiter.purge_expired();
                if removed > 0 {
                    tracing::debug!("Swept {} expired rate limit entries", removed);
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Rate limiter sweeper shutting down");
                break;
            }
        }
    }
}
