//! Background job: discard idle rate-limiter buckets.
//!
//! Buckets untouched for the inactivity TTL are dropped; the sweep runs at
//! half the TTL so a bucket lives at most 1.5×TTL past its last use.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::middleware::rate_limit::RateLimiter;

pub fn start_bucket_sweeper(
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = limiter.ttl() / 2;
        tracing::info!(period_secs = period.as_secs(), "rate-limit bucket sweeper started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = limiter.cleanup();
                    if removed > 0 {
                        tracing::debug!(
                            removed,
                            remaining = limiter.bucket_count(),
                            "idle rate-limit buckets discarded"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("rate-limit bucket sweeper stopping");
                    return;
                }
            }
        }
    })
}
