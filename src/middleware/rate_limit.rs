//! Per-tenant token-bucket rate limiting.
//!
//! Each tenant key gets a bucket with (rpm, burst). Admission APIs:
//! - `allow` / `allow_n`: immediate boolean admission
//! - `wait`: resolves when a token becomes available; callers race it
//!   against their own cancellation
//! - `allow_with_rate`: per-call (rpm, burst) override; an existing bucket
//!   with a different rate is re-quotaed
//!
//! Idle buckets are swept after the inactivity TTL (see `jobs::cleanup`).
//! An injectable [`DistributedLimiter`] replaces the in-process buckets
//! wholesale when multi-node admission is required.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;

use crate::errors::AppError;
use crate::AppState;

use super::AuthContext;

type DirectLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Tunables for the in-process limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub default_rpm: u32,
    /// Burst applied when `force_default_burst` is set.
    pub default_burst: u32,
    /// When true every bucket uses `default_burst` instead of rpm/6.
    pub force_default_burst: bool,
    /// Buckets idle longer than this are discarded by the sweeper.
    pub ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            default_rpm: 600,
            default_burst: 100,
            force_default_burst: false,
            ttl: Duration::from_secs(3600),
        }
    }
}

struct Bucket {
    rpm: u32,
    burst: u32,
    limiter: Arc<DirectLimiter>,
    last_access: Instant,
}

/// In-process token-bucket registry.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        RateLimiter {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Burst for a bucket with the given rpm: rpm/6, floor 1, unless the
    /// limiter is configured to force the global default.
    pub fn burst_for(&self, rpm: u32) -> u32 {
        if self.config.force_default_burst {
            self.config.default_burst
        } else {
            (rpm / 6).max(1)
        }
    }

    pub fn default_rpm(&self) -> u32 {
        self.config.default_rpm
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Number of live buckets. Mostly for the sweeper's logging.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Get or create the bucket for `key`, re-quotaing it if the requested
    /// rate differs. Returns `None` when rpm is zero (always reject).
    fn bucket(&self, key: &str, rpm: u32, burst: u32) -> Option<Arc<DirectLimiter>> {
        let rpm_nz = NonZeroU32::new(rpm)?;
        let burst_nz = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);

        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            let quota = Quota::per_minute(rpm_nz).allow_burst(burst_nz);
            Bucket {
                rpm,
                burst,
                limiter: Arc::new(governor::RateLimiter::direct(quota)),
                last_access: Instant::now(),
            }
        });

        if entry.rpm != rpm || entry.burst != burst {
            let quota = Quota::per_minute(rpm_nz).allow_burst(burst_nz);
            entry.rpm = rpm;
            entry.burst = burst;
            entry.limiter = Arc::new(governor::RateLimiter::direct(quota));
        }
        entry.last_access = Instant::now();

        Some(entry.limiter.clone())
    }

    /// Immediate admission at the default rate.
    pub fn allow(&self, key: &str) -> bool {
        let rpm = self.config.default_rpm;
        self.allow_with_rate(key, rpm, self.burst_for(rpm))
    }

    /// Bulk admission: take `n` tokens or none.
    pub fn allow_n(&self, key: &str, n: u32) -> bool {
        let rpm = self.config.default_rpm;
        let Some(limiter) = self.bucket(key, rpm, self.burst_for(rpm)) else {
            return false;
        };
        let Some(n) = NonZeroU32::new(n) else {
            return true;
        };
        matches!(limiter.check_n(n), Ok(Ok(())))
    }

    /// Immediate admission at a caller-supplied rate.
    pub fn allow_with_rate(&self, key: &str, rpm: u32, burst: u32) -> bool {
        match self.bucket(key, rpm, burst) {
            Some(limiter) => limiter.check().is_ok(),
            None => false,
        }
    }

    /// Resolves when a token is available at the default rate. Callers
    /// race this future against their own cancellation:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     _ = limiter.wait("tenant") => { /* admitted */ }
    ///     _ = shutdown.changed() => { /* cancelled */ }
    /// }
    /// ```
    pub async fn wait(&self, key: &str) {
        let rpm = self.config.default_rpm;
        let Some(limiter) = self.bucket(key, rpm, self.burst_for(rpm)) else {
            // Zero quota never admits; park until the caller cancels.
            futures::future::pending::<()>().await;
            return;
        };
        limiter.until_ready().await;
    }

    /// Drop buckets idle past the inactivity TTL. Returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let ttl = self.config.ttl;
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.last_access.elapsed() < ttl);
        before - self.buckets.len()
    }
}

// ── Distributed mode ─────────────────────────────────────────────

/// One tenant bucket to consult, in priority order.
#[derive(Debug, Clone)]
pub struct RateDescriptor {
    pub key: String,
    pub rpm: u32,
    pub burst: u32,
}

/// Per-descriptor admission result.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: i64,
}

/// External admission service. When injected, the middleware delegates to
/// it in lieu of the in-process buckets; behavior is otherwise identical.
#[async_trait]
pub trait DistributedLimiter: Send + Sync {
    async fn check_allow(&self, descriptors: &[RateDescriptor]) -> anyhow::Result<Vec<RateDecision>>;
}

/// Redis-backed fixed-window limiter: one INCR+EXPIRE per descriptor.
pub struct RedisLimiter {
    conn: redis::aio::ConnectionManager,
}

impl RedisLimiter {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        RedisLimiter { conn }
    }
}

#[async_trait]
impl DistributedLimiter for RedisLimiter {
    async fn check_allow(&self, descriptors: &[RateDescriptor]) -> anyhow::Result<Vec<RateDecision>> {
        // Atomic INCR + EXPIRE on first touch of the window.
        let script = redis::Script::new(
            r#"
            local current = redis.call("INCR", KEYS[1])
            if current == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return current
        "#,
        );

        let mut out = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            let mut conn = self.conn.clone();
            let count: i64 = script
                .key(format!("llmux:rl:{}", d.key))
                .arg(60)
                .invoke_async(&mut conn)
                .await?;
            let limit = d.rpm as i64 + d.burst as i64;
            out.push(RateDecision {
                allowed: count <= limit,
                remaining: (limit - count).max(0),
            });
        }
        Ok(out)
    }
}

// ── Middleware ───────────────────────────────────────────────────

/// Admission middleware. Consults the team bucket first (when the team has
/// an rpm limit), then the key bucket; anonymous requests are keyed by
/// client address. Rejection is 429 with `Retry-After: 60`.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let descriptors = build_descriptors(&state, &request);

    if let Some(distributed) = &state.distributed_limiter {
        let decisions = distributed.check_allow(&descriptors).await?;
        if let Some(denied) = decisions.iter().position(|d| !d.allowed) {
            tracing::debug!(
                tenant = %descriptors[denied].key,
                "distributed rate limit exceeded"
            );
            return Err(AppError::RateLimitExceeded);
        }
    } else {
        for d in &descriptors {
            if !state.limiter.allow_with_rate(&d.key, d.rpm, d.burst) {
                tracing::debug!(tenant = %d.key, rpm = d.rpm, "rate limit exceeded");
                return Err(AppError::RateLimitExceeded);
            }
        }
    }

    Ok(next.run(request).await)
}

fn build_descriptors(state: &AppState, request: &Request) -> Vec<RateDescriptor> {
    let limiter = &state.limiter;
    let mut descriptors = Vec::with_capacity(2);

    match request.extensions().get::<AuthContext>() {
        Some(ctx) => {
            // Team bucket gates first when the team carries its own limit.
            if let Some(team) = &ctx.team {
                if let Some(team_rpm) = team.rpm_limit {
                    if team_rpm > 0 {
                        let rpm = team_rpm as u32;
                        descriptors.push(RateDescriptor {
                            key: format!("team:{}", team.id),
                            rpm,
                            burst: limiter.burst_for(rpm),
                        });
                    }
                }
            }

            let rpm = ctx
                .key
                .as_ref()
                .and_then(|k| k.rpm_limit)
                .map(|r| r as u32)
                .unwrap_or_else(|| limiter.default_rpm());
            let tenant = ctx
                .tenant_key()
                .unwrap_or_else(|| "anonymous".to_string());
            descriptors.push(RateDescriptor {
                key: tenant,
                rpm,
                burst: limiter.burst_for(rpm),
            });
        }
        None => {
            let rpm = limiter.default_rpm();
            descriptors.push(RateDescriptor {
                key: format!("ip:{}", client_address(request)),
                rpm,
                burst: limiter.burst_for(rpm),
            });
        }
    }

    descriptors
}

fn client_address(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return addr.ip().to_string();
    }
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            default_rpm: rpm,
            default_burst: burst,
            force_default_burst: true,
            ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_burst_admissions_then_reject() {
        let rl = limiter(60, 2);
        assert!(rl.allow("a"));
        assert!(rl.allow("a"));
        // Third within the same second exceeds the burst.
        assert!(!rl.allow("a"));
    }

    #[test]
    fn test_tenants_are_isolated() {
        let rl = limiter(60, 1);
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[test]
    fn test_replenishes_after_a_second() {
        let rl = limiter(60, 1);
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(rl.allow("a"));
    }

    #[test]
    fn test_allow_n_all_or_nothing() {
        let rl = limiter(60, 5);
        assert!(rl.allow_n("a", 3));
        assert!(!rl.allow_n("a", 3));
        assert!(rl.allow_n("a", 2));
        assert!(rl.allow_n("a", 0));
    }

    #[test]
    fn test_zero_rpm_always_rejects() {
        let rl = limiter(60, 2);
        assert!(!rl.allow_with_rate("a", 0, 1));
    }

    #[test]
    fn test_rate_update_on_existing_bucket() {
        let rl = limiter(60, 1);
        assert!(rl.allow_with_rate("a", 60, 1));
        assert!(!rl.allow_with_rate("a", 60, 1));
        // Re-quota with a bigger burst: fresh bucket admits again.
        assert!(rl.allow_with_rate("a", 120, 5));
        assert_eq!(rl.bucket_count(), 1);
    }

    #[test]
    fn test_burst_for() {
        let rl = RateLimiter::new(RateLimiterConfig {
            default_rpm: 600,
            default_burst: 100,
            force_default_burst: false,
            ttl: Duration::from_secs(60),
        });
        assert_eq!(rl.burst_for(60), 10);
        assert_eq!(rl.burst_for(5), 1); // floor of 1
        let forced = limiter(600, 42);
        assert_eq!(forced.burst_for(60), 42);
    }

    #[test]
    fn test_cleanup_drops_idle_buckets() {
        let rl = RateLimiter::new(RateLimiterConfig {
            default_rpm: 60,
            default_burst: 1,
            force_default_burst: true,
            ttl: Duration::from_millis(50),
        });
        rl.allow("a");
        rl.allow("b");
        assert_eq!(rl.bucket_count(), 2);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(rl.cleanup(), 2);
        assert_eq!(rl.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_admits_when_token_available() {
        let rl = limiter(600, 5);
        // Burst available: wait resolves immediately.
        tokio::time::timeout(Duration::from_millis(100), rl.wait("a"))
            .await
            .expect("wait should resolve while burst remains");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_replenished() {
        let rl = limiter(60, 1);
        assert!(rl.allow("a"));
        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(3), rl.wait("a"))
            .await
            .expect("wait should resolve after replenish");
        assert!(started.elapsed() >= Duration::from_millis(500));
    }
}
