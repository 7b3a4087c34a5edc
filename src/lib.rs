//! llmux — authentication, authorization, and multi-tenant accounting core
//! for an LLM API gateway.
//!
//! The crate decides, for every inbound request targeting an LLM endpoint,
//! whether the caller is known (credential pipeline), permitted (RBAC
//! engine + model-access check), and within its envelopes (rate limiter,
//! budgets), and attributes what each served request cost.

pub mod api;
pub mod audit;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod duration;
pub mod errors;
pub mod invitations;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod sso;
pub mod store;

use std::sync::Arc;

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::middleware::engine::Enforcer;
use crate::middleware::rate_limit::{DistributedLimiter, RateLimiter, RateLimiterConfig};
use crate::middleware::session::SessionCodec;
use crate::store::GatewayStore;

/// Shared application state threaded through handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn GatewayStore>,
    pub enforcer: Arc<Enforcer>,
    pub limiter: Arc<RateLimiter>,
    /// When present, admission delegates to the external service in lieu
    /// of the in-process buckets.
    pub distributed_limiter: Option<Arc<dyn DistributedLimiter>>,
    pub session: Arc<SessionCodec>,
    pub audit: Arc<AuditLogger>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire up state from a store and config; the usual construction path
    /// for both the binary and tests.
    pub fn new(store: Arc<dyn GatewayStore>, config: Config) -> Self {
        let limiter = RateLimiter::new(RateLimiterConfig {
            default_rpm: config.default_rpm,
            default_burst: config.default_burst,
            force_default_burst: config.force_default_burst,
            ttl: std::time::Duration::from_secs(config.rate_limit_ttl_secs),
        });
        let session = SessionCodec::new(&config.session_secret);
        let audit = AuditLogger::new(store.clone(), config.audit_enabled);
        AppState {
            store,
            enforcer: Arc::new(Enforcer::new()),
            limiter: Arc::new(limiter),
            distributed_limiter: None,
            session: Arc::new(session),
            audit: Arc::new(audit),
            config: Arc::new(config),
        }
    }
}
