//! Request-path middleware: session resolution, credential authentication,
//! model-access enforcement, rate limiting, and spend attribution.
//!
//! Composition order (outermost first): session → auth → model-access →
//! rate-limit → handler → spend. Each stage short-circuits on the first
//! failure.

pub mod auth;
pub mod engine;
pub mod model_access;
pub mod rate_limit;
pub mod session;
pub mod spend;

use crate::models::{ApiKey, Team, User};

/// Immutable per-request identity. Attached as a request extension by the
/// session or auth middleware; each request derives its own copy.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub key: Option<ApiKey>,
    pub team: Option<Team>,
    pub user: Option<User>,
}

impl AuthContext {
    /// Policy-engine subject for this context: the key wins, then the user.
    pub fn subject(&self) -> Option<String> {
        if let Some(key) = &self.key {
            return Some(format!("key:{}", key.id));
        }
        self.user.as_ref().map(|u| format!("user:{}", u.id))
    }

    /// Tenant key for rate limiting.
    pub fn tenant_key(&self) -> Option<String> {
        if let Some(key) = &self.key {
            return Some(key.id.clone());
        }
        self.user.as_ref().map(|u| u.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_prefers_key() {
        let mut ctx = AuthContext::default();
        assert_eq!(ctx.subject(), None);
        ctx.user = Some(User::new("u1"));
        assert_eq!(ctx.subject(), Some("user:u1".into()));
        ctx.key = Some(ApiKey::new("k1", "h", "llmux_ab"));
        assert_eq!(ctx.subject(), Some("key:k1".into()));
    }
}
