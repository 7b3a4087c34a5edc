//! Caching client for the IdP's userinfo endpoint.
//!
//! Responses are cached per access token with a short TTL. The cache is
//! hard-capped; crossing the cap evicts everything, which is acceptable
//! because entries are cheap to refetch. Expired entries are pruned on
//! access and by the explicit sweep.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;

const MAX_CACHE_ENTRIES: usize = 1000;
const FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TTL_SECS: i64 = 300;

/// Standard claims plus the raw claim map for custom lookups.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub sub: String,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub name: Option<String>,
    pub preferred_username: Option<String>,
    /// Group/role claim values, when the IdP includes them.
    pub groups: Vec<String>,
    pub raw: Value,
}

impl UserInfo {
    fn from_raw(raw: Value) -> anyhow::Result<Self> {
        let sub = raw
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("userinfo response missing 'sub'"))?
            .to_string();
        let groups = raw
            .get("groups")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        Ok(UserInfo {
            sub,
            email: raw.get("email").and_then(|v| v.as_str()).map(String::from),
            email_verified: raw.get("email_verified").and_then(|v| v.as_bool()),
            name: raw.get("name").and_then(|v| v.as_str()).map(String::from),
            preferred_username: raw
                .get("preferred_username")
                .and_then(|v| v.as_str())
                .map(String::from),
            groups,
            raw,
        })
    }
}

struct CachedInfo {
    info: UserInfo,
    fetched_at: DateTime<Utc>,
}

/// Access-token-keyed userinfo cache over an HTTP client.
pub struct UserInfoClient {
    http: reqwest::Client,
    endpoint: String,
    cache: DashMap<String, CachedInfo>,
    ttl: Duration,
}

impl UserInfoClient {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_ttl(endpoint, DEFAULT_TTL_SECS)
    }

    pub fn with_ttl(endpoint: impl Into<String>, ttl_secs: i64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()?;
        Ok(UserInfoClient {
            http,
            endpoint: endpoint.into(),
            cache: DashMap::new(),
            ttl: Duration::seconds(ttl_secs),
        })
    }

    /// Resolve userinfo for an access token, hitting the IdP only on a
    /// cache miss. A non-200 upstream answer is an error.
    pub async fn get(&self, access_token: &str) -> anyhow::Result<UserInfo> {
        let now = Utc::now();

        if let Some(entry) = self.cache.get(access_token) {
            if now - entry.fetched_at < self.ttl {
                return Ok(entry.info.clone());
            }
        }
        self.cache
            .remove_if(access_token, |_, v| now - v.fetched_at >= self.ttl);

        let response = self
            .http
            .get(&self.endpoint)
            .bearer_auth(access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "userinfo endpoint returned {} for {}",
                response.status(),
                self.endpoint
            );
        }

        let raw: Value = response.json().await?;
        let info = UserInfo::from_raw(raw)?;

        // Entries are cheap to refetch; crossing the cap drops the lot
        // rather than tracking recency.
        if self.cache.len() >= MAX_CACHE_ENTRIES {
            tracing::warn!(
                entries = self.cache.len(),
                "userinfo cache over capacity, evicting all entries"
            );
            self.cache.clear();
        }

        self.cache.insert(
            access_token.to_string(),
            CachedInfo {
                info: info.clone(),
                fetched_at: now,
            },
        );

        Ok(info)
    }

    /// Drop every expired entry. Callable; not timer-driven.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let ttl = self.ttl;
        let before = self.cache.len();
        self.cache.retain(|_, v| now - v.fetched_at < ttl);
        before - self.cache.len()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn userinfo_body() -> serde_json::Value {
        serde_json::json!({
            "sub": "idp|u1",
            "email": "u1@example.com",
            "email_verified": true,
            "name": "User One",
            "groups": ["idp-engineers"],
            "custom:tenant": "acme"
        })
    }

    #[tokio::test]
    async fn test_fetch_and_parse() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(userinfo_body()))
            .mount(&server)
            .await;

        let client = UserInfoClient::new(format!("{}/userinfo", server.uri())).unwrap();
        let info = client.get("tok-1").await.unwrap();
        assert_eq!(info.sub, "idp|u1");
        assert_eq!(info.email.as_deref(), Some("u1@example.com"));
        assert_eq!(info.groups, vec!["idp-engineers".to_string()]);
        // Custom claims stay reachable through the raw map.
        assert_eq!(info.raw["custom:tenant"], "acme");
    }

    #[tokio::test]
    async fn test_second_lookup_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(userinfo_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = UserInfoClient::new(format!("{}/userinfo", server.uri())).unwrap();
        client.get("tok-1").await.unwrap();
        client.get("tok-1").await.unwrap();
        assert_eq!(client.cached_entries(), 1);
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = UserInfoClient::new(format!("{}/userinfo", server.uri())).unwrap();
        assert!(client.get("bad-token").await.is_err());
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_expired_entries_swept() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(userinfo_body()))
            .mount(&server)
            .await;

        let client = UserInfoClient::with_ttl(format!("{}/userinfo", server.uri()), 0).unwrap();
        client.get("tok-1").await.unwrap();
        assert_eq!(client.sweep(), 1);
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn test_missing_sub_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"email": "x@y.z"})))
            .mount(&server)
            .await;

        let client = UserInfoClient::new(format!("{}/userinfo", server.uri())).unwrap();
        assert!(client.get("tok-1").await.is_err());
    }
}
