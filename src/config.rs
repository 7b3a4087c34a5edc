use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    /// Postgres DSN. Unset = in-memory store.
    pub database_url: Option<String>,
    /// Redis DSN for the distributed rate limiter. Unset = in-process buckets.
    pub redis_url: Option<String>,

    /// Secret behind the session cookie seal. SHA-256 of this string is the
    /// AES-256-GCM key.
    pub session_secret: String,
    pub session_cookie_name: String,
    pub oidc_state_cookie_name: String,
    pub cookie_secure: bool,
    /// "Strict" | "Lax" | "None". Default: Lax.
    pub cookie_same_site: String,
    /// Session lifetime in seconds. Default: 24h.
    pub session_ttl_secs: i64,
    /// OIDC handshake state lifetime in seconds. Default: 10 minutes.
    pub oidc_state_ttl_secs: i64,

    /// Prefix prepended to minted credentials, e.g. "llmux_".
    pub credential_prefix: String,

    /// Master switch; when false every request passes through.
    pub auth_enabled: bool,
    /// Paths that bypass authentication entirely (health/metrics probes).
    pub skip_paths: Vec<String>,
    /// Floor between two `last_used_at` writes for the same key, seconds.
    pub last_used_update_interval_secs: i64,

    /// Default per-tenant requests per minute when a key has no rpm limit.
    pub default_rpm: u32,
    /// When true, every bucket gets the default burst instead of rpm/6.
    pub force_default_burst: bool,
    /// Burst used when `force_default_burst` is set.
    pub default_burst: u32,
    /// Idle buckets are dropped after this many seconds; the sweeper runs
    /// at half this interval.
    pub rate_limit_ttl_secs: u64,

    /// Background reconciliation wake-up interval, seconds. Default: 1h.
    pub reconcile_interval_secs: u64,

    pub audit_enabled: bool,

    /// IdP userinfo endpoint for SSO session enrichment.
    pub userinfo_endpoint: Option<String>,

    // Per-operation gates for SSO sync.
    pub sso_auto_create_users: bool,
    pub sso_sync_roles: bool,
    pub sso_auto_create_teams: bool,
    pub sso_remove_unlisted_teams: bool,

    /// Cap on request bodies parsed for the model-access check.
    pub max_body_bytes: usize,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let session_secret = std::env::var("LLMUX_SESSION_SECRET")
        .unwrap_or_else(|_| "CHANGE_ME_SESSION_SECRET".into());

    if session_secret == "CHANGE_ME_SESSION_SECRET" {
        let env_mode = std::env::var("LLMUX_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "LLMUX_SESSION_SECRET is still the insecure placeholder. \
                 Set a proper secret before running in production."
            );
        }
        eprintln!("⚠️  LLMUX_SESSION_SECRET is not set — using insecure placeholder. Set a real secret for production.");
    }

    Ok(Config {
        port: std::env::var("LLMUX_PORT")
            .unwrap_or_else(|_| "8443".into())
            .parse()
            .unwrap_or(8443),
        database_url: std::env::var("DATABASE_URL").ok(),
        redis_url: std::env::var("REDIS_URL").ok(),
        session_secret,
        session_cookie_name: std::env::var("LLMUX_SESSION_COOKIE")
            .unwrap_or_else(|_| "llmux_session".into()),
        oidc_state_cookie_name: std::env::var("LLMUX_OIDC_STATE_COOKIE")
            .unwrap_or_else(|_| "llmux_oidc_state".into()),
        cookie_secure: env_bool("LLMUX_COOKIE_SECURE", false),
        cookie_same_site: std::env::var("LLMUX_COOKIE_SAME_SITE")
            .unwrap_or_else(|_| "Lax".into()),
        session_ttl_secs: env_parse("LLMUX_SESSION_TTL_SECS", 86_400),
        oidc_state_ttl_secs: env_parse("LLMUX_OIDC_STATE_TTL_SECS", 600),
        credential_prefix: std::env::var("LLMUX_CREDENTIAL_PREFIX")
            .unwrap_or_else(|_| "llmux_".into()),
        auth_enabled: env_bool("LLMUX_AUTH_ENABLED", true),
        skip_paths: std::env::var("LLMUX_SKIP_PATHS")
            .unwrap_or_else(|_| "/health,/metrics".into())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        last_used_update_interval_secs: env_parse("LLMUX_LAST_USED_INTERVAL_SECS", 60),
        default_rpm: env_parse("LLMUX_DEFAULT_RPM", 600),
        force_default_burst: env_bool("LLMUX_FORCE_DEFAULT_BURST", false),
        default_burst: env_parse("LLMUX_DEFAULT_BURST", 100),
        rate_limit_ttl_secs: env_parse("LLMUX_RATE_LIMIT_TTL_SECS", 3600),
        reconcile_interval_secs: env_parse("LLMUX_RECONCILE_INTERVAL_SECS", 3600),
        audit_enabled: env_bool("LLMUX_AUDIT_ENABLED", true),
        userinfo_endpoint: std::env::var("LLMUX_USERINFO_ENDPOINT").ok(),
        sso_auto_create_users: env_bool("LLMUX_SSO_AUTO_CREATE_USERS", true),
        sso_sync_roles: env_bool("LLMUX_SSO_SYNC_ROLES", false),
        sso_auto_create_teams: env_bool("LLMUX_SSO_AUTO_CREATE_TEAMS", false),
        sso_remove_unlisted_teams: env_bool("LLMUX_SSO_REMOVE_UNLISTED_TEAMS", false),
        max_body_bytes: env_parse("LLMUX_MAX_BODY_BYTES", 10 * 1024 * 1024),
    })
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Test-friendly defaults; the binary always goes through [`load`].
    fn default() -> Self {
        Config {
            port: 8443,
            database_url: None,
            redis_url: None,
            session_secret: "test-secret".into(),
            session_cookie_name: "llmux_session".into(),
            oidc_state_cookie_name: "llmux_oidc_state".into(),
            cookie_secure: false,
            cookie_same_site: "Lax".into(),
            session_ttl_secs: 86_400,
            oidc_state_ttl_secs: 600,
            credential_prefix: "llmux_".into(),
            auth_enabled: true,
            skip_paths: vec!["/health".into(), "/metrics".into()],
            last_used_update_interval_secs: 60,
            default_rpm: 600,
            force_default_burst: false,
            default_burst: 100,
            rate_limit_ttl_secs: 3600,
            reconcile_interval_secs: 3600,
            audit_enabled: true,
            userinfo_endpoint: None,
            sso_auto_create_users: true,
            sso_sync_roles: false,
            sso_auto_create_teams: false,
            sso_remove_unlisted_teams: false,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}
