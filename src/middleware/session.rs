//! Sealed-cookie sessions.
//!
//! A symmetric AES-256-GCM seal (key = SHA-256 of the configured secret)
//! carries an authenticated user session between browser and server. The
//! cookie value is `base64url(nonce || ciphertext || tag)` with a fresh
//! 12-byte nonce per write. A parallel "OIDC state" cookie holds the CSRF
//! state, nonce, PKCE verifier, and post-login redirect for the duration
//! of the auth handshake.
//!
//! The session middleware sits ahead of the credential pipeline: it
//! resolves a valid cookie into an [`AuthContext`] carrying a synthetic
//! `User`, and passes through silently when the cookie is absent, expired,
//! or invalid (clearing it in the latter cases).

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{User, UserRole};
use crate::AppState;

use super::AuthContext;

const NONCE_LEN: usize = 12;

/// Session payload sealed into the cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: String,
    pub email: Option<String>,
    pub role: UserRole,
    pub team_id: Option<String>,
    pub team_ids: Vec<String>,
    pub org_id: Option<String>,
    pub end_user_id: Option<String>,
    pub sso_user_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionClaims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// OIDC handshake state sealed into its own short-lived cookie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcStateClaims {
    pub state: String,
    pub nonce: String,
    pub pkce_verifier: String,
    pub redirect_to: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Authenticated-encryption codec for cookie payloads.
pub struct SessionCodec {
    cipher: Aes256Gcm,
}

impl SessionCodec {
    /// Key is derived by SHA-256 of the configured secret.
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).expect("SHA-256 digest is a valid AES-256 key");
        SessionCodec { cipher }
    }

    /// Seal a payload: JSON → AES-GCM with a fresh nonce → base64url.
    pub fn seal<T: Serialize>(&self, payload: &T) -> anyhow::Result<String> {
        let plaintext = serde_json::to_vec(payload)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|e| anyhow::anyhow!("cookie seal failed: {}", e))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        use base64::Engine;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Open a sealed value. Any tampering or key mismatch fails.
    pub fn open<T: DeserializeOwned>(&self, value: &str) -> anyhow::Result<T> {
        use base64::Engine;
        let sealed = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| anyhow::anyhow!("cookie decode failed: {}", e))?;

        if sealed.len() <= NONCE_LEN {
            anyhow::bail!("cookie too short");
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| anyhow::anyhow!("cookie open failed: {}", e))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

// ── Cookie plumbing ──────────────────────────────────────────────

/// Cookie attributes shared by the session and OIDC-state cookies.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    pub secure: bool,
    /// "Strict" | "Lax" | "None".
    pub same_site: String,
}

impl Default for CookieOptions {
    fn default() -> Self {
        CookieOptions {
            secure: false,
            same_site: "Lax".into(),
        }
    }
}

/// Build a `Set-Cookie` value. Cookies are always HttpOnly; Max-Age is
/// derived from the payload's expiry by the caller.
pub fn build_cookie(name: &str, value: &str, max_age_secs: i64, opts: &CookieOptions) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite={}; Max-Age={}",
        name,
        value,
        opts.same_site,
        max_age_secs.max(0)
    );
    if opts.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// A `Set-Cookie` value that deletes the named cookie.
pub fn clear_cookie(name: &str, opts: &CookieOptions) -> String {
    build_cookie(name, "", 0, opts)
}

/// Extract a cookie value from the request headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let raw = header.to_str().ok()?;
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

// ── Middleware ───────────────────────────────────────────────────

/// Resolve a session cookie into an auth context. Absent, expired, or
/// invalid cookies pass through; broken ones are cleared on the way out.
pub async fn session_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<AuthContext>().is_some() {
        return next.run(request).await;
    }

    let cookie_name = state.config.session_cookie_name.clone();
    let Some(value) = read_cookie(request.headers(), &cookie_name) else {
        return next.run(request).await;
    };

    let claims = match state.session.open::<SessionClaims>(&value) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::debug!("discarding undecodable session cookie: {}", e);
            return with_cleared_cookie(next.run(request).await, &state, &cookie_name);
        }
    };

    if claims.is_expired(Utc::now()) {
        return with_cleared_cookie(next.run(request).await, &state, &cookie_name);
    }

    let user = synthetic_user(&claims);

    // Map the session user into the role graph so admin routes enforce
    // uniformly over keys and sessions.
    if let Err(e) = state
        .enforcer
        .add_grouping(&format!("user:{}", user.id), &user.role.role_subject())
    {
        tracing::error!("session role grouping failed: {}", e);
        return next.run(request).await;
    }

    request.extensions_mut().insert(AuthContext {
        key: None,
        team: None,
        user: Some(user),
    });

    next.run(request).await
}

fn synthetic_user(claims: &SessionClaims) -> User {
    let mut user = User::new(claims.user_id.clone());
    user.email = claims.email.clone();
    user.role = claims.role;
    user.team_id = claims.team_id.clone();
    user.teams = claims.team_ids.clone();
    user.org_id = claims.org_id.clone();
    user
}

fn with_cleared_cookie(mut response: Response, state: &AppState, name: &str) -> Response {
    let opts = CookieOptions {
        secure: state.config.cookie_secure,
        same_site: state.config.cookie_same_site.clone(),
    };
    if let Ok(header) = HeaderValue::from_str(&clear_cookie(name, &opts)) {
        response.headers_mut().append(SET_COOKIE, header);
    }
    response
}

// ── Tests ───────────────────────────────────────────────────────
