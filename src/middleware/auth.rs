//! Credential authentication pipeline.
//!
//! For every request that reaches it, this middleware:
//! 1. extracts the credential from `Authorization` (Bearer or raw);
//! 2. looks the key up by its hex SHA-256 digest;
//! 3. rejects unknown / inactive / blocked / expired keys (401);
//! 4. loads and checks the owning team when present (401);
//! 5. enforces route policy on (key, path, method) (403);
//! 6. advances `last_used_at` off the request path, at most once per
//!    configured interval;
//! 7. attaches an [`AuthContext`] with owned copies of key, team, user.
//!
//! Skipped paths, disabled auth, and already-authenticated requests pass
//! through untouched. Budget-over-cap is not an authentication failure;
//! soft-budget alerts surface during spend attribution.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};

use crate::credentials;
use crate::errors::AppError;
use crate::models::ApiKey;
use crate::AppState;

use super::AuthContext;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.config.auth_enabled {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    if state.config.skip_paths.iter().any(|p| p == &path) {
        return Ok(next.run(request).await);
    }

    // Another layer (e.g. the session middleware) already authenticated.
    // The identity is trusted as-is, but route policy still applies to it.
    if let Some(ctx) = request.extensions().get::<AuthContext>() {
        if let Some(subject) = ctx.subject() {
            let method = request.method().as_str().to_uppercase();
            if !state.enforcer.enforce(&subject, &path, &method)? {
                tracing::warn!(
                    subject = %subject,
                    path = %path,
                    method = %method,
                    "route policy denied"
                );
                return Err(AppError::PermissionDenied(format!(
                    "not permitted to {} {}",
                    method, path
                )));
            }
        }
        return Ok(next.run(request).await);
    }

    let token = extract_credential(request.headers())
        .ok_or_else(|| AppError::unauthorized("missing API key"))?;

    let hash = credentials::hash_credential(&token);
    let key = state
        .store
        .get_api_key_by_hash(&hash)
        .await?
        .ok_or_else(|| AppError::unauthorized("invalid API key"))?;

    let now = Utc::now();
    if !key.is_active {
        return Err(AppError::unauthorized("API key has been deleted"));
    }
    if key.blocked {
        return Err(AppError::unauthorized("API key is blocked"));
    }
    if key.is_expired(now) {
        return Err(AppError::unauthorized("API key has expired"));
    }

    let team = match &key.team_id {
        Some(team_id) => {
            let team = state
                .store
                .get_team(team_id)
                .await?
                .filter(|t| t.is_active)
                .ok_or_else(|| AppError::unauthorized("team not found"))?;
            if team.blocked {
                return Err(AppError::unauthorized("team is blocked"));
            }
            Some(team)
        }
        None => None,
    };

    // Map the key into the role graph, then enforce route policy.
    let subject = format!("key:{}", key.id);
    state
        .enforcer
        .add_grouping(&subject, key.key_type.role_subject())?;
    if let Some(team) = &team {
        state
            .enforcer
            .add_grouping(&subject, &format!("team:{}", team.id))?;
    }

    let method = request.method().as_str().to_uppercase();
    if !state.enforcer.enforce(&subject, &path, &method)? {
        tracing::warn!(
            key_id = %key.id,
            path = %path,
            method = %method,
            "route policy denied"
        );
        return Err(AppError::PermissionDenied(format!(
            "key is not permitted to {} {}",
            method, path
        )));
    }

    maybe_touch_last_used(&state, &key, now);

    let user = match &key.user_id {
        Some(user_id) => state.store.get_user(user_id).await?,
        None => None,
    };

    request.extensions_mut().insert(AuthContext {
        key: Some(key),
        team,
        user,
    });

    Ok(next.run(request).await)
}

/// Pull the credential out of `Authorization`. Accepts `Bearer <token>`
/// (preferred) or the raw token; outer whitespace is trimmed.
fn extract_credential(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?.trim();
    let token = match raw.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        None if raw.eq_ignore_ascii_case("bearer") => "",
        _ => raw,
    };
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Best-effort async `last_used_at` advance: at most once per configured
/// interval, bounded to 2 seconds, never blocking the request. A stored
/// timestamp in the future is left alone.
fn maybe_touch_last_used(state: &AppState, key: &ApiKey, now: DateTime<Utc>) {
    let interval = chrono::Duration::seconds(state.config.last_used_update_interval_secs);
    match key.last_used_at {
        Some(prev) if prev > now => return,
        Some(prev) if now - prev < interval => return,
        _ => {}
    }

    let store = state.store.clone();
    let key_id = key.id.clone();
    tokio::spawn(async move {
        let update = store.touch_key_last_used(&key_id, now);
        match tokio::time::timeout(std::time::Duration::from_secs(2), update).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(key_id = %key_id, "last_used_at update failed: {}", e),
            Err(_) => tracing::warn!(key_id = %key_id, "last_used_at update timed out"),
        }
    });
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(
            extract_credential(&headers("Bearer llmux_abc")).as_deref(),
            Some("llmux_abc")
        );
        assert_eq!(
            extract_credential(&headers("bearer llmux_abc")).as_deref(),
            Some("llmux_abc")
        );
    }

    #[test]
    fn test_extract_raw_token() {
        assert_eq!(
            extract_credential(&headers("llmux_abc")).as_deref(),
            Some("llmux_abc")
        );
    }

    #[test]
    fn test_extract_trims_whitespace() {
        assert_eq!(
            extract_credential(&headers("  Bearer   llmux_abc  ")).as_deref(),
            Some("llmux_abc")
        );
    }

    #[test]
    fn test_extract_rejects_empty() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static(""));
        assert_eq!(extract_credential(&h), None);
        assert_eq!(extract_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn test_extract_bearer_with_empty_token() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_credential(&h), None);
    }
}
