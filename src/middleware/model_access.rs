//! Model access control — model-level enforcement on invocation routes.
//!
//! After route policy admits a request, POSTs to the model-invocation
//! routes get a second check: the body is parsed (under a size cap) to
//! extract the `model` field, the caller's `allowed_models` are synced
//! into the policy engine as `p(subject, model:<m>, use)` entries (empty
//! set ⇒ `model:*`), and `(subject, model:<name>, use)` is enforced.
//!
//! Pattern semantics follow the engine's object glob: exact match or a
//! trailing `*` prefix match, so `"gpt-4*"` admits `gpt-4o-mini`.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::errors::AppError;
use crate::AppState;

use super::engine::{self, ACTION_USE};
use super::AuthContext;

pub async fn model_access_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_uppercase();
    if !engine::is_model_invocation(&path, &method) {
        return Ok(next.run(request).await);
    }

    // No context means auth is disabled or the path is skipped; nothing to
    // restrict against.
    let Some(ctx) = request.extensions().get::<AuthContext>().cloned() else {
        return Ok(next.run(request).await);
    };
    let Some(subject) = ctx.subject() else {
        return Ok(next.run(request).await);
    };

    // Buffer the body under the parse cap; oversize is 413.
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| AppError::PayloadTooLarge)?;

    if let Some(model) = extract_model(&bytes) {
        if let Some(key) = &ctx.key {
            state
                .enforcer
                .sync_model_policies(&format!("key:{}", key.id), &key.allowed_models)?;
        }
        if let Some(team) = &ctx.team {
            if !team.allowed_models.is_empty() {
                state
                    .enforcer
                    .sync_model_policies(&format!("team:{}", team.id), &team.allowed_models)?;
            }
        }

        let object = format!("model:{}", model);
        if !state.enforcer.enforce(&subject, &object, ACTION_USE)? {
            tracing::warn!(subject = %subject, model = %model, "model access denied");
            return Err(AppError::PermissionDenied(format!(
                "not permitted to use model '{}'",
                model
            )));
        }
    }

    // Hand the buffered body onward untouched.
    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// Pull the `model` field out of a JSON request body. Non-JSON bodies and
/// bodies without a string `model` are not model requests.
fn extract_model(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    value.get("model")?.as_str().map(String::from)
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_model() {
        let body = br#"{"model":"gpt-4","messages":[]}"#;
        assert_eq!(extract_model(body).as_deref(), Some("gpt-4"));
    }

    #[test]
    fn test_extract_model_absent() {
        assert_eq!(extract_model(br#"{"messages":[]}"#), None);
        assert_eq!(extract_model(br#"{"model":42}"#), None);
        assert_eq!(extract_model(b"not json"), None);
        assert_eq!(extract_model(b""), None);
    }
}
