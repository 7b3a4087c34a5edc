//! End-to-end scenarios over the composed router.
//!
//! Each test builds the full middleware stack (session → auth →
//! model-access → rate-limit → spend) over an in-memory store and drives
//! it with real HTTP requests. Both positive (admitted) and negative
//! (refused, with the right status and error type) paths are covered.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use tower::ServiceExt;

use llmux::config::Config;
use llmux::credentials;
use llmux::duration::BudgetDuration;
use llmux::jobs::reconcile::ReconcileScheduler;
use llmux::middleware::session::{SessionClaims, SessionCodec};
use llmux::models::{ApiKey, KeyType, Team, User, UserRole};
use llmux::store::memory::MemoryStore;
use llmux::AppState;

struct Harness {
    state: AppState,
    router: Router,
}

fn harness_with_config(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store, config);
    let router = llmux::api::router(state.clone());
    Harness { state, router }
}

fn harness() -> Harness {
    harness_with_config(Config::default())
}

/// Insert a key of the given type and return its plaintext credential.
async fn seed_key(state: &AppState, key_type: KeyType, mutate: impl FnOnce(&mut ApiKey)) -> (String, String) {
    let minted = credentials::mint("llmux_");
    let mut key = ApiKey::new(
        uuid::Uuid::new_v4().to_string(),
        minted.hash.clone(),
        minted.display_prefix.clone(),
    );
    key.name = "test-key".into();
    key.key_type = key_type;
    mutate(&mut key);
    state.store.insert_api_key(&key).await.unwrap();
    (key.id, minted.token)
}

fn chat_request(token: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn error_type(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    json["error"]["type"].as_str().unwrap_or_default().to_string()
}

// ── Scenario 1: happy path ──────────────────────────────────────

#[tokio::test]
async fn test_happy_path_llm_api_key() {
    let h = harness();
    let (key_id, token) = seed_key(&h.state, KeyType::LlmApi, |_| {}).await;

    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4","messages":[]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // last_used_at advances asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let key = h.state.store.get_api_key(&key_id).await.unwrap().unwrap();
    assert!(key.last_used_at.is_some());

    // A second request inside the update interval leaves the stamp alone.
    let first_stamp = key.last_used_at;
    h.router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let key = h.state.store.get_api_key(&key_id).await.unwrap().unwrap();
    assert_eq!(key.last_used_at, first_stamp);
}

// ── Scenario 2: read-only keys ──────────────────────────────────

#[tokio::test]
async fn test_read_only_key_denied_on_completions() {
    let h = harness();
    let (_, token) = seed_key(&h.state, KeyType::ReadOnly, |_| {}).await;

    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_type(response).await, "permission_error");

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ── Scenario 3: model access ────────────────────────────────────

#[tokio::test]
async fn test_model_access_enforcement() {
    let h = harness();
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |k| {
        k.allowed_models = vec!["gpt-4".into()];
    })
    .await;

    let denied = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"claude-3"}"#))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_type(denied).await, "permission_error");

    let allowed = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unrestricted_key_may_use_any_model() {
    let h = harness();
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |_| {}).await;

    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"claude-3-opus"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ── Scenario 4: rate limiting ───────────────────────────────────

#[tokio::test]
async fn test_rate_limit_burst_and_tenant_isolation() {
    let config = Config {
        force_default_burst: true,
        default_burst: 2,
        default_rpm: 60,
        ..Default::default()
    };
    let h = harness_with_config(config);
    let (_, token_a) = seed_key(&h.state, KeyType::LlmApi, |k| k.rpm_limit = Some(60)).await;
    let (_, token_b) = seed_key(&h.state, KeyType::LlmApi, |k| k.rpm_limit = Some(60)).await;

    let body = r#"{"model":"gpt-4"}"#;
    for _ in 0..2 {
        let ok = h
            .router
            .clone()
            .oneshot(chat_request(&token_a, body))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    let limited = h
        .router
        .clone()
        .oneshot(chat_request(&token_a, body))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        limited.headers().get("retry-after").unwrap().to_str().unwrap(),
        "60"
    );
    assert_eq!(error_type(limited).await, "rate_limit_error");

    // Tenant B has its own bucket.
    let other = h
        .router
        .clone()
        .oneshot(chat_request(&token_b, body))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_team_bucket_gates_before_key_bucket() {
    let config = Config {
        force_default_burst: true,
        default_burst: 1,
        default_rpm: 60,
        ..Default::default()
    };
    let h = harness_with_config(config);

    let mut team = Team::new("team-rl");
    team.rpm_limit = Some(60);
    h.state.store.insert_team(&team).await.unwrap();

    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |k| {
        k.team_id = Some("team-rl".into());
        k.rpm_limit = Some(600);
    })
    .await;

    let body = r#"{"model":"gpt-4"}"#;
    let first = h.router.clone().oneshot(chat_request(&token, body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // The team bucket (burst 1) refuses even though the key's own limit
    // has plenty of headroom.
    let second = h.router.clone().oneshot(chat_request(&token, body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ── Scenario 5: budget reset keeps keys usable ──────────────────

#[tokio::test]
async fn test_budget_reset_then_key_remains_usable() {
    let h = harness();
    let now = Utc::now();
    let (key_id, token) = seed_key(&h.state, KeyType::LlmApi, |k| {
        k.max_budget = Some(100.0);
        k.spend = 90.0;
        k.budget_duration = BudgetDuration::Daily;
        k.budget_reset_at = Some(now - ChronoDuration::hours(1));
    })
    .await;

    let scheduler = ReconcileScheduler::new(
        h.state.store.clone(),
        h.state.audit.clone(),
        "llmux_",
        std::time::Duration::from_secs(3600),
    );
    let report = scheduler.run_cycle().await;
    assert_eq!(report.keys_reset, 1);

    let key = h.state.store.get_api_key(&key_id).await.unwrap().unwrap();
    assert_eq!(key.spend, 0.0);
    let next = key.budget_reset_at.unwrap();
    assert!((next - (now + ChronoDuration::hours(24))).num_seconds().abs() < 60);

    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ── Scenario 6: invitations through the admin surface ───────────

#[tokio::test]
async fn test_invitation_flow_end_to_end() {
    let h = harness();
    let (_, admin_token) = seed_key(&h.state, KeyType::Management, |_| {}).await;
    h.state
        .store
        .insert_team(&Team::new("T"))
        .await
        .unwrap();
    h.state.store.insert_user(&User::new("U")).await.unwrap();

    // Create the invitation.
    let create = Request::builder()
        .method("POST")
        .uri("/admin/invitations")
        .header(header::AUTHORIZATION, format!("Bearer {}", admin_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            r#"{"team_id":"T","role":"member","max_uses":10,"expires_in":"24h"}"#,
        ))
        .unwrap();
    let response = h.router.clone().oneshot(create).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let token = created["token"].as_str().unwrap().to_string();

    // Accept it for user U.
    let accept_body = serde_json::json!({"token": token, "user_id": "U"}).to_string();
    let accept = |body: String, auth: String| {
        Request::builder()
            .method("POST")
            .uri("/invitations/accept")
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    };

    let response = h
        .router
        .clone()
        .oneshot(accept(accept_body.clone(), format!("Bearer {}", admin_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let result: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(result["success"], true);
    assert!(h
        .state
        .store
        .get_team_membership("U", "T")
        .await
        .unwrap()
        .is_some());

    // Accepting again succeeds without duplicating the membership.
    let response = h
        .router
        .clone()
        .oneshot(accept(accept_body, format!("Bearer {}", admin_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // An unknown token is a graceful failure, not a 500.
    let bogus = serde_json::json!({"token": "llmux_bogus", "user_id": "U"}).to_string();
    let response = h
        .router
        .clone()
        .oneshot(accept(bogus, format!("Bearer {}", admin_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let result: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(result["success"], false);
}

// ── 401 matrix ──────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_credential_is_401() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from(r#"{"model":"gpt-4"}"#))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_type(response).await, "authentication_error");
}

#[tokio::test]
async fn test_unknown_credential_is_401() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(chat_request("llmux_not-a-real-key", r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_credential_is_401() {
    let h = harness();
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |k| {
        k.expires_at = Some(Utc::now() - ChronoDuration::minutes(1));
    })
    .await;
    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_blocked_credential_is_401() {
    let h = harness();
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |k| k.blocked = true).await;
    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_soft_deleted_credential_is_401() {
    let h = harness();
    let (key_id, token) = seed_key(&h.state, KeyType::LlmApi, |_| {}).await;
    h.state.store.delete_api_key(&key_id).await.unwrap();
    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_blocked_team_is_401() {
    let h = harness();
    let mut team = Team::new("blocked-team");
    team.blocked = true;
    h.state.store.insert_team(&team).await.unwrap();
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |k| {
        k.team_id = Some("blocked-team".into());
    })
    .await;
    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ── Skip list, oversize bodies, admin guard ─────────────────────

#[tokio::test]
async fn test_health_skips_authentication() {
    let h = harness();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_oversize_model_body_is_413() {
    let config = Config {
        max_body_bytes: 256,
        ..Default::default()
    };
    let h = harness_with_config(config);
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |_| {}).await;

    let padding = "x".repeat(1024);
    let body = format!(r#"{{"model":"gpt-4","padding":"{}"}}"#, padding);
    let response = h
        .router
        .clone()
        .oneshot(chat_request(&token, &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_llm_key_cannot_reach_admin_routes() {
    let h = harness();
    let (_, token) = seed_key(&h.state, KeyType::LlmApi, |_| {}).await;
    let request = Request::builder()
        .uri("/admin/keys")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_management_key_generates_keys_via_admin_api() {
    let h = harness();
    let (_, admin_token) = seed_key(&h.state, KeyType::Management, |_| {}).await;

    let request = Request::builder()
        .method("POST")
        .uri("/admin/keys")
        .header(header::AUTHORIZATION, format!("Bearer {}", admin_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            r#"{"name":"ci-key","key_type":"llm-api","allowed_models":["gpt-4"],"budget_duration":"1d"}"#,
        ))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let new_token = created["key"].as_str().unwrap();
    assert!(new_token.starts_with("llmux_"));

    // The minted key immediately authenticates and is model-restricted.
    let ok = h
        .router
        .clone()
        .oneshot(chat_request(new_token, r#"{"model":"gpt-4"}"#))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let denied = h
        .router
        .clone()
        .oneshot(chat_request(new_token, r#"{"model":"o3"}"#))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_budget_duration_is_validation_error() {
    let h = harness();
    let (_, admin_token) = seed_key(&h.state, KeyType::Management, |_| {}).await;
    let request = Request::builder()
        .method("POST")
        .uri("/admin/keys")
        .header(header::AUTHORIZATION, format!("Bearer {}", admin_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"name":"bad","budget_duration":"2w"}"#))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── Sessions ────────────────────────────────────────────────────

fn session_cookie(codec: &SessionCodec, name: &str, role: UserRole, expires_in: ChronoDuration) -> String {
    let now = Utc::now();
    let claims = SessionClaims {
        user_id: "session-user".into(),
        email: Some("admin@example.com".into()),
        role,
        team_id: None,
        team_ids: vec![],
        org_id: None,
        end_user_id: None,
        sso_user_id: None,
        issued_at: now,
        expires_at: now + expires_in,
    };
    format!("{}={}", name, codec.seal(&claims).unwrap())
}

#[tokio::test]
async fn test_admin_session_reaches_admin_routes() {
    let h = harness();
    let cookie = session_cookie(
        &h.state.session,
        &h.state.config.session_cookie_name,
        UserRole::ProxyAdmin,
        ChronoDuration::hours(1),
    );
    let request = Request::builder()
        .uri("/admin/keys")
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_expired_session_cookie_falls_through_to_401() {
    let h = harness();
    let cookie = session_cookie(
        &h.state.session,
        &h.state.config.session_cookie_name,
        UserRole::ProxyAdmin,
        ChronoDuration::seconds(-10),
    );
    let request = Request::builder()
        .uri("/admin/keys")
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    // No session context, no credential: the auth middleware refuses.
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_garbage_session_cookie_is_cleared() {
    let h = harness();
    let request = Request::builder()
        .uri("/health")
        .header(
            header::COOKIE,
            format!("{}=corrupted-value", h.state.config.session_cookie_name),
        )
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("broken cookie should be cleared")
        .to_str()
        .unwrap();
    assert!(set_cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn test_viewer_session_is_read_only() {
    let h = harness();
    let cookie = session_cookie(
        &h.state.session,
        &h.state.config.session_cookie_name,
        UserRole::ProxyAdminViewer,
        ChronoDuration::hours(1),
    );

    let get = Request::builder()
        .uri("/admin/keys")
        .header(header::COOKIE, cookie.clone())
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        h.router.clone().oneshot(get).await.unwrap().status(),
        StatusCode::OK
    );

    let post = Request::builder()
        .method("POST")
        .uri("/admin/keys")
        .header(header::COOKIE, cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"name":"nope"}"#))
        .unwrap();
    assert_eq!(
        h.router.clone().oneshot(post).await.unwrap().status(),
        StatusCode::FORBIDDEN
    );
}

// ── SSO sync through the admin surface ──────────────────────────

#[tokio::test]
async fn test_sso_sync_creates_user_and_reports_warnings() {
    let h = harness();
    let (_, admin_token) = seed_key(&h.state, KeyType::Management, |_| {}).await;

    // One team exists; the other will surface as a warning because team
    // auto-create is off by default.
    h.state.store.insert_team(&Team::new("t-exists")).await.unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/admin/sso/sync")
        .header(header::AUTHORIZATION, format!("Bearer {}", admin_token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            r#"{"user_id":"idp-u1","email":"u1@example.com","team_ids":["t-exists","t-missing"]}"#,
        ))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let result: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(result["user_created"], true);
    assert_eq!(result["teams_added"], serde_json::json!(["t-exists"]));
    assert_eq!(result["warnings"].as_array().unwrap().len(), 1);

    let user = h.state.store.get_user("idp-u1").await.unwrap().unwrap();
    assert_eq!(user.email.as_deref(), Some("u1@example.com"));
    assert!(h
        .state
        .store
        .get_team_membership("idp-u1", "t-exists")
        .await
        .unwrap()
        .is_some());
}

// ── Auth disabled passes everything through ─────────────────────

#[tokio::test]
async fn test_auth_disabled_passes_through() {
    let config = Config {
        auth_enabled: false,
        ..Default::default()
    };
    let h = harness_with_config(config);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"model":"gpt-4"}"#))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
