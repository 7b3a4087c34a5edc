//! Admin HTTP surface and router assembly.
//!
//! Mounts the management endpoints under `/admin`, the model-listing route,
//! and stub invocation routes that the model-serving data plane replaces in
//! a full deployment. The middleware stack composes session → auth →
//! model-access → rate-limit → spend around everything; admin routes are
//! guarded by the same policy engine (management keys and proxy-admin
//! sessions hold `*` policies, viewers GET/HEAD).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditEvent;
use crate::credentials;
use crate::duration::{parse_duration, BudgetDuration};
use crate::errors::AppError;
use crate::invitations::{AcceptanceResult, CreateInvitation, InvitationService};
use crate::middleware::{auth, model_access, rate_limit, session, spend, AuthContext};
use crate::models::{
    ApiKey, AuditAction, Budget, KeyType, Organization, Team, User, UserRole,
};
use crate::sso::{SsoSyncConfig, SsoSyncer, SsoUserAttributes, SyncError, SyncResult};
use crate::store::{AuditFilter, KeyFilter, ListFilter};
use crate::AppState;

/// Build the full router with the middleware stack applied.
pub fn router(state: AppState) -> Router {
    // Authenticated non-admin users may accept invitations.
    for role in [
        UserRole::OrgAdmin,
        UserRole::InternalUser,
        UserRole::InternalUserViewer,
        UserRole::Team,
        UserRole::Customer,
    ] {
        let _ = state
            .enforcer
            .add_policy(&role.role_subject(), "/invitations/accept", "POST");
    }

    let admin = Router::new()
        .route("/keys", get(list_keys).post(generate_key))
        .route(
            "/keys/:id",
            get(get_key).patch(update_key).delete(delete_key),
        )
        .route("/keys/:id/block", post(block_key))
        .route("/keys/:id/unblock", post(unblock_key))
        .route("/teams", get(list_teams).post(create_team))
        .route("/teams/:id", axum::routing::delete(delete_team))
        .route("/users", get(list_users).post(create_user))
        .route("/orgs", get(list_orgs).post(create_org))
        .route("/budgets", get(list_budgets).post(create_budget))
        .route("/invitations", post(create_invitation))
        .route("/invitations/:id", axum::routing::delete(deactivate_invitation))
        .route("/audit", get(query_audit))
        .route("/audit/stats", get(audit_stats))
        .route("/sso/sync", post(sso_sync));

    // Layers run outermost-last: spend is applied first so it sits
    // innermost, session last so it sees the request first.
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(invocation_stub))
        .route("/v1/completions", post(invocation_stub))
        .route("/v1/embeddings", post(invocation_stub))
        .route("/embeddings", post(invocation_stub))
        .route("/invitations/accept", post(accept_invitation))
        .nest("/admin", admin)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            spend::spend_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            model_access::model_access_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            session::session_middleware,
        ))
        .with_state(state)
}

// ── Probes and model routes ──────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics() -> &'static str {
    // Metrics export is out of scope; the path exists so probes and the
    // skip list have something to point at.
    "ok\n"
}

/// Models visible to the caller: the key's allowed set, or `*`.
async fn list_models(
    ctx: Option<Extension<AuthContext>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let models: Vec<String> = match ctx.as_ref().and_then(|c| c.key.as_ref()) {
        Some(key) if !key.allowed_models.is_empty() => key.allowed_models.clone(),
        _ => vec!["*".to_string()],
    };
    let data: Vec<serde_json::Value> = models
        .iter()
        .map(|m| json!({"id": m, "object": "model"}))
        .collect();
    Ok(Json(json!({"object": "list", "data": data})))
}

/// The model-serving data plane mounts its proxy over these routes; the
/// core answers 200 so a deployment can exercise the full admission stack
/// (credentials, policy, model access, rate limits) end to end.
async fn invocation_stub(body: axum::body::Bytes) -> Json<serde_json::Value> {
    let model = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from));
    Json(json!({"status": "ok", "model": model}))
}

// ── Key management ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateKeyRequest {
    name: String,
    alias: Option<String>,
    user_id: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    /// "llm-api" | "management" | "read-only" | "default"
    key_type: Option<String>,
    #[serde(default)]
    allowed_models: Vec<String>,
    rpm_limit: Option<i64>,
    tpm_limit: Option<i64>,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    /// "" | "1d" | "7d" | "30d"
    budget_duration: Option<String>,
    /// Duration grammar, e.g. "30d"; empty or absent = never.
    expires_in: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct GeneratedKeyResponse {
    /// The full credential — shown exactly once.
    key: String,
    key_id: String,
    key_prefix: String,
    expires_at: Option<chrono::DateTime<Utc>>,
    budget_reset_at: Option<chrono::DateTime<Utc>>,
}

async fn generate_key(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<GenerateKeyRequest>,
) -> Result<(StatusCode, Json<GeneratedKeyResponse>), AppError> {
    let key_type = match req.key_type.as_deref() {
        None => KeyType::Default,
        Some(s) => KeyType::parse(s)
            .ok_or_else(|| AppError::Validation(format!("invalid key_type '{}'", s)))?,
    };
    let budget_duration = parse_budget_duration(req.budget_duration.as_deref())?;

    let now = Utc::now();
    let minted = credentials::mint(&state.config.credential_prefix);
    let mut key = ApiKey::new(Uuid::new_v4().to_string(), minted.hash, minted.display_prefix);
    key.name = req.name;
    key.alias = req.alias;
    key.user_id = req.user_id;
    key.team_id = req.team_id;
    key.org_id = req.org_id;
    key.key_type = key_type;
    key.allowed_models = req.allowed_models;
    key.rpm_limit = req.rpm_limit;
    key.tpm_limit = req.tpm_limit;
    key.max_budget = req.max_budget;
    key.soft_budget = req.soft_budget;
    key.budget_duration = budget_duration;
    key.budget_reset_at = budget_duration.next_reset(now);
    key.metadata = req.metadata;
    key.expires_at = match req.expires_in.as_deref() {
        None => None,
        Some(s) => parse_duration(s).map(|d| now + d),
    };

    state.store.insert_api_key(&key).await?;
    tracing::info!(
        key_id = %key.id,
        credential = %credentials::mask_credential(&minted.token),
        "api key minted"
    );

    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::KeyGenerated, "api_key", &key.id).before_after(
            None,
            Some(HashMap::from([
                ("name".to_string(), json!(key.name)),
                ("key_type".to_string(), json!(key.key_type.as_str())),
            ])),
        ),
    ));

    Ok((
        StatusCode::CREATED,
        Json(GeneratedKeyResponse {
            key: minted.token,
            key_id: key.id,
            key_prefix: key.key_prefix,
            expires_at: key.expires_at,
            budget_reset_at: key.budget_reset_at,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListKeysQuery {
    user_id: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    #[serde(default)]
    include_inactive: bool,
}

/// Listed keys never expose the hash; the display prefix stands in.
#[derive(Debug, Serialize)]
struct KeySummary {
    key_id: String,
    key_prefix: String,
    name: String,
    alias: Option<String>,
    key_type: KeyType,
    team_id: Option<String>,
    user_id: Option<String>,
    spend: f64,
    max_budget: Option<f64>,
    is_active: bool,
    blocked: bool,
    last_used_at: Option<chrono::DateTime<Utc>>,
}

impl From<ApiKey> for KeySummary {
    fn from(key: ApiKey) -> Self {
        KeySummary {
            key_id: key.id,
            key_prefix: key.key_prefix,
            name: key.name,
            alias: key.alias,
            key_type: key.key_type,
            team_id: key.team_id,
            user_id: key.user_id,
            spend: key.spend,
            max_budget: key.max_budget,
            is_active: key.is_active,
            blocked: key.blocked,
            last_used_at: key.last_used_at,
        }
    }
}

async fn list_keys(
    State(state): State<AppState>,
    Query(q): Query<ListKeysQuery>,
) -> Result<Json<Vec<KeySummary>>, AppError> {
    let keys = state
        .store
        .list_api_keys(&KeyFilter {
            user_id: q.user_id,
            team_id: q.team_id,
            org_id: q.org_id,
            key_type: None,
            include_inactive: q.include_inactive,
        })
        .await?;
    Ok(Json(keys.into_iter().map(KeySummary::from).collect()))
}

async fn get_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KeySummary>, AppError> {
    let key = state
        .store
        .get_api_key(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("api key".into()))?;
    Ok(Json(KeySummary::from(key)))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyRequest {
    name: Option<String>,
    allowed_models: Option<Vec<String>>,
    rpm_limit: Option<i64>,
    tpm_limit: Option<i64>,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    budget_duration: Option<String>,
    metadata: Option<HashMap<String, serde_json::Value>>,
}

async fn update_key(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateKeyRequest>,
) -> Result<Json<KeySummary>, AppError> {
    let mut key = state
        .store
        .get_api_key(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("api key".into()))?;

    let before = HashMap::from([
        ("name".to_string(), json!(key.name)),
        ("allowed_models".to_string(), json!(key.allowed_models)),
        ("max_budget".to_string(), json!(key.max_budget)),
    ]);

    if let Some(name) = req.name {
        key.name = name;
    }
    if let Some(models) = req.allowed_models {
        key.allowed_models = models;
    }
    if let Some(rpm) = req.rpm_limit {
        key.rpm_limit = Some(rpm);
    }
    if let Some(tpm) = req.tpm_limit {
        key.tpm_limit = Some(tpm);
    }
    if let Some(max) = req.max_budget {
        key.max_budget = Some(max);
    }
    if let Some(soft) = req.soft_budget {
        key.soft_budget = Some(soft);
    }
    if let Some(duration) = req.budget_duration.as_deref() {
        key.budget_duration = parse_budget_duration(Some(duration))?;
        key.budget_reset_at = key.budget_duration.next_reset(Utc::now());
    }
    if let Some(metadata) = req.metadata {
        key.metadata = metadata;
    }

    state.store.update_api_key(&key).await?;

    let after = HashMap::from([
        ("name".to_string(), json!(key.name)),
        ("allowed_models".to_string(), json!(key.allowed_models)),
        ("max_budget".to_string(), json!(key.max_budget)),
    ]);
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::KeyUpdated, "api_key", &key.id)
            .before_after(Some(before), Some(after)),
    ));

    Ok(Json(KeySummary::from(key)))
}

async fn delete_key(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store.delete_api_key(&id).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::KeyDeleted, "api_key", &id),
    ));
    Ok(StatusCode::NO_CONTENT)
}

async fn block_key(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    set_key_blocked(&state, &ctx, &id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unblock_key(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    set_key_blocked(&state, &ctx, &id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_key_blocked(
    state: &AppState,
    ctx: &Option<Extension<AuthContext>>,
    id: &str,
    blocked: bool,
) -> Result<(), AppError> {
    let mut key = state
        .store
        .get_api_key(id)
        .await?
        .ok_or_else(|| AppError::NotFound("api key".into()))?;
    let was = key.blocked;
    key.blocked = blocked;
    state.store.update_api_key(&key).await?;

    let action = if blocked {
        AuditAction::KeyBlocked
    } else {
        AuditAction::KeyUnblocked
    };
    state.audit.log(audited(
        ctx,
        AuditEvent::new(action, "api_key", id).before_after(
            Some(HashMap::from([("blocked".to_string(), json!(was))])),
            Some(HashMap::from([("blocked".to_string(), json!(blocked))])),
        ),
    ));
    Ok(())
}

// ── Teams / users / orgs / budgets ───────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateTeamRequest {
    id: Option<String>,
    alias: Option<String>,
    org_id: Option<String>,
    #[serde(default)]
    allowed_models: Vec<String>,
    rpm_limit: Option<i64>,
    tpm_limit: Option<i64>,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    budget_duration: Option<String>,
}

async fn create_team(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<CreateTeamRequest>,
) -> Result<(StatusCode, Json<Team>), AppError> {
    let budget_duration = parse_budget_duration(req.budget_duration.as_deref())?;
    let mut team = Team::new(req.id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    team.alias = req.alias;
    team.org_id = req.org_id;
    team.allowed_models = req.allowed_models;
    team.rpm_limit = req.rpm_limit;
    team.tpm_limit = req.tpm_limit;
    team.max_budget = req.max_budget;
    team.soft_budget = req.soft_budget;
    team.budget_duration = budget_duration;
    team.budget_reset_at = budget_duration.next_reset(Utc::now());

    state.store.insert_team(&team).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::TeamCreated, "team", &team.id),
    ));
    Ok((StatusCode::CREATED, Json(team)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    org_id: Option<String>,
    #[serde(default)]
    include_inactive: bool,
}

impl ListQuery {
    fn filter(self) -> ListFilter {
        ListFilter {
            org_id: self.org_id,
            include_inactive: self.include_inactive,
        }
    }
}

async fn list_teams(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Team>>, AppError> {
    Ok(Json(state.store.list_teams(&q.filter()).await?))
}

async fn delete_team(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.store.delete_team(&id).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::TeamDeleted, "team", &id),
    ));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    id: Option<String>,
    alias: Option<String>,
    email: Option<String>,
    /// "proxy_admin" | ... | "customer"
    role: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    max_budget: Option<f64>,
    budget_duration: Option<String>,
}

async fn create_user(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    let role = match req.role.as_deref() {
        None => UserRole::InternalUser,
        Some(s) => UserRole::parse(s)
            .ok_or_else(|| AppError::Validation(format!("invalid role '{}'", s)))?,
    };
    let budget_duration = parse_budget_duration(req.budget_duration.as_deref())?;

    let mut user = User::new(req.id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    user.alias = req.alias;
    user.email = req.email;
    user.role = role;
    user.team_id = req.team_id;
    user.org_id = req.org_id;
    user.max_budget = req.max_budget;
    user.budget_duration = budget_duration;
    user.budget_reset_at = budget_duration.next_reset(Utc::now());

    state.store.insert_user(&user).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::UserCreated, "user", &user.id),
    ));
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_users(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(state.store.list_users(&q.filter()).await?))
}

#[derive(Debug, Deserialize)]
struct CreateOrgRequest {
    id: Option<String>,
    alias: Option<String>,
    budget_id: Option<String>,
    #[serde(default)]
    allowed_models: Vec<String>,
}

async fn create_org(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<CreateOrgRequest>,
) -> Result<(StatusCode, Json<Organization>), AppError> {
    let mut org = Organization::new(req.id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    org.alias = req.alias;
    org.budget_id = req.budget_id;
    org.allowed_models = req.allowed_models;

    state.store.insert_organization(&org).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::OrgCreated, "organization", &org.id),
    ));
    Ok((StatusCode::CREATED, Json(org)))
}

async fn list_orgs(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Organization>>, AppError> {
    Ok(Json(state.store.list_organizations(&q.filter()).await?))
}

#[derive(Debug, Deserialize)]
struct CreateBudgetRequest {
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    max_parallel_requests: Option<i64>,
    budget_duration: Option<String>,
}

async fn create_budget(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<CreateBudgetRequest>,
) -> Result<(StatusCode, Json<Budget>), AppError> {
    let budget_duration = parse_budget_duration(req.budget_duration.as_deref())?;
    let mut budget = Budget::new(Uuid::new_v4().to_string());
    budget.max_budget = req.max_budget;
    budget.soft_budget = req.soft_budget;
    budget.max_parallel_requests = req.max_parallel_requests;
    budget.budget_duration = budget_duration;
    budget.budget_reset_at = budget_duration.next_reset(Utc::now());
    budget.created_by = actor_id(&ctx);

    state.store.insert_budget(&budget).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::BudgetCreated, "budget", &budget.id),
    ));
    Ok((StatusCode::CREATED, Json(budget)))
}

async fn list_budgets(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Budget>>, AppError> {
    Ok(Json(state.store.list_budgets(&q.filter()).await?))
}

// ── Invitations ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateInvitationRequest {
    team_id: Option<String>,
    org_id: Option<String>,
    role: Option<String>,
    #[serde(default)]
    max_uses: i64,
    /// Duration grammar, e.g. "24h".
    expires_in: Option<String>,
    budget_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreatedInvitationResponse {
    invitation_id: String,
    /// The invitation token — shown exactly once.
    token: String,
    team_id: Option<String>,
    org_id: Option<String>,
    expires_at: Option<chrono::DateTime<Utc>>,
    max_uses: i64,
}

async fn create_invitation(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<CreateInvitationRequest>,
) -> Result<(StatusCode, Json<CreatedInvitationResponse>), AppError> {
    let service = InvitationService::new(state.store.clone(), state.config.credential_prefix.clone());
    let (link, token) = service
        .create(CreateInvitation {
            team_id: req.team_id,
            org_id: req.org_id,
            role: req.role.unwrap_or_else(|| "member".into()),
            max_uses: req.max_uses,
            expires_in: req.expires_in.as_deref().and_then(parse_duration),
            budget_id: req.budget_id,
            created_by: actor_id(&ctx),
        })
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;

    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::InvitationCreated, "invitation", &link.id),
    ));

    Ok((
        StatusCode::CREATED,
        Json(CreatedInvitationResponse {
            invitation_id: link.id,
            token,
            team_id: link.team_id,
            org_id: link.org_id,
            expires_at: link.expires_at,
            max_uses: link.max_uses,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct AcceptInvitationRequest {
    token: String,
    /// Defaults to the authenticated user.
    user_id: Option<String>,
}

async fn accept_invitation(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<AcceptInvitationRequest>,
) -> Result<Json<AcceptanceResult>, AppError> {
    let user_id = req
        .user_id
        .or_else(|| {
            ctx.as_ref()
                .and_then(|c| c.user.as_ref().map(|u| u.id.clone()))
        })
        .ok_or_else(|| AppError::Validation("user_id is required".into()))?;

    let service = InvitationService::new(state.store.clone(), state.config.credential_prefix.clone());
    let result = service.accept(&req.token, &user_id).await?;

    let mut event = AuditEvent::new(
        AuditAction::InvitationAccepted,
        "invitation",
        result.team_id.clone().or(result.org_id.clone()).unwrap_or_default(),
    );
    if !result.success {
        event = event.failed(result.message.clone());
    }
    state.audit.log(audited(&ctx, event));

    Ok(Json(result))
}

async fn deactivate_invitation(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let service = InvitationService::new(state.store.clone(), state.config.credential_prefix.clone());
    service.deactivate(&id).await?;
    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::InvitationDeactivated, "invitation", &id),
    ));
    Ok(StatusCode::NO_CONTENT)
}

// ── SSO sync ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SsoSyncRequest {
    user_id: String,
    email: Option<String>,
    /// Internal role name resolved by the caller's role mapping.
    role: Option<String>,
    #[serde(default)]
    team_ids: Vec<String>,
    org_id: Option<String>,
}

/// Entry point for the external OIDC layer: after the token exchange it
/// posts the caller's attributes here and the core reconciles the tenant
/// graph.
async fn sso_sync(
    State(state): State<AppState>,
    ctx: Option<Extension<AuthContext>>,
    Json(req): Json<SsoSyncRequest>,
) -> Result<Json<SyncResult>, AppError> {
    let role = match req.role.as_deref() {
        None => None,
        Some(s) => Some(
            UserRole::parse(s).ok_or_else(|| AppError::Validation(format!("invalid role '{}'", s)))?,
        ),
    };

    let syncer = SsoSyncer::new(
        state.store.clone(),
        SsoSyncConfig {
            auto_create_users: state.config.sso_auto_create_users,
            sync_user_roles: state.config.sso_sync_roles,
            auto_create_teams: state.config.sso_auto_create_teams,
            remove_unlisted_teams: state.config.sso_remove_unlisted_teams,
            default_role: UserRole::InternalUser,
            default_org_id: None,
        },
    );

    let attrs = SsoUserAttributes {
        user_id: req.user_id.clone(),
        email: req.email,
        role,
        team_ids: req.team_ids,
        org_id: req.org_id,
    };

    let result = syncer.sync(&attrs).await.map_err(|e| match e {
        SyncError::UserNotFound(_) | SyncError::TeamNotFound(_) => {
            AppError::Validation(e.to_string())
        }
        SyncError::Store(e) => AppError::Internal(e),
    })?;

    state.audit.log(audited(
        &ctx,
        AuditEvent::new(AuditAction::SsoSynced, "user", &req.user_id),
    ));

    Ok(Json(result))
}

// ── Audit queries ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuditQuery {
    actor_id: Option<String>,
    action: Option<String>,
    object_type: Option<String>,
    object_id: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    success: Option<bool>,
    since: Option<chrono::DateTime<Utc>>,
    until: Option<chrono::DateTime<Utc>>,
    limit: Option<i64>,
}

impl AuditQuery {
    fn filter(self) -> Result<AuditFilter, AppError> {
        let action = match self.action.as_deref() {
            None => None,
            Some(s) => Some(
                serde_json::from_value::<AuditAction>(json!(s))
                    .map_err(|_| AppError::Validation(format!("unknown audit action '{}'", s)))?,
            ),
        };
        Ok(AuditFilter {
            actor_id: self.actor_id,
            action,
            object_type: self.object_type,
            object_id: self.object_id,
            team_id: self.team_id,
            org_id: self.org_id,
            success: self.success,
            since: self.since,
            until: self.until,
            limit: self.limit,
        })
    }
}

async fn query_audit(
    State(state): State<AppState>,
    Query(q): Query<AuditQuery>,
) -> Result<Json<Vec<crate::models::AuditLog>>, AppError> {
    Ok(Json(state.audit.query(&q.filter()?).await?))
}

async fn audit_stats(
    State(state): State<AppState>,
    Query(q): Query<AuditQuery>,
) -> Result<Json<crate::store::AuditStats>, AppError> {
    Ok(Json(state.audit.stats(&q.filter()?).await?))
}

// ── Helpers ──────────────────────────────────────────────────────

fn parse_budget_duration(s: Option<&str>) -> Result<BudgetDuration, AppError> {
    match s {
        None => Ok(BudgetDuration::Never),
        Some(s) => BudgetDuration::parse(s).map_err(AppError::Validation),
    }
}

fn actor_id(ctx: &Option<Extension<AuthContext>>) -> Option<String> {
    let ctx = ctx.as_ref()?;
    if let Some(key) = &ctx.key {
        return Some(key.id.clone());
    }
    ctx.user.as_ref().map(|u| u.id.clone())
}

/// Stamp the actor triple from the request context onto an audit event.
fn audited(ctx: &Option<Extension<AuthContext>>, mut event: AuditEvent) -> AuditEvent {
    match ctx.as_ref() {
        Some(ctx) => {
            if let Some(key) = &ctx.key {
                event.actor_id = key.id.clone();
                event.actor_type = "key".into();
            } else if let Some(user) = &ctx.user {
                event.actor_id = user.id.clone();
                event.actor_type = "user".into();
                event.actor_email = user.email.clone();
            }
        }
        None => {
            event.actor_id = "anonymous".into();
            event.actor_type = "system".into();
        }
    }
    event
}
