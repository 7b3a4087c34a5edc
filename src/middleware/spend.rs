//! Post-response spend attribution.
//!
//! The data plane records what a served request cost by attaching a
//! [`UsageAttribution`] extension to its response. This middleware picks it
//! up after the handler returns, fans the amount out across the ledger
//! levels (key, team, user, organization, end user, memberships), and
//! inserts a [`UsageLog`] row. Everything happens off the request path and
//! is best-effort: failures are logged, never surfaced to the caller.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use crate::models::UsageLog;
use crate::AppState;

use super::AuthContext;

/// What a served request consumed. Attached as a response extension by the
/// handler once upstream usage is known.
#[derive(Debug, Clone)]
pub struct UsageAttribution {
    pub model: String,
    pub provider: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Dollars.
    pub spend: f64,
    /// Downstream customer from the request's `user` parameter.
    pub end_user_id: Option<String>,
    pub cache_hit: bool,
    pub tags: Vec<String>,
}

pub async fn spend_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let ctx = request.extensions().get::<AuthContext>().cloned();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let started_at = Utc::now();

    let response = next.run(request).await;

    let attribution = response.extensions().get::<UsageAttribution>().cloned();
    if let (Some(ctx), Some(attr)) = (ctx, attribution) {
        let Some(key) = ctx.key.clone() else {
            return response;
        };

        let ended_at = Utc::now();
        let mut usage = UsageLog::new(request_id, key.id.clone(), attr.model.clone());
        usage.user_id = key.user_id.clone();
        usage.team_id = key.team_id.clone();
        usage.org_id = key.org_id.clone().or_else(|| {
            ctx.team.as_ref().and_then(|t| t.org_id.clone())
        });
        usage.end_user_id = attr.end_user_id.clone();
        usage.provider = attr.provider.clone();
        usage.prompt_tokens = attr.prompt_tokens;
        usage.completion_tokens = attr.completion_tokens;
        usage.total_tokens = attr.prompt_tokens + attr.completion_tokens;
        usage.spend = attr.spend;
        usage.latency_ms = (ended_at - started_at).num_milliseconds();
        usage.status = response.status().as_u16() as i32;
        usage.cache_hit = attr.cache_hit;
        usage.tags = attr.tags.clone();
        usage.started_at = started_at;
        usage.ended_at = ended_at;

        let state = state.clone();
        tokio::spawn(async move {
            record_usage(&state, &ctx, &usage).await;
        });
    }

    response
}

/// Fan one usage record out across the spend ledger. Each level is
/// independent; a failing level is logged and the rest still land.
pub async fn record_usage(state: &AppState, ctx: &AuthContext, usage: &UsageLog) {
    let store = &state.store;
    let model = Some(usage.model.as_str());
    let amount = usage.spend;

    if let Err(e) = store.add_key_spend(&usage.api_key_id, model, amount).await {
        tracing::error!(key_id = %usage.api_key_id, "key spend attribution failed: {}", e);
    }

    // Soft budgets alert; they never block.
    if let Some(key) = &ctx.key {
        if let Some(soft) = key.soft_budget {
            if key.spend + amount >= soft {
                tracing::warn!(
                    key_id = %key.id,
                    spend = key.spend + amount,
                    soft_budget = soft,
                    "key soft budget reached"
                );
            }
        }
    }

    if let Some(team_id) = &usage.team_id {
        if let Err(e) = store.add_team_spend(team_id, model, amount).await {
            tracing::error!(team_id = %team_id, "team spend attribution failed: {}", e);
        }
    }

    if let Some(user_id) = &usage.user_id {
        if let Err(e) = store.add_user_spend(user_id, model, amount).await {
            tracing::error!(user_id = %user_id, "user spend attribution failed: {}", e);
        }
        if let Some(team_id) = &usage.team_id {
            if let Err(e) = store.add_team_membership_spend(user_id, team_id, amount).await {
                tracing::error!(
                    user_id = %user_id,
                    team_id = %team_id,
                    "membership spend attribution failed: {}",
                    e
                );
            }
        }
    }

    if let Some(org_id) = &usage.org_id {
        if let Err(e) = store.add_org_spend(org_id, model, amount).await {
            tracing::error!(org_id = %org_id, "org spend attribution failed: {}", e);
        }
    }

    if let Some(end_user_id) = &usage.end_user_id {
        if let Err(e) = store.add_end_user_spend(end_user_id, amount).await {
            tracing::error!(end_user = %end_user_id, "end-user spend attribution failed: {}", e);
        }
    }

    if let Err(e) = store.insert_usage_log(usage).await {
        tracing::error!(request_id = %usage.request_id, "usage log insert failed: {}", e);
    }
}

// ── Tests ───────────────────────────────────────────────────────
