//! Postgres store backend.
//!
//! Maps and slices live in JSONB columns; every operation round-trips a
//! semantically equivalent entity to the in-memory backend. Spend
//! accumulation is an atomic `SET spend = spend + $n` at the database
//! level, and the active-key hash/alias uniqueness is enforced by partial
//! unique indexes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::duration::BudgetDuration;
use crate::models::audit::FieldChange;
use crate::models::{
    ApiKey, AuditAction, AuditLog, Budget, EndUser, InvitationLink, KeyType, Organization,
    OrganizationMembership, Team, TeamMembership, UsageLog, User, UserRole,
};

use super::{
    AuditFilter, AuditStats, GatewayStore, KeyFilter, ListFilter, MembershipFilter, UsageFilter,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

// ── JSON column helpers ──────────────────────────────────────────

fn vec_string(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn map_f64(value: &Value) -> std::collections::HashMap<String, f64> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default()
}

fn map_i64(value: &Value) -> std::collections::HashMap<String, i64> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_i64().map(|i| (k.clone(), i)))
                .collect()
        })
        .unwrap_or_default()
}

fn map_value(value: &Value) -> std::collections::HashMap<String, Value> {
    value
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn json(value: impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn parse_action(s: &str) -> AuditAction {
    serde_json::from_value(Value::String(s.to_string())).unwrap_or(AuditAction::ConfigUpdated)
}

// ── Row types ────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: String,
    key_hash: String,
    key_prefix: String,
    name: String,
    alias: Option<String>,
    user_id: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    key_type: String,
    allowed_models: Value,
    tpm_limit: Option<i64>,
    rpm_limit: Option<i64>,
    model_tpm_limit: Value,
    model_rpm_limit: Value,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    model_max_budget: Value,
    spend: f64,
    model_spend: Value,
    budget_duration: String,
    budget_reset_at: Option<DateTime<Utc>>,
    metadata: Value,
    is_active: bool,
    blocked: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            name: row.name,
            alias: row.alias,
            user_id: row.user_id,
            team_id: row.team_id,
            org_id: row.org_id,
            key_type: KeyType::parse(&row.key_type).unwrap_or_default(),
            allowed_models: vec_string(&row.allowed_models),
            tpm_limit: row.tpm_limit,
            rpm_limit: row.rpm_limit,
            model_tpm_limit: map_i64(&row.model_tpm_limit),
            model_rpm_limit: map_i64(&row.model_rpm_limit),
            max_budget: row.max_budget,
            soft_budget: row.soft_budget,
            model_max_budget: map_f64(&row.model_max_budget),
            spend: row.spend,
            model_spend: map_f64(&row.model_spend),
            budget_duration: BudgetDuration::parse(&row.budget_duration).unwrap_or_default(),
            budget_reset_at: row.budget_reset_at,
            metadata: map_value(&row.metadata),
            is_active: row.is_active,
            blocked: row.blocked,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TeamRow {
    id: String,
    alias: Option<String>,
    org_id: Option<String>,
    allowed_models: Value,
    tpm_limit: Option<i64>,
    rpm_limit: Option<i64>,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    model_max_budget: Value,
    spend: f64,
    model_spend: Value,
    budget_duration: String,
    budget_reset_at: Option<DateTime<Utc>>,
    metadata: Value,
    is_active: bool,
    blocked: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TeamRow> for Team {
    fn from(row: TeamRow) -> Self {
        Team {
            id: row.id,
            alias: row.alias,
            org_id: row.org_id,
            allowed_models: vec_string(&row.allowed_models),
            tpm_limit: row.tpm_limit,
            rpm_limit: row.rpm_limit,
            max_budget: row.max_budget,
            soft_budget: row.soft_budget,
            model_max_budget: map_f64(&row.model_max_budget),
            spend: row.spend,
            model_spend: map_f64(&row.model_spend),
            budget_duration: BudgetDuration::parse(&row.budget_duration).unwrap_or_default(),
            budget_reset_at: row.budget_reset_at,
            metadata: map_value(&row.metadata),
            is_active: row.is_active,
            blocked: row.blocked,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    alias: Option<String>,
    email: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    teams: Value,
    role: String,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    model_max_budget: Value,
    spend: f64,
    model_spend: Value,
    budget_duration: String,
    budget_reset_at: Option<DateTime<Utc>>,
    metadata: Value,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            alias: row.alias,
            email: row.email,
            team_id: row.team_id,
            org_id: row.org_id,
            teams: vec_string(&row.teams),
            role: UserRole::parse(&row.role).unwrap_or_default(),
            max_budget: row.max_budget,
            soft_budget: row.soft_budget,
            model_max_budget: map_f64(&row.model_max_budget),
            spend: row.spend,
            model_spend: map_f64(&row.model_spend),
            budget_duration: BudgetDuration::parse(&row.budget_duration).unwrap_or_default(),
            budget_reset_at: row.budget_reset_at,
            metadata: map_value(&row.metadata),
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: String,
    alias: Option<String>,
    budget_id: Option<String>,
    allowed_models: Value,
    spend: f64,
    model_spend: Value,
    metadata: Value,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            id: row.id,
            alias: row.alias,
            budget_id: row.budget_id,
            allowed_models: vec_string(&row.allowed_models),
            spend: row.spend,
            model_spend: map_f64(&row.model_spend),
            metadata: map_value(&row.metadata),
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TeamMembershipRow {
    user_id: String,
    team_id: String,
    role: String,
    spend: f64,
    budget_id: Option<String>,
    joined_at: DateTime<Utc>,
}

impl From<TeamMembershipRow> for TeamMembership {
    fn from(row: TeamMembershipRow) -> Self {
        TeamMembership {
            user_id: row.user_id,
            team_id: row.team_id,
            role: row.role,
            spend: row.spend,
            budget_id: row.budget_id,
            joined_at: row.joined_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OrganizationMembershipRow {
    user_id: String,
    org_id: String,
    role: String,
    spend: f64,
    budget_id: Option<String>,
    joined_at: DateTime<Utc>,
}

impl From<OrganizationMembershipRow> for OrganizationMembership {
    fn from(row: OrganizationMembershipRow) -> Self {
        OrganizationMembership {
            user_id: row.user_id,
            org_id: row.org_id,
            role: row.role,
            spend: row.spend,
            budget_id: row.budget_id,
            joined_at: row.joined_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EndUserRow {
    user_id: String,
    alias: Option<String>,
    spend: f64,
    budget_id: Option<String>,
    blocked: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EndUserRow> for EndUser {
    fn from(row: EndUserRow) -> Self {
        EndUser {
            user_id: row.user_id,
            alias: row.alias,
            spend: row.spend,
            budget_id: row.budget_id,
            blocked: row.blocked,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BudgetRow {
    id: String,
    max_budget: Option<f64>,
    soft_budget: Option<f64>,
    max_parallel_requests: Option<i64>,
    model_max_budget: Value,
    budget_duration: String,
    budget_reset_at: Option<DateTime<Utc>>,
    created_by: Option<String>,
    updated_by: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BudgetRow> for Budget {
    fn from(row: BudgetRow) -> Self {
        Budget {
            id: row.id,
            max_budget: row.max_budget,
            soft_budget: row.soft_budget,
            max_parallel_requests: row.max_parallel_requests,
            model_max_budget: map_f64(&row.model_max_budget),
            budget_duration: BudgetDuration::parse(&row.budget_duration).unwrap_or_default(),
            budget_reset_at: row.budget_reset_at,
            created_by: row.created_by,
            updated_by: row.updated_by,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
    id: String,
    token_hash: String,
    team_id: Option<String>,
    org_id: Option<String>,
    role: String,
    max_uses: i64,
    current_uses: i64,
    budget_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    is_active: bool,
    created_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<InvitationRow> for InvitationLink {
    fn from(row: InvitationRow) -> Self {
        InvitationLink {
            id: row.id,
            token_hash: row.token_hash,
            team_id: row.team_id,
            org_id: row.org_id,
            role: row.role,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            budget_id: row.budget_id,
            expires_at: row.expires_at,
            is_active: row.is_active,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AuditLogRow {
    id: String,
    timestamp: DateTime<Utc>,
    actor_id: String,
    actor_type: String,
    actor_email: Option<String>,
    actor_ip: Option<String>,
    action: String,
    object_type: String,
    object_id: String,
    team_id: Option<String>,
    org_id: Option<String>,
    before: Option<Value>,
    after: Option<Value>,
    diff: Value,
    request_id: Option<String>,
    user_agent: Option<String>,
    uri: Option<String>,
    success: bool,
    error: Option<String>,
    metadata: Value,
}

impl From<AuditLogRow> for AuditLog {
    fn from(row: AuditLogRow) -> Self {
        let diff: std::collections::HashMap<String, FieldChange> =
            serde_json::from_value(row.diff).unwrap_or_default();
        AuditLog {
            id: row.id,
            timestamp: row.timestamp,
            actor_id: row.actor_id,
            actor_type: row.actor_type,
            actor_email: row.actor_email,
            actor_ip: row.actor_ip,
            action: parse_action(&row.action),
            object_type: row.object_type,
            object_id: row.object_id,
            team_id: row.team_id,
            org_id: row.org_id,
            before: row.before.as_ref().map(map_value),
            after: row.after.as_ref().map(map_value),
            diff,
            request_id: row.request_id,
            user_agent: row.user_agent,
            uri: row.uri,
            success: row.success,
            error: row.error,
            metadata: map_value(&row.metadata),
        }
    }
}

#[derive(sqlx::FromRow)]
struct UsageLogRow {
    id: String,
    request_id: String,
    api_key_id: String,
    user_id: Option<String>,
    team_id: Option<String>,
    org_id: Option<String>,
    end_user_id: Option<String>,
    model: String,
    provider: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    spend: f64,
    latency_ms: i64,
    status: i32,
    cache_hit: bool,
    tags: Value,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl From<UsageLogRow> for UsageLog {
    fn from(row: UsageLogRow) -> Self {
        UsageLog {
            id: row.id,
            request_id: row.request_id,
            api_key_id: row.api_key_id,
            user_id: row.user_id,
            team_id: row.team_id,
            org_id: row.org_id,
            end_user_id: row.end_user_id,
            model: row.model,
            provider: row.provider,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            total_tokens: row.total_tokens,
            spend: row.spend,
            latency_ms: row.latency_ms,
            status: row.status,
            cache_hit: row.cache_hit,
            tags: vec_string(&row.tags),
            started_at: row.started_at,
            ended_at: row.ended_at,
        }
    }
}

// ── Contract implementation ──────────────────────────────────────

#[async_trait]
impl GatewayStore for PgStore {
    // ── API keys ────────────────────────────────────────────────

    async fn insert_api_key(&self, key: &ApiKey) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO api_keys (
                id, key_hash, key_prefix, name, alias, user_id, team_id, org_id,
                key_type, allowed_models, tpm_limit, rpm_limit, model_tpm_limit,
                model_rpm_limit, max_budget, soft_budget, model_max_budget, spend,
                model_spend, budget_duration, budget_reset_at, metadata, is_active,
                blocked, created_at, updated_at, expires_at, last_used_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28
            )"#,
        )
        .bind(&key.id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(&key.alias)
        .bind(&key.user_id)
        .bind(&key.team_id)
        .bind(&key.org_id)
        .bind(key.key_type.as_str())
        .bind(json(&key.allowed_models))
        .bind(key.tpm_limit)
        .bind(key.rpm_limit)
        .bind(json(&key.model_tpm_limit))
        .bind(json(&key.model_rpm_limit))
        .bind(key.max_budget)
        .bind(key.soft_budget)
        .bind(json(&key.model_max_budget))
        .bind(key.spend)
        .bind(json(&key.model_spend))
        .bind(key.budget_duration.as_str())
        .bind(key.budget_reset_at)
        .bind(json(&key.metadata))
        .bind(key.is_active)
        .bind(key.blocked)
        .bind(key.created_at)
        .bind(key.updated_at)
        .bind(key.expires_at)
        .bind(key.last_used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_api_key(&self, id: &str) -> anyhow::Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE key_hash = $1 AND is_active = true",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn get_api_key_by_alias(&self, alias: &str) -> anyhow::Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT * FROM api_keys WHERE alias = $1 AND is_active = true",
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn list_api_keys(&self, filter: &KeyFilter) -> anyhow::Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            r#"SELECT * FROM api_keys
               WHERE (is_active = true OR $1)
                 AND ($2::text IS NULL OR user_id = $2)
                 AND ($3::text IS NULL OR team_id = $3)
                 AND ($4::text IS NULL OR org_id = $4)
                 AND ($5::text IS NULL OR key_type = $5)
               ORDER BY created_at ASC"#,
        )
        .bind(filter.include_inactive)
        .bind(&filter.user_id)
        .bind(&filter.team_id)
        .bind(&filter.org_id)
        .bind(filter.key_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    async fn update_api_key(&self, key: &ApiKey) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE api_keys SET
                name = $2, alias = $3, user_id = $4, team_id = $5, org_id = $6,
                key_type = $7, allowed_models = $8, tpm_limit = $9, rpm_limit = $10,
                model_tpm_limit = $11, model_rpm_limit = $12, max_budget = $13,
                soft_budget = $14, model_max_budget = $15, budget_duration = $16,
                budget_reset_at = $17, metadata = $18, is_active = $19, blocked = $20,
                expires_at = $21, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(&key.id)
        .bind(&key.name)
        .bind(&key.alias)
        .bind(&key.user_id)
        .bind(&key.team_id)
        .bind(&key.org_id)
        .bind(key.key_type.as_str())
        .bind(json(&key.allowed_models))
        .bind(key.tpm_limit)
        .bind(key.rpm_limit)
        .bind(json(&key.model_tpm_limit))
        .bind(json(&key.model_rpm_limit))
        .bind(key.max_budget)
        .bind(key.soft_budget)
        .bind(json(&key.model_max_budget))
        .bind(key.budget_duration.as_str())
        .bind(key.budget_reset_at)
        .bind(json(&key.metadata))
        .bind(key.is_active)
        .bind(key.blocked)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("api key {} not found", key.id);
        }
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> anyhow::Result<()> {
        let result =
            sqlx::query("UPDATE api_keys SET is_active = false, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("api key {} not found", id);
        }
        Ok(())
    }

    async fn touch_key_last_used(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE api_keys SET last_used_at = $2
               WHERE id = $1 AND (last_used_at IS NULL OR last_used_at < $2)"#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_key_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE api_keys SET
                spend = spend + $2,
                model_spend = CASE WHEN $3::text IS NULL THEN model_spend
                    ELSE jsonb_set(model_spend, ARRAY[$3],
                        to_jsonb(COALESCE((model_spend->>$3)::double precision, 0) + $2))
                END,
                updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(amount)
        .bind(model)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("api key {} not found", id);
        }
        Ok(())
    }

    async fn reset_key_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE api_keys SET spend = 0, model_spend = '{}'::jsonb,
                budget_reset_at = $2, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(next_reset)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("api key {} not found", id);
        }
        Ok(())
    }

    async fn keys_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ApiKey>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            r#"SELECT * FROM api_keys
               WHERE is_active = true AND budget_reset_at IS NOT NULL AND budget_reset_at <= $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    // ── Teams ───────────────────────────────────────────────────

    async fn insert_team(&self, team: &Team) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO teams (
                id, alias, org_id, allowed_models, tpm_limit, rpm_limit, max_budget,
                soft_budget, model_max_budget, spend, model_spend, budget_duration,
                budget_reset_at, metadata, is_active, blocked, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"#,
        )
        .bind(&team.id)
        .bind(&team.alias)
        .bind(&team.org_id)
        .bind(json(&team.allowed_models))
        .bind(team.tpm_limit)
        .bind(team.rpm_limit)
        .bind(team.max_budget)
        .bind(team.soft_budget)
        .bind(json(&team.model_max_budget))
        .bind(team.spend)
        .bind(json(&team.model_spend))
        .bind(team.budget_duration.as_str())
        .bind(team.budget_reset_at)
        .bind(json(&team.metadata))
        .bind(team.is_active)
        .bind(team.blocked)
        .bind(team.created_at)
        .bind(team.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_team(&self, id: &str) -> anyhow::Result<Option<Team>> {
        let row = sqlx::query_as::<_, TeamRow>("SELECT * FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Team::from))
    }

    async fn list_teams(&self, filter: &ListFilter) -> anyhow::Result<Vec<Team>> {
        let rows = sqlx::query_as::<_, TeamRow>(
            r#"SELECT * FROM teams
               WHERE (is_active = true OR $1) AND ($2::text IS NULL OR org_id = $2)
               ORDER BY created_at ASC"#,
        )
        .bind(filter.include_inactive)
        .bind(&filter.org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Team::from).collect())
    }

    async fn update_team(&self, team: &Team) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE teams SET
                alias = $2, org_id = $3, allowed_models = $4, tpm_limit = $5,
                rpm_limit = $6, max_budget = $7, soft_budget = $8, model_max_budget = $9,
                budget_duration = $10, budget_reset_at = $11, metadata = $12,
                is_active = $13, blocked = $14, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(&team.id)
        .bind(&team.alias)
        .bind(&team.org_id)
        .bind(json(&team.allowed_models))
        .bind(team.tpm_limit)
        .bind(team.rpm_limit)
        .bind(team.max_budget)
        .bind(team.soft_budget)
        .bind(json(&team.model_max_budget))
        .bind(team.budget_duration.as_str())
        .bind(team.budget_reset_at)
        .bind(json(&team.metadata))
        .bind(team.is_active)
        .bind(team.blocked)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("team {} not found", team.id);
        }
        Ok(())
    }

    async fn delete_team(&self, id: &str) -> anyhow::Result<()> {
        let result =
            sqlx::query("UPDATE teams SET is_active = false, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("team {} not found", id);
        }
        Ok(())
    }

    async fn add_team_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE teams SET
                spend = spend + $2,
                model_spend = CASE WHEN $3::text IS NULL THEN model_spend
                    ELSE jsonb_set(model_spend, ARRAY[$3],
                        to_jsonb(COALESCE((model_spend->>$3)::double precision, 0) + $2))
                END,
                updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(amount)
        .bind(model)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("team {} not found", id);
        }
        Ok(())
    }

    async fn reset_team_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE teams SET spend = 0, model_spend = '{}'::jsonb,
                budget_reset_at = $2, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(next_reset)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("team {} not found", id);
        }
        Ok(())
    }

    async fn teams_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Team>> {
        let rows = sqlx::query_as::<_, TeamRow>(
            r#"SELECT * FROM teams
               WHERE is_active = true AND budget_reset_at IS NOT NULL AND budget_reset_at <= $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Team::from).collect())
    }

    // ── Users ───────────────────────────────────────────────────

    async fn insert_user(&self, user: &User) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO users (
                id, alias, email, team_id, org_id, teams, role, max_budget,
                soft_budget, model_max_budget, spend, model_spend, budget_duration,
                budget_reset_at, metadata, is_active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"#,
        )
        .bind(&user.id)
        .bind(&user.alias)
        .bind(&user.email)
        .bind(&user.team_id)
        .bind(&user.org_id)
        .bind(json(&user.teams))
        .bind(user.role.as_str())
        .bind(user.max_budget)
        .bind(user.soft_budget)
        .bind(json(&user.model_max_budget))
        .bind(user.spend)
        .bind(json(&user.model_spend))
        .bind(user.budget_duration.as_str())
        .bind(user.budget_reset_at)
        .bind(json(&user.metadata))
        .bind(user.is_active)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(User::from))
    }

    async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE email = $1 AND is_active = true LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn list_users(&self, filter: &ListFilter) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"SELECT * FROM users
               WHERE (is_active = true OR $1) AND ($2::text IS NULL OR org_id = $2)
               ORDER BY created_at ASC"#,
        )
        .bind(filter.include_inactive)
        .bind(&filter.org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn update_user(&self, user: &User) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE users SET
                alias = $2, email = $3, team_id = $4, org_id = $5, teams = $6,
                role = $7, max_budget = $8, soft_budget = $9, model_max_budget = $10,
                budget_duration = $11, budget_reset_at = $12, metadata = $13,
                is_active = $14, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(&user.id)
        .bind(&user.alias)
        .bind(&user.email)
        .bind(&user.team_id)
        .bind(&user.org_id)
        .bind(json(&user.teams))
        .bind(user.role.as_str())
        .bind(user.max_budget)
        .bind(user.soft_budget)
        .bind(json(&user.model_max_budget))
        .bind(user.budget_duration.as_str())
        .bind(user.budget_reset_at)
        .bind(json(&user.metadata))
        .bind(user.is_active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("user {} not found", user.id);
        }
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> anyhow::Result<()> {
        let result =
            sqlx::query("UPDATE users SET is_active = false, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("user {} not found", id);
        }
        Ok(())
    }

    async fn add_user_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE users SET
                spend = spend + $2,
                model_spend = CASE WHEN $3::text IS NULL THEN model_spend
                    ELSE jsonb_set(model_spend, ARRAY[$3],
                        to_jsonb(COALESCE((model_spend->>$3)::double precision, 0) + $2))
                END,
                updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(amount)
        .bind(model)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("user {} not found", id);
        }
        Ok(())
    }

    async fn reset_user_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE users SET spend = 0, model_spend = '{}'::jsonb,
                budget_reset_at = $2, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(next_reset)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("user {} not found", id);
        }
        Ok(())
    }

    async fn users_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"SELECT * FROM users
               WHERE is_active = true AND budget_reset_at IS NOT NULL AND budget_reset_at <= $1"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    // ── Organizations ───────────────────────────────────────────

    async fn insert_organization(&self, org: &Organization) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO organizations (
                id, alias, budget_id, allowed_models, spend, model_spend, metadata,
                is_active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(&org.id)
        .bind(&org.alias)
        .bind(&org.budget_id)
        .bind(json(&org.allowed_models))
        .bind(org.spend)
        .bind(json(&org.model_spend))
        .bind(json(&org.metadata))
        .bind(org.is_active)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_organization(&self, id: &str) -> anyhow::Result<Option<Organization>> {
        let row = sqlx::query_as::<_, OrganizationRow>("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Organization::from))
    }

    async fn list_organizations(&self, filter: &ListFilter) -> anyhow::Result<Vec<Organization>> {
        let rows = sqlx::query_as::<_, OrganizationRow>(
            "SELECT * FROM organizations WHERE (is_active = true OR $1) ORDER BY created_at ASC",
        )
        .bind(filter.include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Organization::from).collect())
    }

    async fn update_organization(&self, org: &Organization) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE organizations SET
                alias = $2, budget_id = $3, allowed_models = $4, metadata = $5,
                is_active = $6, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(&org.id)
        .bind(&org.alias)
        .bind(&org.budget_id)
        .bind(json(&org.allowed_models))
        .bind(json(&org.metadata))
        .bind(org.is_active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("organization {} not found", org.id);
        }
        Ok(())
    }

    async fn delete_organization(&self, id: &str) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE organizations SET is_active = false, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("organization {} not found", id);
        }
        Ok(())
    }

    async fn add_org_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE organizations SET
                spend = spend + $2,
                model_spend = CASE WHEN $3::text IS NULL THEN model_spend
                    ELSE jsonb_set(model_spend, ARRAY[$3],
                        to_jsonb(COALESCE((model_spend->>$3)::double precision, 0) + $2))
                END,
                updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(amount)
        .bind(model)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("organization {} not found", id);
        }
        Ok(())
    }

    // ── Memberships ─────────────────────────────────────────────

    async fn insert_team_membership(&self, m: &TeamMembership) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO team_memberships (user_id, team_id, role, spend, budget_id, joined_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&m.user_id)
        .bind(&m.team_id)
        .bind(&m.role)
        .bind(m.spend)
        .bind(&m.budget_id)
        .bind(m.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_team_membership(&self, user_id: &str, team_id: &str) -> anyhow::Result<Option<TeamMembership>> {
        let row = sqlx::query_as::<_, TeamMembershipRow>(
            "SELECT * FROM team_memberships WHERE user_id = $1 AND team_id = $2",
        )
        .bind(user_id)
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TeamMembership::from))
    }

    async fn list_team_memberships(&self, filter: &MembershipFilter) -> anyhow::Result<Vec<TeamMembership>> {
        let rows = sqlx::query_as::<_, TeamMembershipRow>(
            r#"SELECT * FROM team_memberships
               WHERE ($1::text IS NULL OR user_id = $1) AND ($2::text IS NULL OR team_id = $2)
               ORDER BY joined_at ASC"#,
        )
        .bind(&filter.user_id)
        .bind(&filter.scope_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TeamMembership::from).collect())
    }

    async fn delete_team_membership(&self, user_id: &str, team_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM team_memberships WHERE user_id = $1 AND team_id = $2")
            .bind(user_id)
            .bind(team_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_team_membership_spend(&self, user_id: &str, team_id: &str, amount: f64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE team_memberships SET spend = spend + $3 WHERE user_id = $1 AND team_id = $2",
        )
        .bind(user_id)
        .bind(team_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_org_membership(&self, m: &OrganizationMembership) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO organization_memberships (user_id, org_id, role, spend, budget_id, joined_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&m.user_id)
        .bind(&m.org_id)
        .bind(&m.role)
        .bind(m.spend)
        .bind(&m.budget_id)
        .bind(m.joined_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_org_membership(&self, user_id: &str, org_id: &str) -> anyhow::Result<Option<OrganizationMembership>> {
        let row = sqlx::query_as::<_, OrganizationMembershipRow>(
            "SELECT * FROM organization_memberships WHERE user_id = $1 AND org_id = $2",
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(OrganizationMembership::from))
    }

    async fn list_org_memberships(&self, filter: &MembershipFilter) -> anyhow::Result<Vec<OrganizationMembership>> {
        let rows = sqlx::query_as::<_, OrganizationMembershipRow>(
            r#"SELECT * FROM organization_memberships
               WHERE ($1::text IS NULL OR user_id = $1) AND ($2::text IS NULL OR org_id = $2)
               ORDER BY joined_at ASC"#,
        )
        .bind(&filter.user_id)
        .bind(&filter.scope_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OrganizationMembership::from).collect())
    }

    async fn delete_org_membership(&self, user_id: &str, org_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM organization_memberships WHERE user_id = $1 AND org_id = $2")
            .bind(user_id)
            .bind(org_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── End users ───────────────────────────────────────────────

    async fn insert_end_user(&self, end_user: &EndUser) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO end_users (user_id, alias, spend, budget_id, blocked, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(&end_user.user_id)
        .bind(&end_user.alias)
        .bind(end_user.spend)
        .bind(&end_user.budget_id)
        .bind(end_user.blocked)
        .bind(end_user.created_at)
        .bind(end_user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_end_user(&self, user_id: &str) -> anyhow::Result<Option<EndUser>> {
        let row = sqlx::query_as::<_, EndUserRow>("SELECT * FROM end_users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EndUser::from))
    }

    async fn update_end_user(&self, end_user: &EndUser) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE end_users SET alias = $2, budget_id = $3, blocked = $4, updated_at = NOW()
               WHERE user_id = $1"#,
        )
        .bind(&end_user.user_id)
        .bind(&end_user.alias)
        .bind(&end_user.budget_id)
        .bind(end_user.blocked)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("end user {} not found", end_user.user_id);
        }
        Ok(())
    }

    async fn add_end_user_spend(&self, user_id: &str, amount: f64) -> anyhow::Result<()> {
        // Lazily provisioned by spend attribution, like the memory backend.
        sqlx::query(
            r#"INSERT INTO end_users (user_id, spend) VALUES ($1, $2)
               ON CONFLICT (user_id) DO UPDATE SET
                   spend = end_users.spend + $2,
                   updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Budgets ─────────────────────────────────────────────────

    async fn insert_budget(&self, budget: &Budget) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO budgets (
                id, max_budget, soft_budget, max_parallel_requests, model_max_budget,
                budget_duration, budget_reset_at, created_by, updated_by, is_active,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(&budget.id)
        .bind(budget.max_budget)
        .bind(budget.soft_budget)
        .bind(budget.max_parallel_requests)
        .bind(json(&budget.model_max_budget))
        .bind(budget.budget_duration.as_str())
        .bind(budget.budget_reset_at)
        .bind(&budget.created_by)
        .bind(&budget.updated_by)
        .bind(budget.is_active)
        .bind(budget.created_at)
        .bind(budget.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_budget(&self, id: &str) -> anyhow::Result<Option<Budget>> {
        let row = sqlx::query_as::<_, BudgetRow>("SELECT * FROM budgets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Budget::from))
    }

    async fn list_budgets(&self, filter: &ListFilter) -> anyhow::Result<Vec<Budget>> {
        let rows = sqlx::query_as::<_, BudgetRow>(
            "SELECT * FROM budgets WHERE (is_active = true OR $1) ORDER BY created_at ASC",
        )
        .bind(filter.include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Budget::from).collect())
    }

    async fn update_budget(&self, budget: &Budget) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE budgets SET
                max_budget = $2, soft_budget = $3, max_parallel_requests = $4,
                model_max_budget = $5, budget_duration = $6, budget_reset_at = $7,
                updated_by = $8, is_active = $9, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(&budget.id)
        .bind(budget.max_budget)
        .bind(budget.soft_budget)
        .bind(budget.max_parallel_requests)
        .bind(json(&budget.model_max_budget))
        .bind(budget.budget_duration.as_str())
        .bind(budget.budget_reset_at)
        .bind(&budget.updated_by)
        .bind(budget.is_active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("budget {} not found", budget.id);
        }
        Ok(())
    }

    async fn delete_budget(&self, id: &str) -> anyhow::Result<()> {
        let result =
            sqlx::query("UPDATE budgets SET is_active = false, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("budget {} not found", id);
        }
        Ok(())
    }

    // ── Invitations ─────────────────────────────────────────────

    async fn insert_invitation(&self, link: &InvitationLink) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO invitation_links (
                id, token_hash, team_id, org_id, role, max_uses, current_uses,
                budget_id, expires_at, is_active, created_by, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(&link.id)
        .bind(&link.token_hash)
        .bind(&link.team_id)
        .bind(&link.org_id)
        .bind(&link.role)
        .bind(link.max_uses)
        .bind(link.current_uses)
        .bind(&link.budget_id)
        .bind(link.expires_at)
        .bind(link.is_active)
        .bind(&link.created_by)
        .bind(link.created_at)
        .bind(link.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_invitation(&self, id: &str) -> anyhow::Result<Option<InvitationLink>> {
        let row = sqlx::query_as::<_, InvitationRow>("SELECT * FROM invitation_links WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(InvitationLink::from))
    }

    async fn get_invitation_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<InvitationLink>> {
        let row = sqlx::query_as::<_, InvitationRow>(
            "SELECT * FROM invitation_links WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InvitationLink::from))
    }

    async fn list_invitations(&self, filter: &ListFilter) -> anyhow::Result<Vec<InvitationLink>> {
        let rows = sqlx::query_as::<_, InvitationRow>(
            "SELECT * FROM invitation_links WHERE (is_active = true OR $1) ORDER BY created_at ASC",
        )
        .bind(filter.include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InvitationLink::from).collect())
    }

    async fn update_invitation(&self, link: &InvitationLink) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"UPDATE invitation_links SET
                team_id = $2, org_id = $3, role = $4, max_uses = $5, budget_id = $6,
                expires_at = $7, is_active = $8, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(&link.id)
        .bind(&link.team_id)
        .bind(&link.org_id)
        .bind(&link.role)
        .bind(link.max_uses)
        .bind(&link.budget_id)
        .bind(link.expires_at)
        .bind(link.is_active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("invitation {} not found", link.id);
        }
        Ok(())
    }

    async fn increment_invitation_uses(&self, id: &str) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE invitation_links SET current_uses = current_uses + 1, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("invitation {} not found", id);
        }
        Ok(())
    }

    // ── Audit log ───────────────────────────────────────────────

    async fn insert_audit_log(&self, entry: &AuditLog) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_logs (
                id, timestamp, actor_id, actor_type, actor_email, actor_ip, action,
                object_type, object_id, team_id, org_id, before, after, diff,
                request_id, user_agent, uri, success, error, metadata
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
            )"#,
        )
        .bind(&entry.id)
        .bind(entry.timestamp)
        .bind(&entry.actor_id)
        .bind(&entry.actor_type)
        .bind(&entry.actor_email)
        .bind(&entry.actor_ip)
        .bind(entry.action.as_str())
        .bind(&entry.object_type)
        .bind(&entry.object_id)
        .bind(&entry.team_id)
        .bind(&entry.org_id)
        .bind(entry.before.as_ref().map(json))
        .bind(entry.after.as_ref().map(json))
        .bind(json(&entry.diff))
        .bind(&entry.request_id)
        .bind(&entry.user_agent)
        .bind(&entry.uri)
        .bind(entry.success)
        .bind(&entry.error)
        .bind(json(&entry.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_audit_logs(&self, filter: &AuditFilter) -> anyhow::Result<Vec<AuditLog>> {
        let rows = sqlx::query_as::<_, AuditLogRow>(
            r#"SELECT * FROM audit_logs
               WHERE ($1::text IS NULL OR actor_id = $1)
                 AND ($2::text IS NULL OR action = $2)
                 AND ($3::text IS NULL OR object_type = $3)
                 AND ($4::text IS NULL OR object_id = $4)
                 AND ($5::text IS NULL OR team_id = $5)
                 AND ($6::text IS NULL OR org_id = $6)
                 AND ($7::boolean IS NULL OR success = $7)
                 AND ($8::timestamptz IS NULL OR timestamp >= $8)
                 AND ($9::timestamptz IS NULL OR timestamp < $9)
               ORDER BY timestamp DESC
               LIMIT $10"#,
        )
        .bind(&filter.actor_id)
        .bind(filter.action.map(|a| a.as_str()))
        .bind(&filter.object_type)
        .bind(&filter.object_id)
        .bind(&filter.team_id)
        .bind(&filter.org_id)
        .bind(filter.success)
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditLog::from).collect())
    }

    async fn audit_log_stats(&self, filter: &AuditFilter) -> anyhow::Result<AuditStats> {
        // Aggregate over the same filtered slice queries see, minus limit.
        let mut unlimited = filter.clone();
        unlimited.limit = None;
        let entries = self.query_audit_logs(&unlimited).await?;

        let mut stats = AuditStats::default();
        let mut actors = std::collections::HashSet::new();
        for entry in &entries {
            stats.total += 1;
            if entry.success {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }
            actors.insert(entry.actor_id.clone());
            *stats
                .by_action
                .entry(entry.action.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_object_type
                .entry(entry.object_type.clone())
                .or_insert(0) += 1;
        }
        stats.unique_actors = actors.len() as i64;
        Ok(stats)
    }

    async fn delete_audit_logs(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE timestamp < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ── Usage log ───────────────────────────────────────────────

    async fn insert_usage_log(&self, entry: &UsageLog) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO usage_logs (
                id, request_id, api_key_id, user_id, team_id, org_id, end_user_id,
                model, provider, prompt_tokens, completion_tokens, total_tokens,
                spend, latency_ms, status, cache_hit, tags, started_at, ended_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )"#,
        )
        .bind(&entry.id)
        .bind(&entry.request_id)
        .bind(&entry.api_key_id)
        .bind(&entry.user_id)
        .bind(&entry.team_id)
        .bind(&entry.org_id)
        .bind(&entry.end_user_id)
        .bind(&entry.model)
        .bind(&entry.provider)
        .bind(entry.prompt_tokens)
        .bind(entry.completion_tokens)
        .bind(entry.total_tokens)
        .bind(entry.spend)
        .bind(entry.latency_ms)
        .bind(entry.status)
        .bind(entry.cache_hit)
        .bind(json(&entry.tags))
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_usage_logs(&self, filter: &UsageFilter) -> anyhow::Result<Vec<UsageLog>> {
        let rows = sqlx::query_as::<_, UsageLogRow>(
            r#"SELECT * FROM usage_logs
               WHERE ($1::text IS NULL OR api_key_id = $1)
                 AND ($2::text IS NULL OR team_id = $2)
                 AND ($3::text IS NULL OR model = $3)
                 AND ($4::timestamptz IS NULL OR started_at >= $4)
                 AND ($5::timestamptz IS NULL OR started_at < $5)
               ORDER BY started_at DESC
               LIMIT $6"#,
        )
        .bind(&filter.api_key_id)
        .bind(&filter.team_id)
        .bind(&filter.model)
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.limit.unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UsageLog::from).collect())
    }
}
