//! Abstract persistence contract.
//!
//! Every backend (in-memory or Postgres) satisfies [`GatewayStore`]. The
//! contract's non-negotiables:
//! - reads of composite entities return independent deep copies;
//! - default list paths hide soft-deleted rows unless the filter asks;
//! - spend accumulation is additive (atomic add or write-lock held);
//! - key hash and alias lookups are unique across active keys.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    ApiKey, AuditAction, AuditLog, Budget, EndUser, InvitationLink, KeyType, Organization,
    OrganizationMembership, Team, TeamMembership, UsageLog, User,
};

/// Filter for key listings. Unset fields match everything; inactive rows
/// are hidden unless `include_inactive` is set.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    pub key_type: Option<KeyType>,
    pub include_inactive: bool,
}

/// Filter shared by team/user/org/budget/invitation listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub org_id: Option<String>,
    pub include_inactive: bool,
}

/// Filter for membership listings; at least one side is normally set.
#[derive(Debug, Clone, Default)]
pub struct MembershipFilter {
    pub user_id: Option<String>,
    pub scope_id: Option<String>,
}

/// Filter for audit-log queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor_id: Option<String>,
    pub action: Option<AuditAction>,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Aggregates over a filtered audit-log slice.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub unique_actors: i64,
    pub by_action: HashMap<String, i64>,
    pub by_object_type: HashMap<String, i64>,
}

/// Filter for usage-log queries.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub api_key_id: Option<String>,
    pub team_id: Option<String>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// The persistence contract. All operations are cancellation-safe futures;
/// bounded call sites wrap them in `tokio::time::timeout`.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    // ── API keys ────────────────────────────────────────────────

    /// Insert a key. Fails if the hash or alias collides with an
    /// existing active key.
    async fn insert_api_key(&self, key: &ApiKey) -> anyhow::Result<()>;
    async fn get_api_key(&self, id: &str) -> anyhow::Result<Option<ApiKey>>;
    async fn get_api_key_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKey>>;
    async fn get_api_key_by_alias(&self, alias: &str) -> anyhow::Result<Option<ApiKey>>;
    async fn list_api_keys(&self, filter: &KeyFilter) -> anyhow::Result<Vec<ApiKey>>;
    async fn update_api_key(&self, key: &ApiKey) -> anyhow::Result<()>;
    /// Soft delete: clears `is_active`, stamps `updated_at`.
    async fn delete_api_key(&self, id: &str) -> anyhow::Result<()>;
    /// Monotone `last_used_at` advance; a stored future timestamp wins.
    async fn touch_key_last_used(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<()>;
    /// Atomic add to aggregate and (when `model` is set) per-model spend.
    async fn add_key_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()>;
    /// Zero aggregate + per-model spend and move `budget_reset_at` forward.
    async fn reset_key_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()>;
    async fn keys_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ApiKey>>;

    // ── Teams ───────────────────────────────────────────────────

    async fn insert_team(&self, team: &Team) -> anyhow::Result<()>;
    async fn get_team(&self, id: &str) -> anyhow::Result<Option<Team>>;
    async fn list_teams(&self, filter: &ListFilter) -> anyhow::Result<Vec<Team>>;
    async fn update_team(&self, team: &Team) -> anyhow::Result<()>;
    async fn delete_team(&self, id: &str) -> anyhow::Result<()>;
    async fn add_team_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()>;
    async fn reset_team_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()>;
    async fn teams_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Team>>;

    // ── Users ───────────────────────────────────────────────────

    async fn insert_user(&self, user: &User) -> anyhow::Result<()>;
    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn list_users(&self, filter: &ListFilter) -> anyhow::Result<Vec<User>>;
    async fn update_user(&self, user: &User) -> anyhow::Result<()>;
    async fn delete_user(&self, id: &str) -> anyhow::Result<()>;
    async fn add_user_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()>;
    async fn reset_user_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()>;
    async fn users_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<User>>;

    // ── Organizations ───────────────────────────────────────────

    async fn insert_organization(&self, org: &Organization) -> anyhow::Result<()>;
    async fn get_organization(&self, id: &str) -> anyhow::Result<Option<Organization>>;
    async fn list_organizations(&self, filter: &ListFilter) -> anyhow::Result<Vec<Organization>>;
    async fn update_organization(&self, org: &Organization) -> anyhow::Result<()>;
    async fn delete_organization(&self, id: &str) -> anyhow::Result<()>;
    async fn add_org_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()>;

    // ── Memberships ─────────────────────────────────────────────

    async fn insert_team_membership(&self, m: &TeamMembership) -> anyhow::Result<()>;
    async fn get_team_membership(&self, user_id: &str, team_id: &str) -> anyhow::Result<Option<TeamMembership>>;
    async fn list_team_memberships(&self, filter: &MembershipFilter) -> anyhow::Result<Vec<TeamMembership>>;
    async fn delete_team_membership(&self, user_id: &str, team_id: &str) -> anyhow::Result<()>;
    async fn add_team_membership_spend(&self, user_id: &str, team_id: &str, amount: f64) -> anyhow::Result<()>;

    async fn insert_org_membership(&self, m: &OrganizationMembership) -> anyhow::Result<()>;
    async fn get_org_membership(&self, user_id: &str, org_id: &str) -> anyhow::Result<Option<OrganizationMembership>>;
    async fn list_org_memberships(&self, filter: &MembershipFilter) -> anyhow::Result<Vec<OrganizationMembership>>;
    async fn delete_org_membership(&self, user_id: &str, org_id: &str) -> anyhow::Result<()>;

    // ── End users ───────────────────────────────────────────────

    async fn insert_end_user(&self, end_user: &EndUser) -> anyhow::Result<()>;
    async fn get_end_user(&self, user_id: &str) -> anyhow::Result<Option<EndUser>>;
    async fn update_end_user(&self, end_user: &EndUser) -> anyhow::Result<()>;
    async fn add_end_user_spend(&self, user_id: &str, amount: f64) -> anyhow::Result<()>;

    // ── Budgets ─────────────────────────────────────────────────

    async fn insert_budget(&self, budget: &Budget) -> anyhow::Result<()>;
    async fn get_budget(&self, id: &str) -> anyhow::Result<Option<Budget>>;
    async fn list_budgets(&self, filter: &ListFilter) -> anyhow::Result<Vec<Budget>>;
    async fn update_budget(&self, budget: &Budget) -> anyhow::Result<()>;
    async fn delete_budget(&self, id: &str) -> anyhow::Result<()>;

    // ── Invitations ─────────────────────────────────────────────

    async fn insert_invitation(&self, link: &InvitationLink) -> anyhow::Result<()>;
    async fn get_invitation(&self, id: &str) -> anyhow::Result<Option<InvitationLink>>;
    async fn get_invitation_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<InvitationLink>>;
    async fn list_invitations(&self, filter: &ListFilter) -> anyhow::Result<Vec<InvitationLink>>;
    async fn update_invitation(&self, link: &InvitationLink) -> anyhow::Result<()>;
    async fn increment_invitation_uses(&self, id: &str) -> anyhow::Result<()>;

    // ── Audit log ───────────────────────────────────────────────

    async fn insert_audit_log(&self, entry: &AuditLog) -> anyhow::Result<()>;
    async fn query_audit_logs(&self, filter: &AuditFilter) -> anyhow::Result<Vec<AuditLog>>;
    async fn audit_log_stats(&self, filter: &AuditFilter) -> anyhow::Result<AuditStats>;
    /// Retention: delete entries older than the cutoff; returns the count.
    async fn delete_audit_logs(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64>;

    // ── Usage log ───────────────────────────────────────────────

    async fn insert_usage_log(&self, entry: &UsageLog) -> anyhow::Result<()>;
    async fn query_usage_logs(&self, filter: &UsageFilter) -> anyhow::Result<Vec<UsageLog>>;
}
