//! In-memory store backend.
//!
//! A single reader/writer lock guards plain owned maps. Entities own all of
//! their data, so handing out `clone()`s satisfies the deep-copy contract:
//! caller mutation of a returned value can never reach the store.
//!
//! Spend accumulation holds the write lock across the read-modify-write, so
//! concurrent adds are additive.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{
    ApiKey, AuditLog, Budget, EndUser, InvitationLink, Organization, OrganizationMembership, Team,
    TeamMembership, UsageLog, User,
};

use super::{
    AuditFilter, AuditStats, GatewayStore, KeyFilter, ListFilter, MembershipFilter, UsageFilter,
};

#[derive(Default)]
struct Inner {
    keys: HashMap<String, ApiKey>,
    teams: HashMap<String, Team>,
    users: HashMap<String, User>,
    orgs: HashMap<String, Organization>,
    // (user_id, scope_id) composite keys
    team_memberships: HashMap<(String, String), TeamMembership>,
    org_memberships: HashMap<(String, String), OrganizationMembership>,
    end_users: HashMap<String, EndUser>,
    budgets: HashMap<String, Budget>,
    invitations: HashMap<String, InvitationLink>,
    audit_logs: Vec<AuditLog>,
    usage_logs: Vec<UsageLog>,
}

/// In-memory [`GatewayStore`] backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn add_model_spend(map: &mut HashMap<String, f64>, model: Option<&str>, amount: f64) {
    if let Some(m) = model {
        *map.entry(m.to_string()).or_insert(0.0) += amount;
    }
}

fn matches_audit(entry: &AuditLog, filter: &AuditFilter) -> bool {
    if let Some(actor) = &filter.actor_id {
        if &entry.actor_id != actor {
            return false;
        }
    }
    if let Some(action) = &filter.action {
        if &entry.action != action {
            return false;
        }
    }
    if let Some(object_type) = &filter.object_type {
        if &entry.object_type != object_type {
            return false;
        }
    }
    if let Some(object_id) = &filter.object_id {
        if &entry.object_id != object_id {
            return false;
        }
    }
    if let Some(team_id) = &filter.team_id {
        if entry.team_id.as_ref() != Some(team_id) {
            return false;
        }
    }
    if let Some(org_id) = &filter.org_id {
        if entry.org_id.as_ref() != Some(org_id) {
            return false;
        }
    }
    if let Some(success) = filter.success {
        if entry.success != success {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if entry.timestamp < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if entry.timestamp >= until {
            return false;
        }
    }
    true
}

#[async_trait]
impl GatewayStore for MemoryStore {
    // ── API keys ────────────────────────────────────────────────

    async fn insert_api_key(&self, key: &ApiKey) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .keys
            .values()
            .any(|k| k.is_active && k.key_hash == key.key_hash)
        {
            anyhow::bail!("api key hash already exists");
        }
        if let Some(alias) = &key.alias {
            if inner
                .keys
                .values()
                .any(|k| k.is_active && k.alias.as_ref() == Some(alias))
            {
                anyhow::bail!("api key alias '{}' already exists", alias);
            }
        }
        inner.keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn get_api_key(&self, id: &str) -> anyhow::Result<Option<ApiKey>> {
        Ok(self.inner.read().await.keys.get(id).cloned())
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> anyhow::Result<Option<ApiKey>> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .values()
            .find(|k| k.is_active && k.key_hash == hash)
            .cloned())
    }

    async fn get_api_key_by_alias(&self, alias: &str) -> anyhow::Result<Option<ApiKey>> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .values()
            .find(|k| k.is_active && k.alias.as_deref() == Some(alias))
            .cloned())
    }

    async fn list_api_keys(&self, filter: &KeyFilter) -> anyhow::Result<Vec<ApiKey>> {
        let inner = self.inner.read().await;
        let mut out: Vec<ApiKey> = inner
            .keys
            .values()
            .filter(|k| filter.include_inactive || k.is_active)
            .filter(|k| filter.user_id.is_none() || k.user_id == filter.user_id)
            .filter(|k| filter.team_id.is_none() || k.team_id == filter.team_id)
            .filter(|k| filter.org_id.is_none() || k.org_id == filter.org_id)
            .filter(|k| filter.key_type.map_or(true, |t| k.key_type == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_api_key(&self, key: &ApiKey) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.keys.contains_key(&key.id) {
            anyhow::bail!("api key {} not found", key.id);
        }
        let mut updated = key.clone();
        updated.updated_at = Utc::now();
        inner.keys.insert(key.id.clone(), updated);
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.keys.get_mut(id) {
            Some(key) => {
                key.is_active = false;
                key.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("api key {} not found", id),
        }
    }

    async fn touch_key_last_used(&self, id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(key) = inner.keys.get_mut(id) {
            // Never regress.
            if key.last_used_at.map_or(true, |prev| prev < at) {
                key.last_used_at = Some(at);
            }
        }
        Ok(())
    }

    async fn add_key_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.keys.get_mut(id) {
            Some(key) => {
                key.spend += amount;
                add_model_spend(&mut key.model_spend, model, amount);
                key.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("api key {} not found", id),
        }
    }

    async fn reset_key_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.keys.get_mut(id) {
            Some(key) => {
                key.spend = 0.0;
                key.model_spend.clear();
                key.budget_reset_at = next_reset;
                key.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("api key {} not found", id),
        }
    }

    async fn keys_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ApiKey>> {
        let inner = self.inner.read().await;
        Ok(inner
            .keys
            .values()
            .filter(|k| k.reset_due(now))
            .cloned()
            .collect())
    }

    // ── Teams ───────────────────────────────────────────────────

    async fn insert_team(&self, team: &Team) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.teams.contains_key(&team.id) {
            anyhow::bail!("team {} already exists", team.id);
        }
        inner.teams.insert(team.id.clone(), team.clone());
        Ok(())
    }

    async fn get_team(&self, id: &str) -> anyhow::Result<Option<Team>> {
        Ok(self.inner.read().await.teams.get(id).cloned())
    }

    async fn list_teams(&self, filter: &ListFilter) -> anyhow::Result<Vec<Team>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Team> = inner
            .teams
            .values()
            .filter(|t| filter.include_inactive || t.is_active)
            .filter(|t| filter.org_id.is_none() || t.org_id == filter.org_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_team(&self, team: &Team) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.teams.contains_key(&team.id) {
            anyhow::bail!("team {} not found", team.id);
        }
        let mut updated = team.clone();
        updated.updated_at = Utc::now();
        inner.teams.insert(team.id.clone(), updated);
        Ok(())
    }

    async fn delete_team(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.teams.get_mut(id) {
            Some(team) => {
                team.is_active = false;
                team.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("team {} not found", id),
        }
    }

    async fn add_team_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.teams.get_mut(id) {
            Some(team) => {
                team.spend += amount;
                add_model_spend(&mut team.model_spend, model, amount);
                team.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("team {} not found", id),
        }
    }

    async fn reset_team_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.teams.get_mut(id) {
            Some(team) => {
                team.spend = 0.0;
                team.model_spend.clear();
                team.budget_reset_at = next_reset;
                team.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("team {} not found", id),
        }
    }

    async fn teams_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Team>> {
        let inner = self.inner.read().await;
        Ok(inner
            .teams
            .values()
            .filter(|t| t.reset_due(now))
            .cloned()
            .collect())
    }

    // ── Users ───────────────────────────────────────────────────

    async fn insert_user(&self, user: &User) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.users.contains_key(&user.id) {
            anyhow::bail!("user {} already exists", user.id);
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &str) -> anyhow::Result<Option<User>> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.is_active && u.email.as_deref() == Some(email))
            .cloned())
    }

    async fn list_users(&self, filter: &ListFilter) -> anyhow::Result<Vec<User>> {
        let inner = self.inner.read().await;
        let mut out: Vec<User> = inner
            .users
            .values()
            .filter(|u| filter.include_inactive || u.is_active)
            .filter(|u| filter.org_id.is_none() || u.org_id == filter.org_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_user(&self, user: &User) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.users.contains_key(&user.id) {
            anyhow::bail!("user {} not found", user.id);
        }
        let mut updated = user.clone();
        updated.updated_at = Utc::now();
        inner.users.insert(user.id.clone(), updated);
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(id) {
            Some(user) => {
                user.is_active = false;
                user.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("user {} not found", id),
        }
    }

    async fn add_user_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(id) {
            Some(user) => {
                user.spend += amount;
                add_model_spend(&mut user.model_spend, model, amount);
                user.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("user {} not found", id),
        }
    }

    async fn reset_user_budget(&self, id: &str, next_reset: Option<DateTime<Utc>>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(id) {
            Some(user) => {
                user.spend = 0.0;
                user.model_spend.clear();
                user.budget_reset_at = next_reset;
                user.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("user {} not found", id),
        }
    }

    async fn users_due_for_reset(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<User>> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .filter(|u| u.reset_due(now))
            .cloned()
            .collect())
    }

    // ── Organizations ───────────────────────────────────────────

    async fn insert_organization(&self, org: &Organization) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.orgs.contains_key(&org.id) {
            anyhow::bail!("organization {} already exists", org.id);
        }
        inner.orgs.insert(org.id.clone(), org.clone());
        Ok(())
    }

    async fn get_organization(&self, id: &str) -> anyhow::Result<Option<Organization>> {
        Ok(self.inner.read().await.orgs.get(id).cloned())
    }

    async fn list_organizations(&self, filter: &ListFilter) -> anyhow::Result<Vec<Organization>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Organization> = inner
            .orgs
            .values()
            .filter(|o| filter.include_inactive || o.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_organization(&self, org: &Organization) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.orgs.contains_key(&org.id) {
            anyhow::bail!("organization {} not found", org.id);
        }
        let mut updated = org.clone();
        updated.updated_at = Utc::now();
        inner.orgs.insert(org.id.clone(), updated);
        Ok(())
    }

    async fn delete_organization(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.orgs.get_mut(id) {
            Some(org) => {
                org.is_active = false;
                org.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("organization {} not found", id),
        }
    }

    async fn add_org_spend(&self, id: &str, model: Option<&str>, amount: f64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.orgs.get_mut(id) {
            Some(org) => {
                org.spend += amount;
                add_model_spend(&mut org.model_spend, model, amount);
                org.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("organization {} not found", id),
        }
    }

    // ── Memberships ─────────────────────────────────────────────

    async fn insert_team_membership(&self, m: &TeamMembership) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let key = (m.user_id.clone(), m.team_id.clone());
        if inner.team_memberships.contains_key(&key) {
            anyhow::bail!("user {} is already a member of team {}", m.user_id, m.team_id);
        }
        inner.team_memberships.insert(key, m.clone());
        Ok(())
    }

    async fn get_team_membership(&self, user_id: &str, team_id: &str) -> anyhow::Result<Option<TeamMembership>> {
        let inner = self.inner.read().await;
        Ok(inner
            .team_memberships
            .get(&(user_id.to_string(), team_id.to_string()))
            .cloned())
    }

    async fn list_team_memberships(&self, filter: &MembershipFilter) -> anyhow::Result<Vec<TeamMembership>> {
        let inner = self.inner.read().await;
        let mut out: Vec<TeamMembership> = inner
            .team_memberships
            .values()
            .filter(|m| filter.user_id.as_deref().map_or(true, |u| m.user_id == u))
            .filter(|m| filter.scope_id.as_deref().map_or(true, |t| m.team_id == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(out)
    }

    async fn delete_team_membership(&self, user_id: &str, team_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .team_memberships
            .remove(&(user_id.to_string(), team_id.to_string()));
        Ok(())
    }

    async fn add_team_membership_spend(&self, user_id: &str, team_id: &str, amount: f64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(m) = inner
            .team_memberships
            .get_mut(&(user_id.to_string(), team_id.to_string()))
        {
            m.spend += amount;
        }
        Ok(())
    }

    async fn insert_org_membership(&self, m: &OrganizationMembership) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let key = (m.user_id.clone(), m.org_id.clone());
        if inner.org_memberships.contains_key(&key) {
            anyhow::bail!("user {} is already a member of org {}", m.user_id, m.org_id);
        }
        inner.org_memberships.insert(key, m.clone());
        Ok(())
    }

    async fn get_org_membership(&self, user_id: &str, org_id: &str) -> anyhow::Result<Option<OrganizationMembership>> {
        let inner = self.inner.read().await;
        Ok(inner
            .org_memberships
            .get(&(user_id.to_string(), org_id.to_string()))
            .cloned())
    }

    async fn list_org_memberships(&self, filter: &MembershipFilter) -> anyhow::Result<Vec<OrganizationMembership>> {
        let inner = self.inner.read().await;
        let mut out: Vec<OrganizationMembership> = inner
            .org_memberships
            .values()
            .filter(|m| filter.user_id.as_deref().map_or(true, |u| m.user_id == u))
            .filter(|m| filter.scope_id.as_deref().map_or(true, |o| m.org_id == o))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(out)
    }

    async fn delete_org_membership(&self, user_id: &str, org_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .org_memberships
            .remove(&(user_id.to_string(), org_id.to_string()));
        Ok(())
    }

    // ── End users ───────────────────────────────────────────────

    async fn insert_end_user(&self, end_user: &EndUser) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.end_users.contains_key(&end_user.user_id) {
            anyhow::bail!("end user {} already exists", end_user.user_id);
        }
        inner
            .end_users
            .insert(end_user.user_id.clone(), end_user.clone());
        Ok(())
    }

    async fn get_end_user(&self, user_id: &str) -> anyhow::Result<Option<EndUser>> {
        Ok(self.inner.read().await.end_users.get(user_id).cloned())
    }

    async fn update_end_user(&self, end_user: &EndUser) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.end_users.contains_key(&end_user.user_id) {
            anyhow::bail!("end user {} not found", end_user.user_id);
        }
        let mut updated = end_user.clone();
        updated.updated_at = Utc::now();
        inner.end_users.insert(end_user.user_id.clone(), updated);
        Ok(())
    }

    async fn add_end_user_spend(&self, user_id: &str, amount: f64) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        // Auto-provision on first sight: end users are created lazily by
        // spend attribution, not by an admin operation.
        let entry = inner
            .end_users
            .entry(user_id.to_string())
            .or_insert_with(|| EndUser::new(user_id));
        entry.spend += amount;
        entry.updated_at = Utc::now();
        Ok(())
    }

    // ── Budgets ─────────────────────────────────────────────────

    async fn insert_budget(&self, budget: &Budget) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.budgets.contains_key(&budget.id) {
            anyhow::bail!("budget {} already exists", budget.id);
        }
        inner.budgets.insert(budget.id.clone(), budget.clone());
        Ok(())
    }

    async fn get_budget(&self, id: &str) -> anyhow::Result<Option<Budget>> {
        Ok(self.inner.read().await.budgets.get(id).cloned())
    }

    async fn list_budgets(&self, filter: &ListFilter) -> anyhow::Result<Vec<Budget>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Budget> = inner
            .budgets
            .values()
            .filter(|b| filter.include_inactive || b.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_budget(&self, budget: &Budget) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.budgets.contains_key(&budget.id) {
            anyhow::bail!("budget {} not found", budget.id);
        }
        let mut updated = budget.clone();
        updated.updated_at = Utc::now();
        inner.budgets.insert(budget.id.clone(), updated);
        Ok(())
    }

    async fn delete_budget(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.budgets.get_mut(id) {
            Some(budget) => {
                budget.is_active = false;
                budget.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("budget {} not found", id),
        }
    }

    // ── Invitations ─────────────────────────────────────────────

    async fn insert_invitation(&self, link: &InvitationLink) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.invitations.contains_key(&link.id) {
            anyhow::bail!("invitation {} already exists", link.id);
        }
        inner.invitations.insert(link.id.clone(), link.clone());
        Ok(())
    }

    async fn get_invitation(&self, id: &str) -> anyhow::Result<Option<InvitationLink>> {
        Ok(self.inner.read().await.invitations.get(id).cloned())
    }

    async fn get_invitation_by_hash(&self, token_hash: &str) -> anyhow::Result<Option<InvitationLink>> {
        let inner = self.inner.read().await;
        Ok(inner
            .invitations
            .values()
            .find(|l| l.token_hash == token_hash)
            .cloned())
    }

    async fn list_invitations(&self, filter: &ListFilter) -> anyhow::Result<Vec<InvitationLink>> {
        let inner = self.inner.read().await;
        let mut out: Vec<InvitationLink> = inner
            .invitations
            .values()
            .filter(|l| filter.include_inactive || l.is_active)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn update_invitation(&self, link: &InvitationLink) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.invitations.contains_key(&link.id) {
            anyhow::bail!("invitation {} not found", link.id);
        }
        let mut updated = link.clone();
        updated.updated_at = Utc::now();
        inner.invitations.insert(link.id.clone(), updated);
        Ok(())
    }

    async fn increment_invitation_uses(&self, id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        match inner.invitations.get_mut(id) {
            Some(link) => {
                link.current_uses += 1;
                link.updated_at = Utc::now();
                Ok(())
            }
            None => anyhow::bail!("invitation {} not found", id),
        }
    }

    // ── Audit log ───────────────────────────────────────────────

    async fn insert_audit_log(&self, entry: &AuditLog) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.audit_logs.push(entry.clone());
        Ok(())
    }

    async fn query_audit_logs(&self, filter: &AuditFilter) -> anyhow::Result<Vec<AuditLog>> {
        let inner = self.inner.read().await;
        let mut out: Vec<AuditLog> = inner
            .audit_logs
            .iter()
            .filter(|e| matches_audit(e, filter))
            .cloned()
            .collect();
        // Newest first, like the SQL backend.
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn audit_log_stats(&self, filter: &AuditFilter) -> anyhow::Result<AuditStats> {
        let inner = self.inner.read().await;
        let mut stats = AuditStats::default();
        let mut actors = std::collections::HashSet::new();
        for entry in inner.audit_logs.iter().filter(|e| matches_audit(e, filter)) {
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
        let mut inner = self.inner.write().await;
        let before = inner.audit_logs.len();
        inner.audit_logs.retain(|e| e.timestamp >= older_than);
        Ok((before - inner.audit_logs.len()) as u64)
    }

    // ── Usage log ───────────────────────────────────────────────

    async fn insert_usage_log(&self, entry: &UsageLog) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.usage_logs.push(entry.clone());
        Ok(())
    }

    async fn query_usage_logs(&self, filter: &UsageFilter) -> anyhow::Result<Vec<UsageLog>> {
        let inner = self.inner.read().await;
        let mut out: Vec<UsageLog> = inner
            .usage_logs
            .iter()
            .filter(|u| filter.api_key_id.as_deref().map_or(true, |k| u.api_key_id == k))
            .filter(|u| filter.team_id.as_deref().map_or(true, |t| u.team_id.as_deref() == Some(t)))
            .filter(|u| filter.model.as_deref().map_or(true, |m| u.model == m))
            .filter(|u| filter.since.map_or(true, |s| u.started_at >= s))
            .filter(|u| filter.until.map_or(true, |e| u.started_at < e))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApiKey;

    fn key(id: &str, hash: &str) -> ApiKey {
        ApiKey::new(id, hash, "llmux_ab")
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected() {
        let store = MemoryStore::new();
        store.insert_api_key(&key("k1", "h1")).await.unwrap();
        assert!(store.insert_api_key(&key("k2", "h1")).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected_but_inactive_ignored() {
        let store = MemoryStore::new();
        let mut a = key("k1", "h1");
        a.alias = Some("prod".into());
        store.insert_api_key(&a).await.unwrap();

        let mut b = key("k2", "h2");
        b.alias = Some("prod".into());
        assert!(store.insert_api_key(&b).await.is_err());

        // Soft-delete the holder; alias becomes reusable.
        store.delete_api_key("k1").await.unwrap();
        assert!(store.insert_api_key(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_hash_lookup_skips_inactive() {
        let store = MemoryStore::new();
        store.insert_api_key(&key("k1", "h1")).await.unwrap();
        store.delete_api_key("k1").await.unwrap();
        assert!(store.get_api_key_by_hash("h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deep_copy_on_read() {
        let store = MemoryStore::new();
        let mut k = key("k1", "h1");
        k.allowed_models = vec!["gpt-4".into()];
        store.insert_api_key(&k).await.unwrap();

        let mut read = store.get_api_key("k1").await.unwrap().unwrap();
        read.allowed_models.push("claude-3".into());
        read.metadata.insert("x".into(), serde_json::json!(1));

        let reread = store.get_api_key("k1").await.unwrap().unwrap();
        assert_eq!(reread.allowed_models, vec!["gpt-4".to_string()]);
        assert!(reread.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_spend_accumulates_per_model() {
        let store = MemoryStore::new();
        store.insert_api_key(&key("k1", "h1")).await.unwrap();
        store.add_key_spend("k1", Some("gpt-4"), 1.5).await.unwrap();
        store.add_key_spend("k1", Some("gpt-4"), 0.5).await.unwrap();
        store.add_key_spend("k1", None, 1.0).await.unwrap();

        let k = store.get_api_key("k1").await.unwrap().unwrap();
        assert_eq!(k.spend, 3.0);
        assert_eq!(k.model_spend.get("gpt-4"), Some(&2.0));
    }

    #[tokio::test]
    async fn test_touch_last_used_never_regresses() {
        let store = MemoryStore::new();
        store.insert_api_key(&key("k1", "h1")).await.unwrap();
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);
        store.touch_key_last_used("k1", later).await.unwrap();
        store.touch_key_last_used("k1", earlier).await.unwrap();
        let k = store.get_api_key("k1").await.unwrap().unwrap();
        assert_eq!(k.last_used_at, Some(later));
    }

    #[tokio::test]
    async fn test_list_hides_inactive_by_default() {
        let store = MemoryStore::new();
        store.insert_api_key(&key("k1", "h1")).await.unwrap();
        store.insert_api_key(&key("k2", "h2")).await.unwrap();
        store.delete_api_key("k1").await.unwrap();

        let active = store.list_api_keys(&KeyFilter::default()).await.unwrap();
        assert_eq!(active.len(), 1);

        let all = store
            .list_api_keys(&KeyFilter {
                include_inactive: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_end_user_spend_auto_provisions() {
        let store = MemoryStore::new();
        store.add_end_user_spend("cust-1", 0.25).await.unwrap();
        store.add_end_user_spend("cust-1", 0.75).await.unwrap();
        let eu = store.get_end_user("cust-1").await.unwrap().unwrap();
        assert_eq!(eu.spend, 1.0);
        assert!(!eu.blocked);
    }
}
