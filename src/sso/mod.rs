//! SSO synchronization: binds external identity to internal users, teams,
//! and organizations.
//!
//! After the external OIDC exchange completes, the syncer receives the
//! caller's attributes and reconciles the tenant graph, gated on
//! per-operation config flags. Individual team/org failures become
//! non-fatal warnings in the result; only a missing user with auto-create
//! disabled aborts the sync.

pub mod roles;
pub mod userinfo;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::models::{OrganizationMembership, Team, TeamMembership, User, UserRole};
use crate::store::{GatewayStore, MembershipFilter};

/// Role granted to memberships created by SSO sync.
const SSO_MEMBER_ROLE: &str = "member";

/// Per-operation gates for the sync flow.
#[derive(Debug, Clone)]
pub struct SsoSyncConfig {
    pub auto_create_users: bool,
    pub sync_user_roles: bool,
    pub auto_create_teams: bool,
    /// Remove memberships for teams the JWT no longer lists.
    pub remove_unlisted_teams: bool,
    pub default_role: UserRole,
    /// Organization assigned to auto-created users.
    pub default_org_id: Option<String>,
}

impl Default for SsoSyncConfig {
    fn default() -> Self {
        SsoSyncConfig {
            auto_create_users: true,
            sync_user_roles: false,
            auto_create_teams: false,
            remove_unlisted_teams: false,
            default_role: UserRole::InternalUser,
            default_org_id: None,
        }
    }
}

/// What the OIDC exchange handed us about the caller.
#[derive(Debug, Clone)]
pub struct SsoUserAttributes {
    pub user_id: String,
    pub email: Option<String>,
    pub role: Option<UserRole>,
    /// Team ids asserted by the JWT.
    pub team_ids: Vec<String>,
    pub org_id: Option<String>,
}

/// What the sync changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncResult {
    pub user_created: bool,
    pub role_changed: Option<(UserRole, UserRole)>,
    pub teams_added: Vec<String>,
    pub teams_removed: Vec<String>,
    pub org_membership_added: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("user '{0}' not found and auto-create is disabled")]
    UserNotFound(String),

    #[error("team '{0}' not found and auto-create is disabled")]
    TeamNotFound(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Reconciles SSO attributes into the tenant graph.
pub struct SsoSyncer {
    store: Arc<dyn GatewayStore>,
    config: SsoSyncConfig,
}

impl SsoSyncer {
    pub fn new(store: Arc<dyn GatewayStore>, config: SsoSyncConfig) -> Self {
        SsoSyncer { store, config }
    }

    pub async fn sync(&self, attrs: &SsoUserAttributes) -> Result<SyncResult, SyncError> {
        let mut result = SyncResult::default();

        // 1. Ensure the user exists.
        let mut user = match self.store.get_user(&attrs.user_id).await? {
            Some(user) => user,
            None => {
                if !self.config.auto_create_users {
                    return Err(SyncError::UserNotFound(attrs.user_id.clone()));
                }
                let mut user = User::new(attrs.user_id.clone());
                user.email = attrs.email.clone();
                user.role = attrs.role.unwrap_or(self.config.default_role);
                user.org_id = self.config.default_org_id.clone();
                self.store.insert_user(&user).await?;
                result.user_created = true;
                tracing::info!(user_id = %user.id, role = user.role.as_str(), "sso: user auto-created");
                user
            }
        };

        // 2. Role sync.
        if self.config.sync_user_roles && !result.user_created {
            if let Some(jwt_role) = attrs.role {
                if jwt_role != user.role {
                    let old = user.role;
                    user.role = jwt_role;
                    self.store.update_user(&user).await?;
                    result.role_changed = Some((old, jwt_role));
                    tracing::info!(
                        user_id = %user.id,
                        old_role = old.as_str(),
                        new_role = jwt_role.as_str(),
                        "sso: role updated"
                    );
                }
            }
        }

        // 3. Team memberships: J \ C joins, C \ J leaves (when enabled).
        let current: Vec<String> = self
            .store
            .list_team_memberships(&MembershipFilter {
                user_id: Some(user.id.clone()),
                scope_id: None,
            })
            .await?
            .into_iter()
            .map(|m| m.team_id)
            .collect();

        for team_id in &attrs.team_ids {
            if current.contains(team_id) {
                continue;
            }
            match self.ensure_team(team_id).await {
                Ok(()) => {
                    let membership = TeamMembership::new(&user.id, team_id, SSO_MEMBER_ROLE);
                    match self.store.insert_team_membership(&membership).await {
                        Ok(()) => result.teams_added.push(team_id.clone()),
                        Err(e) => result
                            .warnings
                            .push(format!("failed to join team '{}': {}", team_id, e)),
                    }
                }
                Err(e) => result.warnings.push(e.to_string()),
            }
        }

        if self.config.remove_unlisted_teams {
            for team_id in &current {
                if attrs.team_ids.contains(team_id) {
                    continue;
                }
                match self.store.delete_team_membership(&user.id, team_id).await {
                    Ok(()) => result.teams_removed.push(team_id.clone()),
                    Err(e) => result
                        .warnings
                        .push(format!("failed to leave team '{}': {}", team_id, e)),
                }
            }
        }

        // Keep the denormalized team list on the user in step.
        if !result.teams_added.is_empty() || !result.teams_removed.is_empty() {
            let teams: Vec<String> = self
                .store
                .list_team_memberships(&MembershipFilter {
                    user_id: Some(user.id.clone()),
                    scope_id: None,
                })
                .await?
                .into_iter()
                .map(|m| m.team_id)
                .collect();
            user.teams = teams;
            if let Err(e) = self.store.update_user(&user).await {
                result
                    .warnings
                    .push(format!("failed to update user team list: {}", e));
            }
        }

        // 4. Org membership.
        if let Some(org_id) = &attrs.org_id {
            match self.store.get_org_membership(&user.id, org_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let membership = OrganizationMembership::new(&user.id, org_id, SSO_MEMBER_ROLE);
                    match self.store.insert_org_membership(&membership).await {
                        Ok(()) => result.org_membership_added = true,
                        Err(e) => result
                            .warnings
                            .push(format!("failed to join org '{}': {}", org_id, e)),
                    }
                }
                Err(e) => result
                    .warnings
                    .push(format!("failed to read org membership '{}': {}", org_id, e)),
            }
        }

        Ok(result)
    }

    async fn ensure_team(&self, team_id: &str) -> Result<(), SyncError> {
        if self.store.get_team(team_id).await?.is_some() {
            return Ok(());
        }
        if !self.config.auto_create_teams {
            return Err(SyncError::TeamNotFound(team_id.to_string()));
        }
        self.store.insert_team(&Team::new(team_id)).await?;
        tracing::info!(team_id = %team_id, "sso: team auto-created");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn attrs(user_id: &str, teams: &[&str]) -> SsoUserAttributes {
        SsoUserAttributes {
            user_id: user_id.into(),
            email: Some(format!("{}@example.com", user_id)),
            role: None,
            team_ids: teams.iter().map(|s| s.to_string()).collect(),
            org_id: None,
        }
    }

    fn syncer(store: Arc<MemoryStore>, config: SsoSyncConfig) -> SsoSyncer {
        SsoSyncer::new(store, config)
    }

    #[tokio::test]
    async fn test_auto_create_user() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(store.clone(), SsoSyncConfig::default());

        let result = s.sync(&attrs("u1", &[])).await.unwrap();
        assert!(result.user_created);

        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.role, UserRole::InternalUser);
        assert_eq!(user.email.as_deref(), Some("u1@example.com"));
    }

    #[tokio::test]
    async fn test_user_not_found_when_auto_create_off() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(
            store,
            SsoSyncConfig {
                auto_create_users: false,
                ..Default::default()
            },
        );
        let err = s.sync(&attrs("ghost", &[])).await.unwrap_err();
        assert!(matches!(err, SyncError::UserNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_role_sync_records_old_and_new() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(
            store.clone(),
            SsoSyncConfig {
                sync_user_roles: true,
                ..Default::default()
            },
        );
        s.sync(&attrs("u1", &[])).await.unwrap();

        let mut a = attrs("u1", &[]);
        a.role = Some(UserRole::OrgAdmin);
        let result = s.sync(&a).await.unwrap();
        assert_eq!(
            result.role_changed,
            Some((UserRole::InternalUser, UserRole::OrgAdmin))
        );
        assert_eq!(
            store.get_user("u1").await.unwrap().unwrap().role,
            UserRole::OrgAdmin
        );
    }

    #[tokio::test]
    async fn test_team_join_with_auto_create() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(
            store.clone(),
            SsoSyncConfig {
                auto_create_teams: true,
                ..Default::default()
            },
        );
        let result = s.sync(&attrs("u1", &["t1", "t2"])).await.unwrap();
        assert_eq!(result.teams_added, vec!["t1".to_string(), "t2".to_string()]);
        assert!(store.get_team("t1").await.unwrap().is_some());
        assert!(store
            .get_team_membership("u1", "t2")
            .await
            .unwrap()
            .is_some());

        let user = store.get_user("u1").await.unwrap().unwrap();
        assert_eq!(user.teams.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_team_is_a_warning_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(store.clone(), SsoSyncConfig::default());
        let result = s.sync(&attrs("u1", &["ghost-team"])).await.unwrap();
        assert!(result.teams_added.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("ghost-team"));
    }

    #[tokio::test]
    async fn test_remove_unlisted_teams() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(
            store.clone(),
            SsoSyncConfig {
                auto_create_teams: true,
                remove_unlisted_teams: true,
                ..Default::default()
            },
        );
        s.sync(&attrs("u1", &["t1", "t2"])).await.unwrap();

        let result = s.sync(&attrs("u1", &["t2"])).await.unwrap();
        assert_eq!(result.teams_removed, vec!["t1".to_string()]);
        assert!(store
            .get_team_membership("u1", "t1")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_team_membership("u1", "t2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_unlisted_teams_kept_by_default() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(
            store.clone(),
            SsoSyncConfig {
                auto_create_teams: true,
                ..Default::default()
            },
        );
        s.sync(&attrs("u1", &["t1"])).await.unwrap();
        let result = s.sync(&attrs("u1", &[])).await.unwrap();
        assert!(result.teams_removed.is_empty());
        assert!(store
            .get_team_membership("u1", "t1")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_org_membership_added_once() {
        let store = Arc::new(MemoryStore::new());
        let s = syncer(store.clone(), SsoSyncConfig::default());

        let mut a = attrs("u1", &[]);
        a.org_id = Some("o1".into());
        let first = s.sync(&a).await.unwrap();
        assert!(first.org_membership_added);

        let second = s.sync(&a).await.unwrap();
        assert!(!second.org_membership_added);

        let memberships = store
            .list_org_memberships(&MembershipFilter {
                user_id: Some("u1".into()),
                scope_id: None,
            })
            .await
            .unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].role, "member");
    }
}
