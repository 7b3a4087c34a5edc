//! Append-only audit events for sensitive mutations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of auditable actions, grouped by domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    // API-key operations
    KeyGenerated,
    KeyUpdated,
    KeyDeleted,
    KeyRotated,
    KeyBlocked,
    KeyUnblocked,

    // Team operations
    TeamCreated,
    TeamUpdated,
    TeamDeleted,
    TeamMemberAdded,
    TeamMemberRemoved,

    // User operations
    UserCreated,
    UserUpdated,
    UserDeleted,

    // Organization operations
    OrgCreated,
    OrgUpdated,
    OrgDeleted,
    OrgMemberAdded,
    OrgMemberRemoved,

    // Budget operations
    BudgetCreated,
    BudgetUpdated,
    BudgetDeleted,
    BudgetReset,

    // Invitations
    InvitationCreated,
    InvitationAccepted,
    InvitationDeactivated,

    // Auth / SSO
    LoginSuccess,
    LoginFailed,
    SsoSynced,

    // Configuration
    ConfigUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::KeyGenerated => "key_generated",
            AuditAction::KeyUpdated => "key_updated",
            AuditAction::KeyDeleted => "key_deleted",
            AuditAction::KeyRotated => "key_rotated",
            AuditAction::KeyBlocked => "key_blocked",
            AuditAction::KeyUnblocked => "key_unblocked",
            AuditAction::TeamCreated => "team_created",
            AuditAction::TeamUpdated => "team_updated",
            AuditAction::TeamDeleted => "team_deleted",
            AuditAction::TeamMemberAdded => "team_member_added",
            AuditAction::TeamMemberRemoved => "team_member_removed",
            AuditAction::UserCreated => "user_created",
            AuditAction::UserUpdated => "user_updated",
            AuditAction::UserDeleted => "user_deleted",
            AuditAction::OrgCreated => "org_created",
            AuditAction::OrgUpdated => "org_updated",
            AuditAction::OrgDeleted => "org_deleted",
            AuditAction::OrgMemberAdded => "org_member_added",
            AuditAction::OrgMemberRemoved => "org_member_removed",
            AuditAction::BudgetCreated => "budget_created",
            AuditAction::BudgetUpdated => "budget_updated",
            AuditAction::BudgetDeleted => "budget_deleted",
            AuditAction::BudgetReset => "budget_reset",
            AuditAction::InvitationCreated => "invitation_created",
            AuditAction::InvitationAccepted => "invitation_accepted",
            AuditAction::InvitationDeactivated => "invitation_deactivated",
            AuditAction::LoginSuccess => "login_success",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::SsoSynced => "sso_synced",
            AuditAction::ConfigUpdated => "config_updated",
        }
    }
}

/// One side-by-side value change inside a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// A single audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,

    pub actor_id: String,
    /// "key", "user", "system", ...
    pub actor_type: String,
    pub actor_email: Option<String>,
    pub actor_ip: Option<String>,

    pub action: AuditAction,

    pub object_type: String,
    pub object_id: String,

    pub team_id: Option<String>,
    pub org_id: Option<String>,

    pub before: Option<HashMap<String, serde_json::Value>>,
    pub after: Option<HashMap<String, serde_json::Value>>,
    /// Field-wise `{before, after}` pairs computed at log time.
    pub diff: HashMap<String, FieldChange>,

    pub request_id: Option<String>,
    pub user_agent: Option<String>,
    pub uri: Option<String>,

    pub success: bool,
    pub error: Option<String>,

    pub metadata: HashMap<String, serde_json::Value>,
}
