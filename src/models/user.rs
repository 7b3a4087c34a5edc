//! Internal users and their system roles.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::BudgetDuration;

/// System-wide role of an internal user, ordered by privilege. The order of
/// the variants is the hierarchy order used by SSO role resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserRole {
    #[serde(rename = "proxy_admin")]
    ProxyAdmin,
    #[serde(rename = "proxy_admin_viewer")]
    ProxyAdminViewer,
    #[serde(rename = "org_admin")]
    OrgAdmin,
    #[default]
    #[serde(rename = "internal_user")]
    InternalUser,
    #[serde(rename = "internal_user_viewer")]
    InternalUserViewer,
    #[serde(rename = "team")]
    Team,
    #[serde(rename = "customer")]
    Customer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::ProxyAdmin => "proxy_admin",
            UserRole::ProxyAdminViewer => "proxy_admin_viewer",
            UserRole::OrgAdmin => "org_admin",
            UserRole::InternalUser => "internal_user",
            UserRole::InternalUserViewer => "internal_user_viewer",
            UserRole::Team => "team",
            UserRole::Customer => "customer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proxy_admin" => Some(UserRole::ProxyAdmin),
            "proxy_admin_viewer" => Some(UserRole::ProxyAdminViewer),
            "org_admin" => Some(UserRole::OrgAdmin),
            "internal_user" => Some(UserRole::InternalUser),
            "internal_user_viewer" => Some(UserRole::InternalUserViewer),
            "team" => Some(UserRole::Team),
            "customer" => Some(UserRole::Customer),
            _ => None,
        }
    }

    /// Policy-graph subject for this role, e.g. `role:proxy_admin`.
    pub fn role_subject(&self) -> String {
        format!("role:{}", self.as_str())
    }
}

/// An internal user, typically provisioned by an admin or by SSO sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub alias: Option<String>,
    pub email: Option<String>,

    pub team_id: Option<String>,
    pub org_id: Option<String>,
    /// Denormalized list of team ids; memberships are authoritative.
    pub teams: Vec<String>,

    pub role: UserRole,

    pub max_budget: Option<f64>,
    pub soft_budget: Option<f64>,
    pub model_max_budget: HashMap<String, f64>,
    pub spend: f64,
    pub model_spend: HashMap<String, f64>,
    pub budget_duration: BudgetDuration,
    pub budget_reset_at: Option<DateTime<Utc>>,

    pub metadata: HashMap<String, serde_json::Value>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        User {
            id: id.into(),
            alias: None,
            email: None,
            team_id: None,
            org_id: None,
            teams: Vec::new(),
            role: UserRole::InternalUser,
            max_budget: None,
            soft_budget: None,
            model_max_budget: HashMap::new(),
            spend: 0.0,
            model_spend: HashMap::new(),
            budget_duration: BudgetDuration::Never,
            budget_reset_at: None,
            metadata: HashMap::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && matches!(self.budget_reset_at, Some(at) if at <= now)
    }
}
