//! Organizations and organization memberships.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level tenant unit. Budget shape comes from an optional reusable
/// budget template rather than inline caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub alias: Option<String>,
    pub budget_id: Option<String>,

    pub allowed_models: Vec<String>,

    pub spend: f64,
    pub model_spend: HashMap<String, f64>,

    pub metadata: HashMap<String, serde_json::Value>,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Organization {
            id: id.into(),
            alias: None,
            budget_id: None,
            allowed_models: Vec::new(),
            spend: 0.0,
            model_spend: HashMap::new(),
            metadata: HashMap::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Junction row: (user, organization) with a role inside that scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationMembership {
    pub user_id: String,
    pub org_id: String,
    pub role: String,
    pub spend: f64,
    pub budget_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl OrganizationMembership {
    pub fn new(user_id: impl Into<String>, org_id: impl Into<String>, role: impl Into<String>) -> Self {
        OrganizationMembership {
            user_id: user_id.into(),
            org_id: org_id.into(),
            role: role.into(),
            spend: 0.0,
            budget_id: None,
            joined_at: Utc::now(),
        }
    }
}
