//! Teams and team memberships.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::BudgetDuration;

/// A team: the mid-level tenant unit between keys/users and organizations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub alias: Option<String>,
    pub org_id: Option<String>,

    pub allowed_models: Vec<String>,

    pub tpm_limit: Option<i64>,
    pub rpm_limit: Option<i64>,

    pub max_budget: Option<f64>,
    pub soft_budget: Option<f64>,
    pub model_max_budget: HashMap<String, f64>,
    pub spend: f64,
    pub model_spend: HashMap<String, f64>,
    pub budget_duration: BudgetDuration,
    pub budget_reset_at: Option<DateTime<Utc>>,

    pub metadata: HashMap<String, serde_json::Value>,

    pub is_active: bool,
    pub blocked: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Team {
            id: id.into(),
            alias: None,
            org_id: None,
            allowed_models: Vec::new(),
            tpm_limit: None,
            rpm_limit: None,
            max_budget: None,
            soft_budget: None,
            model_max_budget: HashMap::new(),
            spend: 0.0,
            model_spend: HashMap::new(),
            budget_duration: BudgetDuration::Never,
            budget_reset_at: None,
            metadata: HashMap::new(),
            is_active: true,
            blocked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && matches!(self.budget_reset_at, Some(at) if at <= now)
    }
}

/// Junction row: (user, team) with a role inside that scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMembership {
    pub user_id: String,
    pub team_id: String,
    /// Role within the team scope ("admin", "member", ...).
    pub role: String,
    pub spend: f64,
    pub budget_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl TeamMembership {
    pub fn new(user_id: impl Into<String>, team_id: impl Into<String>, role: impl Into<String>) -> Self {
        TeamMembership {
            user_id: user_id.into(),
            team_id: team_id.into(),
            role: role.into(),
            spend: 0.0,
            budget_id: None,
            joined_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_team_reset_due() {
        let now = Utc::now();
        let mut team = Team::new("t1");
        assert!(!team.reset_due(now)); // no reset scheduled
        team.budget_reset_at = Some(now - Duration::minutes(5));
        assert!(team.reset_due(now));
        team.is_active = false;
        assert!(!team.reset_due(now));
    }

    #[test]
    fn test_membership_defaults() {
        let m = TeamMembership::new("u1", "t1", "member");
        assert_eq!(m.spend, 0.0);
        assert!(m.budget_id.is_none());
    }
}
