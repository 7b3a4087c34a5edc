//! Reusable budget templates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::BudgetDuration;

/// A budget template that entities (orgs, memberships, end users) point to
/// by id instead of carrying inline caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub max_budget: Option<f64>,
    pub soft_budget: Option<f64>,
    pub max_parallel_requests: Option<i64>,
    pub model_max_budget: HashMap<String, f64>,
    pub budget_duration: BudgetDuration,
    pub budget_reset_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Budget {
            id: id.into(),
            max_budget: None,
            soft_budget: None,
            max_parallel_requests: None,
            model_max_budget: HashMap::new(),
            budget_duration: BudgetDuration::Never,
            budget_reset_at: None,
            created_by: None,
            updated_by: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
