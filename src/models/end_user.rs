//! Downstream end users, tracked via the `user` request parameter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A downstream, non-authenticating customer. Identified by an opaque id
/// supplied by the caller; the gateway tracks spend and a block flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndUser {
    pub user_id: String,
    pub alias: Option<String>,
    pub spend: f64,
    pub budget_id: Option<String>,
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EndUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        EndUser {
            user_id: user_id.into(),
            alias: None,
            spend: 0.0,
            budget_id: None,
            blocked: false,
            created_at: now,
            updated_at: now,
        }
    }
}
