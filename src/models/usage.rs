//! Per-request usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One record per served LLM request: token counts, attributed spend, and
/// the tenant pointers the spend fans out to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: String,
    pub request_id: String,

    pub api_key_id: String,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    pub end_user_id: Option<String>,

    pub model: String,
    pub provider: Option<String>,

    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,

    /// Dollars.
    pub spend: f64,

    pub latency_ms: i64,
    pub status: i32,
    pub cache_hit: bool,
    pub tags: Vec<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl UsageLog {
    /// A usage record with a fresh id, attributed to the given key.
    pub fn new(request_id: impl Into<String>, api_key_id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        UsageLog {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            api_key_id: api_key_id.into(),
            user_id: None,
            team_id: None,
            org_id: None,
            end_user_id: None,
            model: model.into(),
            provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            spend: 0.0,
            latency_ms: 0,
            status: 200,
            cache_hit: false,
            tags: Vec::new(),
            started_at: now,
            ended_at: now,
        }
    }
}
