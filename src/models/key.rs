//! Virtual API keys — the credential unit the gateway authenticates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::BudgetDuration;

/// Metadata key: set to `true` to enroll a key in automatic rotation.
pub const META_AUTO_ROTATE: &str = "auto_rotate";
/// Metadata key: rotation interval in the duration grammar (e.g. `"30d"`).
pub const META_ROTATION_INTERVAL: &str = "rotation_interval";
/// Metadata key: number of rotations this lineage has been through.
pub const META_ROTATION_COUNT: &str = "rotation_count";
/// Metadata key: RFC 3339 timestamp of the last rotation.
pub const META_LAST_ROTATION_AT: &str = "last_rotation_at";
/// Metadata key: RFC 3339 timestamp the next rotation is due.
pub const META_KEY_ROTATION_AT: &str = "key_rotation_at";

/// What a key is for. Determines the default route policy it inherits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Model-invocation routes only.
    #[serde(rename = "llm-api")]
    LlmApi,
    /// Full admin surface.
    #[serde(rename = "management")]
    Management,
    /// GET/HEAD on `/v1/models` only.
    #[serde(rename = "read-only")]
    ReadOnly,
    #[default]
    #[serde(rename = "default")]
    Default,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::LlmApi => "llm-api",
            KeyType::Management => "management",
            KeyType::ReadOnly => "read-only",
            KeyType::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llm-api" => Some(KeyType::LlmApi),
            "management" => Some(KeyType::Management),
            "read-only" => Some(KeyType::ReadOnly),
            "default" => Some(KeyType::Default),
            _ => None,
        }
    }

    /// Role subject this key type maps into the policy graph, e.g.
    /// `role:llm_api`.
    pub fn role_subject(&self) -> &'static str {
        match self {
            KeyType::LlmApi => "role:llm_api",
            KeyType::Management => "role:management",
            KeyType::ReadOnly => "role:read_only",
            KeyType::Default => "role:default",
        }
    }
}

/// A virtual API key. The plaintext credential is never stored; `key_hash`
/// is its lowercase hex SHA-256 and `key_prefix` the 8-character display
/// fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub alias: Option<String>,

    // Ownership pointers (id strings; resolved on demand).
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub org_id: Option<String>,

    pub key_type: KeyType,

    /// Empty = unrestricted; `"*"` = explicit wildcard.
    pub allowed_models: Vec<String>,

    // Throughput envelopes (per minute). `None` = gateway default.
    pub tpm_limit: Option<i64>,
    pub rpm_limit: Option<i64>,
    pub model_tpm_limit: HashMap<String, i64>,
    pub model_rpm_limit: HashMap<String, i64>,

    // Spending envelope.
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
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// A blank active key with the given identity; callers fill in the rest.
    pub fn new(id: impl Into<String>, key_hash: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        let now = Utc::now();
        ApiKey {
            id: id.into(),
            key_hash: key_hash.into(),
            key_prefix: key_prefix.into(),
            name: String::new(),
            alias: None,
            user_id: None,
            team_id: None,
            org_id: None,
            key_type: KeyType::Default,
            allowed_models: Vec::new(),
            tpm_limit: None,
            rpm_limit: None,
            model_tpm_limit: HashMap::new(),
            model_rpm_limit: HashMap::new(),
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
            expires_at: None,
            last_used_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// Soft budget exceeded — fires alerts, never refuses authentication.
    pub fn over_soft_budget(&self) -> bool {
        matches!(self.soft_budget, Some(cap) if self.spend >= cap)
    }

    pub fn over_hard_budget(&self) -> bool {
        matches!(self.max_budget, Some(cap) if self.spend >= cap)
    }

    /// Whether the reconciliation sweep owes this key a budget reset.
    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && matches!(self.budget_reset_at, Some(at) if at <= now)
    }

    pub fn auto_rotate(&self) -> bool {
        self.metadata
            .get(META_AUTO_ROTATE)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn rotation_count(&self) -> i64 {
        self.metadata
            .get(META_ROTATION_COUNT)
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    pub fn key_rotation_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(META_KEY_ROTATION_AT)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn rotation_interval(&self) -> Option<chrono::Duration> {
        self.metadata
            .get(META_ROTATION_INTERVAL)
            .and_then(|v| v.as_str())
            .and_then(crate::duration::parse_duration)
    }
}

// ── Tests ───────────────────────────────────────────────────────
