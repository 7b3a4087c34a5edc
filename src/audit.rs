//! Audit logging for sensitive mutations.
//!
//! Every entity CRUD, block/unblock, login attempt, budget change, and
//! config update records an entry. Writes are fired off the request path.
//! When the logger is disabled it never touches the store at all.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::models::audit::{AuditAction, AuditLog, FieldChange};
use crate::store::{AuditFilter, AuditStats, GatewayStore};

/// Everything a caller knows about one auditable event. The logger fills
/// in the id, timestamp, and computed diff.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub actor_id: String,
    pub actor_type: String,
    pub actor_email: Option<String>,
    pub actor_ip: Option<String>,
    pub action: Option<AuditAction>,
    pub object_type: String,
    pub object_id: String,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    pub before: Option<HashMap<String, serde_json::Value>>,
    pub after: Option<HashMap<String, serde_json::Value>>,
    pub request_id: Option<String>,
    pub user_agent: Option<String>,
    pub uri: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        AuditEvent {
            action: Some(action),
            object_type: object_type.into(),
            object_id: object_id.into(),
            actor_type: "system".into(),
            success: true,
            ..Default::default()
        }
    }

    pub fn actor(mut self, id: impl Into<String>, actor_type: impl Into<String>) -> Self {
        self.actor_id = id.into();
        self.actor_type = actor_type.into();
        self
    }

    pub fn before_after(
        mut self,
        before: Option<HashMap<String, serde_json::Value>>,
        after: Option<HashMap<String, serde_json::Value>>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Append-only event recorder over the store.
pub struct AuditLogger {
    store: Arc<dyn GatewayStore>,
    enabled: bool,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn GatewayStore>, enabled: bool) -> Self {
        AuditLogger { store, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fire-and-forget: builds the entry and spawns the insert so the
    /// request path never waits on audit I/O.
    pub fn log(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }
        let store = self.store.clone();
        let entry = build_entry(event);
        tokio::spawn(async move {
            if let Err(e) = store.insert_audit_log(&entry).await {
                tracing::error!(audit_id = %entry.id, "failed to write audit log: {}", e);
            }
        });
    }

    /// Synchronous variant for call sites that must not lose the entry
    /// (e.g. CLI commands that exit immediately after).
    pub async fn log_sync(&self, event: AuditEvent) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let entry = build_entry(event);
        self.store.insert_audit_log(&entry).await
    }

    pub async fn query(&self, filter: &AuditFilter) -> anyhow::Result<Vec<AuditLog>> {
        self.store.query_audit_logs(filter).await
    }

    pub async fn stats(&self, filter: &AuditFilter) -> anyhow::Result<AuditStats> {
        self.store.audit_log_stats(filter).await
    }

    /// Retention sweep: drop entries older than the cutoff.
    pub async fn delete_older_than(&self, cutoff: chrono::DateTime<Utc>) -> anyhow::Result<u64> {
        self.store.delete_audit_logs(cutoff).await
    }
}

fn build_entry(event: AuditEvent) -> AuditLog {
    let diff = calculate_diff(event.before.as_ref(), event.after.as_ref());
    AuditLog {
        id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        actor_id: event.actor_id,
        actor_type: event.actor_type,
        actor_email: event.actor_email,
        actor_ip: event.actor_ip,
        action: event.action.unwrap_or(AuditAction::ConfigUpdated),
        object_type: event.object_type,
        object_id: event.object_id,
        team_id: event.team_id,
        org_id: event.org_id,
        before: event.before,
        after: event.after,
        diff,
        request_id: event.request_id,
        user_agent: event.user_agent,
        uri: event.uri,
        success: event.success,
        error: event.error,
        metadata: event.metadata,
    }
}

/// Field-wise three-way diff: an entry for every key whose value changed,
/// every key only in `after`, and every key only in `before`.
pub fn calculate_diff(
    before: Option<&HashMap<String, serde_json::Value>>,
    after: Option<&HashMap<String, serde_json::Value>>,
) -> HashMap<String, FieldChange> {
    let empty = HashMap::new();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);

    let mut diff = HashMap::new();
    for (k, b) in before {
        match after.get(k) {
            Some(a) if a == b => {}
            other => {
                diff.insert(
                    k.clone(),
                    FieldChange {
                        before: Some(b.clone()),
                        after: other.cloned(),
                    },
                );
            }
        }
    }
    for (k, a) in after {
        if !before.contains_key(k) {
            diff.insert(
                k.clone(),
                FieldChange {
                    before: None,
                    after: Some(a.clone()),
                },
            );
        }
    }
    diff
}

// ── Tests ───────────────────────────────────────────────────────
