//! Periodic reconciliation: budget resets and key rotation.
//!
//! A single runner wakes on a configurable interval (default 1 hour) and
//! runs two sweeps inside a 5-minute cancellation scope:
//! 1. zero the spend of keys/teams/users whose `budget_reset_at` elapsed
//!    and advance the timestamp by the entity's duration;
//! 2. rotate active keys enrolled in auto-rotation whose rotation time is
//!    absent or elapsed.
//!
//! One failing entity never aborts a sweep; errors are logged per entity
//! and the loop continues.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditLogger};
use crate::credentials;
use crate::models::key::{META_KEY_ROTATION_AT, META_LAST_ROTATION_AT, META_ROTATION_COUNT};
use crate::models::{ApiKey, AuditAction};
use crate::store::{GatewayStore, KeyFilter};

/// Hard bound on one reconciliation pass.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Rotation interval applied when an enrolled key's metadata does not
/// specify one.
const DEFAULT_ROTATION_INTERVAL_DAYS: i64 = 30;

/// What one reconciliation cycle accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub keys_reset: usize,
    pub teams_reset: usize,
    pub users_reset: usize,
    pub keys_rotated: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.keys_reset == 0
            && self.teams_reset == 0
            && self.users_reset == 0
            && self.keys_rotated == 0
    }
}

/// The background reconciliation runner.
pub struct ReconcileScheduler {
    store: Arc<dyn GatewayStore>,
    audit: Arc<AuditLogger>,
    credential_prefix: String,
    interval: Duration,
}

impl ReconcileScheduler {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        audit: Arc<AuditLogger>,
        credential_prefix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        ReconcileScheduler {
            store,
            audit,
            credential_prefix: credential_prefix.into(),
            interval,
        }
    }

    /// Spawn the runner. It sweeps on every interval tick until the
    /// shutdown channel fires, finishing the in-flight sweep first.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                "reconciliation scheduler started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match tokio::time::timeout(SWEEP_TIMEOUT, self.run_cycle()).await {
                            Ok(report) => {
                                if !report.is_empty() {
                                    tracing::info!(
                                        keys_reset = report.keys_reset,
                                        teams_reset = report.teams_reset,
                                        users_reset = report.users_reset,
                                        keys_rotated = report.keys_rotated,
                                        "reconciliation cycle complete"
                                    );
                                }
                            }
                            Err(_) => {
                                tracing::error!("reconciliation cycle exceeded its 5-minute scope");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("reconciliation scheduler stopping");
                        return;
                    }
                }
            }
        })
    }

    /// One full pass: budget resets, then key rotation.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        self.reset_due_budgets(&mut report).await;
        report.keys_rotated = self.rotate_due_keys().await;
        report
    }

    async fn reset_due_budgets(&self, report: &mut CycleReport) {
        let now = Utc::now();

        match self.store.keys_due_for_reset(now).await {
            Ok(keys) => {
                for key in keys {
                    let next = key.budget_duration.next_reset(now);
                    match self.store.reset_key_budget(&key.id, next).await {
                        Ok(()) => {
                            report.keys_reset += 1;
                            self.audit.log(
                                AuditEvent::new(AuditAction::BudgetReset, "api_key", &key.id)
                                    .actor("reconciler", "system"),
                            );
                        }
                        Err(e) => {
                            tracing::error!(key_id = %key.id, "key budget reset failed: {}", e)
                        }
                    }
                }
            }
            Err(e) => tracing::error!("querying keys due for reset failed: {}", e),
        }

        match self.store.teams_due_for_reset(now).await {
            Ok(teams) => {
                for team in teams {
                    let next = team.budget_duration.next_reset(now);
                    match self.store.reset_team_budget(&team.id, next).await {
                        Ok(()) => {
                            report.teams_reset += 1;
                            self.audit.log(
                                AuditEvent::new(AuditAction::BudgetReset, "team", &team.id)
                                    .actor("reconciler", "system"),
                            );
                        }
                        Err(e) => {
                            tracing::error!(team_id = %team.id, "team budget reset failed: {}", e)
                        }
                    }
                }
            }
            Err(e) => tracing::error!("querying teams due for reset failed: {}", e),
        }

        match self.store.users_due_for_reset(now).await {
            Ok(users) => {
                for user in users {
                    let next = user.budget_duration.next_reset(now);
                    match self.store.reset_user_budget(&user.id, next).await {
                        Ok(()) => {
                            report.users_reset += 1;
                            self.audit.log(
                                AuditEvent::new(AuditAction::BudgetReset, "user", &user.id)
                                    .actor("reconciler", "system"),
                            );
                        }
                        Err(e) => {
                            tracing::error!(user_id = %user.id, "user budget reset failed: {}", e)
                        }
                    }
                }
            }
            Err(e) => tracing::error!("querying users due for reset failed: {}", e),
        }
    }

    /// Rotate every active key enrolled in auto-rotation whose rotation
    /// time is absent or elapsed. Returns the number rotated.
    pub async fn rotate_due_keys(&self) -> usize {
        let now = Utc::now();
        let keys = match self.store.list_api_keys(&KeyFilter::default()).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!("listing keys for rotation failed: {}", e);
                return 0;
            }
        };

        let mut rotated = 0;
        for key in keys {
            if !key.auto_rotate() {
                continue;
            }
            if matches!(key.key_rotation_at(), Some(at) if at > now) {
                continue;
            }
            match self.rotate_key(&key).await {
                Ok(new_id) => {
                    rotated += 1;
                    tracing::info!(
                        old_key_id = %key.id,
                        new_key_id = %new_id,
                        rotation = key.rotation_count() + 1,
                        "key rotated"
                    );
                }
                Err(e) => {
                    tracing::error!(key_id = %key.id, "key rotation failed: {}", e);
                }
            }
        }
        rotated
    }

    /// Mint a replacement carrying the old key's ownership, access, limits,
    /// and metadata. The old id is soft-deleted before the new key is
    /// inserted; listings tolerate the momentary absence.
    async fn rotate_key(&self, old: &ApiKey) -> anyhow::Result<String> {
        let now = Utc::now();
        let minted = credentials::mint(&self.credential_prefix);
        let interval = old
            .rotation_interval()
            .unwrap_or_else(|| chrono::Duration::days(DEFAULT_ROTATION_INTERVAL_DAYS));

        let mut new_key = old.clone();
        new_key.id = Uuid::new_v4().to_string();
        new_key.key_hash = minted.hash;
        new_key.key_prefix = minted.display_prefix;
        new_key.spend = 0.0;
        new_key.model_spend.clear();
        new_key.created_at = now;
        new_key.updated_at = now;
        new_key.last_used_at = None;
        new_key
            .metadata
            .insert(META_ROTATION_COUNT.into(), serde_json::json!(old.rotation_count() + 1));
        new_key
            .metadata
            .insert(META_LAST_ROTATION_AT.into(), serde_json::json!(now.to_rfc3339()));
        new_key.metadata.insert(
            META_KEY_ROTATION_AT.into(),
            serde_json::json!((now + interval).to_rfc3339()),
        );

        self.store.delete_api_key(&old.id).await?;
        self.store.insert_api_key(&new_key).await?;

        self.audit.log(
            AuditEvent::new(AuditAction::KeyRotated, "api_key", &old.id)
                .actor("reconciler", "system")
                .before_after(
                    Some(std::collections::HashMap::from([(
                        "key_id".to_string(),
                        serde_json::json!(old.id),
                    )])),
                    Some(std::collections::HashMap::from([(
                        "key_id".to_string(),
                        serde_json::json!(new_key.id),
                    )])),
                ),
        );

        Ok(new_key.id)
    }
}

// ── Tests ───────────────────────────────────────────────────────
