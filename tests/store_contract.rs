//! Persistence-contract properties, exercised against the in-memory
//! backend. Each property is written against the `GatewayStore` trait so
//! the same assertions hold for any conforming backend.
//!
//! These tests are deliberate about negative cases: a mutation of a value
//! returned from the store must NOT show up on the next read, and default
//! list paths must NOT show soft-deleted rows.

use std::sync::Arc;

use chrono::{Duration, Utc};
use llmux::duration::BudgetDuration;
use llmux::models::{ApiKey, AuditAction, AuditLog, Budget, EndUser, InvitationLink, Team, TeamMembership, UsageLog, User};
use llmux::store::memory::MemoryStore;
use llmux::store::{AuditFilter, GatewayStore, KeyFilter, ListFilter, MembershipFilter, UsageFilter};

fn store() -> Arc<dyn GatewayStore> {
    Arc::new(MemoryStore::new())
}

fn key(id: &str, hash: &str) -> ApiKey {
    let mut k = ApiKey::new(id, hash, "llmux_ab");
    k.name = format!("key-{}", id);
    k
}

fn audit_entry(actor: &str, action: AuditAction, object_type: &str) -> AuditLog {
    AuditLog {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        actor_id: actor.into(),
        actor_type: "user".into(),
        actor_email: None,
        actor_ip: None,
        action,
        object_type: object_type.into(),
        object_id: "obj".into(),
        team_id: None,
        org_id: None,
        before: None,
        after: None,
        diff: Default::default(),
        request_id: None,
        user_agent: None,
        uri: None,
        success: true,
        error: None,
        metadata: Default::default(),
    }
}

// ── Read-after-write and deep copies ────────────────────────────

#[tokio::test]
async fn test_read_after_write_equality() {
    let s = store();
    let mut k = key("k1", "h1");
    k.allowed_models = vec!["gpt-4".into(), "claude-3*".into()];
    k.model_spend.insert("gpt-4".into(), 1.25);
    k.metadata.insert("env".into(), serde_json::json!("prod"));
    k.budget_duration = BudgetDuration::Weekly;
    s.insert_api_key(&k).await.unwrap();

    let read = s.get_api_key("k1").await.unwrap().unwrap();
    assert_eq!(read.allowed_models, k.allowed_models);
    assert_eq!(read.model_spend, k.model_spend);
    assert_eq!(read.metadata, k.metadata);
    assert_eq!(read.budget_duration, k.budget_duration);
    assert_eq!(read.key_hash, k.key_hash);
}

#[tokio::test]
async fn test_caller_mutation_cannot_corrupt_store() {
    let s = store();
    let mut team = Team::new("t1");
    team.allowed_models = vec!["gpt-4".into()];
    team.model_spend.insert("gpt-4".into(), 2.0);
    s.insert_team(&team).await.unwrap();

    let mut first = s.get_team("t1").await.unwrap().unwrap();
    first.allowed_models.push("claude-3".into());
    first.model_spend.insert("claude-3".into(), 99.0);
    first.metadata.insert("hacked".into(), serde_json::json!(true));

    let second = s.get_team("t1").await.unwrap().unwrap();
    assert_eq!(second.allowed_models, vec!["gpt-4".to_string()]);
    assert_eq!(second.model_spend.len(), 1);
    assert!(second.metadata.is_empty());
}

#[tokio::test]
async fn test_list_results_are_independent_copies() {
    let s = store();
    let mut k = key("k1", "h1");
    k.allowed_models = vec!["gpt-4".into()];
    s.insert_api_key(&k).await.unwrap();

    let mut listed = s.list_api_keys(&KeyFilter::default()).await.unwrap();
    listed[0].allowed_models.clear();

    let reread = s.list_api_keys(&KeyFilter::default()).await.unwrap();
    assert_eq!(reread[0].allowed_models, vec!["gpt-4".to_string()]);
}

// ── Uniqueness ──────────────────────────────────────────────────

#[tokio::test]
async fn test_hash_unique_across_active_keys() {
    let s = store();
    s.insert_api_key(&key("k1", "same-hash")).await.unwrap();
    assert!(s.insert_api_key(&key("k2", "same-hash")).await.is_err());

    // After soft-deleting the holder the hash is free again.
    s.delete_api_key("k1").await.unwrap();
    assert!(s.insert_api_key(&key("k2", "same-hash")).await.is_ok());
}

#[tokio::test]
async fn test_membership_composite_key_unique() {
    let s = store();
    s.insert_team_membership(&TeamMembership::new("u1", "t1", "member"))
        .await
        .unwrap();
    assert!(s
        .insert_team_membership(&TeamMembership::new("u1", "t1", "admin"))
        .await
        .is_err());
    // Different team is fine.
    assert!(s
        .insert_team_membership(&TeamMembership::new("u1", "t2", "member"))
        .await
        .is_ok());
}

// ── Soft delete ─────────────────────────────────────────────────

#[tokio::test]
async fn test_soft_delete_hides_but_preserves() {
    let s = store();
    let mut user = User::new("u1");
    user.email = Some("u1@example.com".into());
    s.insert_user(&user).await.unwrap();
    s.delete_user("u1").await.unwrap();

    // Hidden from the default list path.
    assert!(s.list_users(&ListFilter::default()).await.unwrap().is_empty());
    // Visible as a tombstone on request.
    let all = s
        .list_users(&ListFilter {
            include_inactive: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert!(!all[0].is_active);
    // Direct get still resolves.
    assert!(s.get_user("u1").await.unwrap().is_some());
    // Email lookup only matches active users.
    assert!(s.get_user_by_email("u1@example.com").await.unwrap().is_none());
}

// ── Spend accounting ────────────────────────────────────────────

#[tokio::test]
async fn test_spend_is_additive_under_concurrency() {
    let s = store();
    s.insert_api_key(&key("k1", "h1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let s = s.clone();
        handles.push(tokio::spawn(async move {
            s.add_key_spend("k1", Some("gpt-4"), 0.5).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let k = s.get_api_key("k1").await.unwrap().unwrap();
    assert!((k.spend - 10.0).abs() < 1e-9);
    assert!((k.model_spend["gpt-4"] - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_reset_zeroes_spend_and_sets_next() {
    let s = store();
    let mut k = key("k1", "h1");
    k.spend = 42.0;
    k.model_spend.insert("gpt-4".into(), 42.0);
    s.insert_api_key(&k).await.unwrap();

    let next = Utc::now() + Duration::days(1);
    s.reset_key_budget("k1", Some(next)).await.unwrap();
    let k = s.get_api_key("k1").await.unwrap().unwrap();
    assert_eq!(k.spend, 0.0);
    assert!(k.model_spend.is_empty());
    assert_eq!(k.budget_reset_at, Some(next));
}

#[tokio::test]
async fn test_due_for_reset_queries() {
    let s = store();
    let now = Utc::now();

    let mut due = key("due", "h1");
    due.budget_duration = BudgetDuration::Daily;
    due.budget_reset_at = Some(now - Duration::minutes(1));
    s.insert_api_key(&due).await.unwrap();

    let mut later = key("later", "h2");
    later.budget_duration = BudgetDuration::Daily;
    later.budget_reset_at = Some(now + Duration::hours(1));
    s.insert_api_key(&later).await.unwrap();

    let mut inactive = key("inactive", "h3");
    inactive.budget_reset_at = Some(now - Duration::minutes(1));
    s.insert_api_key(&inactive).await.unwrap();
    s.delete_api_key("inactive").await.unwrap();

    let due_keys = s.keys_due_for_reset(now).await.unwrap();
    assert_eq!(due_keys.len(), 1);
    assert_eq!(due_keys[0].id, "due");
}

#[tokio::test]
async fn test_end_user_spend_and_block_flag() {
    let s = store();
    let mut eu = EndUser::new("cust-1");
    eu.blocked = true;
    s.insert_end_user(&eu).await.unwrap();
    s.add_end_user_spend("cust-1", 3.5).await.unwrap();

    let read = s.get_end_user("cust-1").await.unwrap().unwrap();
    assert_eq!(read.spend, 3.5);
    assert!(read.blocked);
}

// ── Invitations ─────────────────────────────────────────────────

#[tokio::test]
async fn test_invitation_hash_lookup_and_use_counting() {
    let s = store();
    let now = Utc::now();
    let link = InvitationLink {
        id: "inv1".into(),
        token_hash: "hash-abc".into(),
        team_id: Some("t1".into()),
        org_id: None,
        role: "member".into(),
        max_uses: 2,
        current_uses: 0,
        budget_id: None,
        expires_at: None,
        is_active: true,
        created_by: None,
        created_at: now,
        updated_at: now,
    };
    s.insert_invitation(&link).await.unwrap();

    assert!(s.get_invitation_by_hash("hash-abc").await.unwrap().is_some());
    assert!(s.get_invitation_by_hash("other").await.unwrap().is_none());

    s.increment_invitation_uses("inv1").await.unwrap();
    s.increment_invitation_uses("inv1").await.unwrap();
    let link = s.get_invitation("inv1").await.unwrap().unwrap();
    assert_eq!(link.current_uses, 2);
    assert!(!link.is_valid(Utc::now()));
}

// ── Budgets ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_budget_crud_roundtrip() {
    let s = store();
    let mut b = Budget::new("b1");
    b.max_budget = Some(500.0);
    b.budget_duration = BudgetDuration::Monthly;
    b.model_max_budget.insert("gpt-4".into(), 100.0);
    s.insert_budget(&b).await.unwrap();

    let read = s.get_budget("b1").await.unwrap().unwrap();
    assert_eq!(read.max_budget, Some(500.0));
    assert_eq!(read.model_max_budget["gpt-4"], 100.0);

    s.delete_budget("b1").await.unwrap();
    assert!(s.list_budgets(&ListFilter::default()).await.unwrap().is_empty());
}

// ── Audit and usage logs ────────────────────────────────────────

#[tokio::test]
async fn test_audit_filtering_and_stats() {
    let s = store();
    s.insert_audit_log(&audit_entry("alice", AuditAction::KeyGenerated, "api_key"))
        .await
        .unwrap();
    s.insert_audit_log(&audit_entry("alice", AuditAction::KeyDeleted, "api_key"))
        .await
        .unwrap();
    s.insert_audit_log(&audit_entry("bob", AuditAction::TeamCreated, "team"))
        .await
        .unwrap();

    let alice_only = s
        .query_audit_logs(&AuditFilter {
            actor_id: Some("alice".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alice_only.len(), 2);

    let creations = s
        .query_audit_logs(&AuditFilter {
            action: Some(AuditAction::TeamCreated),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(creations.len(), 1);
    assert_eq!(creations[0].actor_id, "bob");

    let stats = s.audit_log_stats(&AuditFilter::default()).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.unique_actors, 2);
    assert_eq!(stats.by_object_type["api_key"], 2);
    assert_eq!(stats.by_action["team_created"], 1);
}

#[tokio::test]
async fn test_audit_retention() {
    let s = store();
    let mut old = audit_entry("alice", AuditAction::KeyGenerated, "api_key");
    old.timestamp = Utc::now() - Duration::days(120);
    s.insert_audit_log(&old).await.unwrap();
    s.insert_audit_log(&audit_entry("alice", AuditAction::KeyUpdated, "api_key"))
        .await
        .unwrap();

    let removed = s
        .delete_audit_logs(Utc::now() - Duration::days(90))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let remaining = s.query_audit_logs(&AuditFilter::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].action, AuditAction::KeyUpdated);
}

#[tokio::test]
async fn test_usage_log_query_by_key_and_limit() {
    let s = store();
    for i in 0..5 {
        let mut u = UsageLog::new(format!("req-{}", i), "k1", "gpt-4");
        u.spend = 0.1;
        s.insert_usage_log(&u).await.unwrap();
    }
    let mut other = UsageLog::new("req-x", "k2", "claude-3");
    other.spend = 0.2;
    s.insert_usage_log(&other).await.unwrap();

    let k1_logs = s
        .query_usage_logs(&UsageFilter {
            api_key_id: Some("k1".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(k1_logs.len(), 5);

    let limited = s
        .query_usage_logs(&UsageFilter {
            api_key_id: Some("k1".into()),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

// ── Membership listings ─────────────────────────────────────────

#[tokio::test]
async fn test_membership_listing_by_either_side() {
    let s = store();
    s.insert_team_membership(&TeamMembership::new("u1", "t1", "member"))
        .await
        .unwrap();
    s.insert_team_membership(&TeamMembership::new("u1", "t2", "member"))
        .await
        .unwrap();
    s.insert_team_membership(&TeamMembership::new("u2", "t1", "admin"))
        .await
        .unwrap();

    let by_user = s
        .list_team_memberships(&MembershipFilter {
            user_id: Some("u1".into()),
            scope_id: None,
        })
        .await
        .unwrap();
    assert_eq!(by_user.len(), 2);

    let by_team = s
        .list_team_memberships(&MembershipFilter {
            user_id: None,
            scope_id: Some("t1".into()),
        })
        .await
        .unwrap();
    assert_eq!(by_team.len(), 2);

    s.delete_team_membership("u1", "t1").await.unwrap();
    assert!(s.get_team_membership("u1", "t1").await.unwrap().is_none());
    assert!(s.get_team_membership("u2", "t1").await.unwrap().is_some());
}
