//! Invitation links: creation, acceptance, deactivation.
//!
//! An invitation is a single shared credential whose acceptance creates
//! tenant memberships. Tokens use the same construction as API-key
//! credentials and only their hash is stored.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::credentials;
use crate::models::{InvitationLink, OrganizationMembership, TeamMembership};
use crate::store::GatewayStore;

/// Parameters for a new invitation link.
#[derive(Debug, Clone, Default)]
pub struct CreateInvitation {
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    /// Role granted to memberships created through the link.
    pub role: String,
    /// 0 = unlimited.
    pub max_uses: i64,
    pub expires_in: Option<chrono::Duration>,
    pub budget_id: Option<String>,
    pub created_by: Option<String>,
}

/// Outcome of an acceptance attempt. Unknown or invalid tokens come back
/// as `success = false` with a human-readable message, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptanceResult {
    pub success: bool,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    pub role: Option<String>,
    pub message: String,
}

impl AcceptanceResult {
    fn rejected(message: impl Into<String>) -> Self {
        AcceptanceResult {
            success: false,
            team_id: None,
            org_id: None,
            role: None,
            message: message.into(),
        }
    }
}

pub struct InvitationService {
    store: Arc<dyn GatewayStore>,
    credential_prefix: String,
}

impl InvitationService {
    pub fn new(store: Arc<dyn GatewayStore>, credential_prefix: impl Into<String>) -> Self {
        InvitationService {
            store,
            credential_prefix: credential_prefix.into(),
        }
    }

    /// Create a link. Returns the stored link plus the plaintext token —
    /// the only time the token exists outside the caller's hands.
    pub async fn create(&self, req: CreateInvitation) -> anyhow::Result<(InvitationLink, String)> {
        if req.team_id.is_none() && req.org_id.is_none() {
            anyhow::bail!("invitation must target a team or an organization");
        }
        if req.max_uses < 0 {
            anyhow::bail!("max_uses must be zero (unlimited) or positive");
        }

        let minted = credentials::mint(&self.credential_prefix);
        let now = Utc::now();
        let link = InvitationLink {
            id: Uuid::new_v4().to_string(),
            token_hash: minted.hash,
            team_id: req.team_id,
            org_id: req.org_id,
            role: if req.role.is_empty() {
                "member".to_string()
            } else {
                req.role
            },
            max_uses: req.max_uses,
            current_uses: 0,
            budget_id: req.budget_id,
            expires_at: req.expires_in.map(|d| now + d),
            is_active: true,
            created_by: req.created_by,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_invitation(&link).await?;
        Ok((link, minted.token))
    }

    /// Accept a link on behalf of a user. Membership insertion is
    /// idempotent; the use counter increments best-effort.
    pub async fn accept(&self, token: &str, user_id: &str) -> anyhow::Result<AcceptanceResult> {
        let hash = credentials::hash_credential(token.trim());
        let Some(link) = self.store.get_invitation_by_hash(&hash).await? else {
            return Ok(AcceptanceResult::rejected("unknown invitation token"));
        };

        if !link.is_valid(Utc::now()) {
            return Ok(AcceptanceResult::rejected(
                "invitation is expired, exhausted, or deactivated",
            ));
        }

        if let Some(team_id) = &link.team_id {
            if self
                .store
                .get_team_membership(user_id, team_id)
                .await?
                .is_none()
            {
                let mut membership = TeamMembership::new(user_id, team_id, &link.role);
                membership.budget_id = link.budget_id.clone();
                self.store.insert_team_membership(&membership).await?;
            }
        }

        if let Some(org_id) = &link.org_id {
            if self
                .store
                .get_org_membership(user_id, org_id)
                .await?
                .is_none()
            {
                let mut membership = OrganizationMembership::new(user_id, org_id, &link.role);
                membership.budget_id = link.budget_id.clone();
                self.store.insert_org_membership(&membership).await?;
            }
        }

        if let Err(e) = self.store.increment_invitation_uses(&link.id).await {
            tracing::warn!(invitation_id = %link.id, "failed to increment invitation uses: {}", e);
        }

        Ok(AcceptanceResult {
            success: true,
            team_id: link.team_id.clone(),
            org_id: link.org_id.clone(),
            role: Some(link.role.clone()),
            message: "invitation accepted".into(),
        })
    }

    /// Deactivate a link; acceptance attempts start failing immediately.
    pub async fn deactivate(&self, id: &str) -> anyhow::Result<()> {
        let mut link = self
            .store
            .get_invitation(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("invitation {} not found", id))?;
        link.is_active = false;
        self.store.update_invitation(&link).await
    }
}

// ── Tests ───────────────────────────────────────────────────────
