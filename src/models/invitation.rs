//! Invitation links — shared credentials whose acceptance creates
//! tenant memberships.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An invitation link. Only the token's hash is stored, with the same
/// construction as API-key credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationLink {
    pub id: String,
    pub token_hash: String,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    /// Role granted to memberships created through this link.
    pub role: String,
    /// 0 = unlimited.
    pub max_uses: i64,
    pub current_uses: i64,
    pub budget_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InvitationLink {
    /// Valid iff active, not expired, and not exhausted.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.expires_at.map_or(true, |exp| now < exp)
            && (self.max_uses == 0 || self.current_uses < self.max_uses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn link() -> InvitationLink {
        let now = Utc::now();
        InvitationLink {
            id: "inv1".into(),
            token_hash: "hash".into(),
            team_id: Some("t1".into()),
            org_id: None,
            role: "member".into(),
            max_uses: 0,
            current_uses: 0,
            budget_id: None,
            expires_at: None,
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_valid_unlimited() {
        let l = link();
        assert!(l.is_valid(Utc::now()));
    }

    #[test]
    fn test_invalid_when_inactive() {
        let mut l = link();
        l.is_active = false;
        assert!(!l.is_valid(Utc::now()));
    }

    #[test]
    fn test_invalid_when_expired() {
        let now = Utc::now();
        let mut l = link();
        l.expires_at = Some(now - Duration::seconds(1));
        assert!(!l.is_valid(now));
        l.expires_at = Some(now + Duration::hours(1));
        assert!(l.is_valid(now));
    }

    #[test]
    fn test_invalid_when_exhausted() {
        let mut l = link();
        l.max_uses = 2;
        l.current_uses = 1;
        assert!(l.is_valid(Utc::now()));
        l.current_uses = 2;
        assert!(!l.is_valid(Utc::now()));
    }

    #[test]
    fn test_zero_max_uses_is_unlimited() {
        let mut l = link();
        l.max_uses = 0;
        l.current_uses = 10_000;
        assert!(l.is_valid(Utc::now()));
    }
}
