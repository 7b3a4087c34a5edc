//! IdP claim → internal role resolution.

use serde::{Deserialize, Serialize};

use crate::models::UserRole;

/// Per-role sets of IdP claim values. Resolution scans in hierarchy order
/// and returns the first role whose claim set intersects the caller's
/// claim roles; the default role applies when nothing matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMappings {
    pub proxy_admin: Vec<String>,
    pub proxy_admin_viewer: Vec<String>,
    pub org_admin: Vec<String>,
    pub internal_user: Vec<String>,
    pub internal_user_viewer: Vec<String>,
    pub team: Vec<String>,
    pub default_role: UserRole,
}

impl Default for RoleMappings {
    fn default() -> Self {
        RoleMappings {
            proxy_admin: Vec::new(),
            proxy_admin_viewer: Vec::new(),
            org_admin: Vec::new(),
            internal_user: Vec::new(),
            internal_user_viewer: Vec::new(),
            team: Vec::new(),
            default_role: UserRole::InternalUser,
        }
    }
}

impl RoleMappings {
    pub fn resolve(&self, claim_roles: &[String]) -> UserRole {
        let hierarchy: [(&Vec<String>, UserRole); 6] = [
            (&self.proxy_admin, UserRole::ProxyAdmin),
            (&self.proxy_admin_viewer, UserRole::ProxyAdminViewer),
            (&self.org_admin, UserRole::OrgAdmin),
            (&self.internal_user, UserRole::InternalUser),
            (&self.internal_user_viewer, UserRole::InternalUserViewer),
            (&self.team, UserRole::Team),
        ];
        for (claims, role) in hierarchy {
            if claims.iter().any(|c| claim_roles.contains(c)) {
                return role;
            }
        }
        self.default_role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> RoleMappings {
        RoleMappings {
            proxy_admin: vec!["idp-admins".into()],
            org_admin: vec!["idp-org-leads".into(), "idp-managers".into()],
            internal_user: vec!["idp-engineers".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_first_match_in_hierarchy_wins() {
        let m = mappings();
        // Member of both admin and engineer groups: admin wins.
        let roles = vec!["idp-engineers".to_string(), "idp-admins".to_string()];
        assert_eq!(m.resolve(&roles), UserRole::ProxyAdmin);
    }

    #[test]
    fn test_single_match() {
        let m = mappings();
        assert_eq!(
            m.resolve(&["idp-managers".to_string()]),
            UserRole::OrgAdmin
        );
    }

    #[test]
    fn test_no_match_uses_default() {
        let m = mappings();
        assert_eq!(m.resolve(&["unrelated".to_string()]), UserRole::InternalUser);
        assert_eq!(m.resolve(&[]), UserRole::InternalUser);
    }

    #[test]
    fn test_custom_default_role() {
        let m = RoleMappings {
            default_role: UserRole::InternalUserViewer,
            ..Default::default()
        };
        assert_eq!(m.resolve(&["anything".to_string()]), UserRole::InternalUserViewer);
    }
}
