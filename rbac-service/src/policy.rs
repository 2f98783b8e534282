//! Static role → scope policy, loaded from configuration at boot.

use std::collections::HashMap;

pub const ROLE_ORGANIZATION_OWNER: &str = "organizationOwner";
pub const ROLE_PROJECT_OWNER: &str = "projectOwner";
pub const ROLE_PROJECT_MEMBER: &str = "projectMember";

/// Immutable mapping from role name to the scopes it may exercise.
///
/// A scope is the `"<resource>.<capability>"` concatenation; the decision is
/// a plain membership test with no wildcards and no hierarchy.
#[derive(Debug, Clone, Default)]
pub struct RoleScopesMap {
    scopes_by_role: HashMap<String, Vec<String>>,
}

impl RoleScopesMap {
    pub fn new(scopes_by_role: HashMap<String, Vec<String>>) -> Self {
        Self { scopes_by_role }
    }

    pub fn allows(&self, role: &str, scope: &str) -> bool {
        self.scopes_by_role
            .get(role)
            .is_some_and(|scopes| scopes.iter().any(|allowed| allowed == scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> RoleScopesMap {
        RoleScopesMap::new(HashMap::from([(
            ROLE_ORGANIZATION_OWNER.to_string(),
            vec!["api.object.read".to_string(), "api.object.write".to_string()],
        )]))
    }

    #[test]
    fn allows_is_a_membership_test() {
        let map = map();
        assert!(map.allows(ROLE_ORGANIZATION_OWNER, "api.object.read"));
        assert!(map.allows(ROLE_ORGANIZATION_OWNER, "api.object.write"));
        assert!(!map.allows(ROLE_ORGANIZATION_OWNER, "api.object.delete"));
        assert!(!map.allows(ROLE_PROJECT_OWNER, "api.object.read"));
        assert!(!map.allows(ROLE_ORGANIZATION_OWNER, "api.object"));
    }
}
