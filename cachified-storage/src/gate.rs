//! Force-fresh gate.
//!
//! Decides whether a key must bypass cached data for one call. A programmatic
//! override wins. Otherwise a designated query parameter is honoured, but
//! only for administrators, so ordinary callers cannot bust the cache.

use std::sync::Arc;

use cachified_core::{split_key_list, ForceFresh, Principal, RequestContext};
use tracing::debug;

/// Authorization collaborator: is this principal an administrator?
pub trait Authorizer: Send + Sync {
    fn is_admin(&self, principal: &Principal) -> bool;
}

/// Grants admin to principals holding one role.
#[derive(Debug, Clone)]
pub struct RoleAuthorizer {
    role: String,
}

impl RoleAuthorizer {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl Default for RoleAuthorizer {
    fn default() -> Self {
        Self::new("ADMIN")
    }
}

impl Authorizer for RoleAuthorizer {
    fn is_admin(&self, principal: &Principal) -> bool {
        principal.has_role(&self.role)
    }
}

#[derive(Clone)]
pub struct ForceFreshGate {
    param: String,
    authorizer: Arc<dyn Authorizer>,
}

impl ForceFreshGate {
    pub fn new(param: impl Into<String>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            param: param.into(),
            authorizer,
        }
    }

    pub fn param(&self) -> &str {
        &self.param
    }

    /// Whether `key` must be produced fresh for this call.
    ///
    /// An empty parameter value bypasses every key; a comma-separated value
    /// bypasses only the listed keys.
    pub fn should_force_fresh(
        &self,
        request: Option<&RequestContext>,
        key: &str,
        explicit: Option<&ForceFresh>,
    ) -> bool {
        if let Some(explicit) = explicit {
            return explicit.applies_to(key);
        }

        let Some(request) = request else {
            return false;
        };
        let Some(value) = request.query_param(&self.param) else {
            return false;
        };

        let is_admin = request
            .principal()
            .is_some_and(|principal| self.authorizer.is_admin(principal));
        if !is_admin {
            debug!(key, param = %self.param, "Ignoring force-fresh from non-admin request");
            return false;
        }

        if value.trim().is_empty() {
            return true;
        }
        split_key_list(value).iter().any(|k| k == key)
    }
}

impl Default for ForceFreshGate {
    fn default() -> Self {
        Self::new("fresh", Arc::new(RoleAuthorizer::default()))
    }
}

impl std::fmt::Debug for ForceFreshGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceFreshGate")
            .field("param", &self.param)
            .finish_non_exhaustive()
    }
}
