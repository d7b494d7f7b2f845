//! Permission resolver: the allow/deny decision engine.
//!
//! Precedence, in strict order:
//! 1. an active override on the permission decides, allow or deny;
//! 2. otherwise membership in the role's effective permission set allows;
//! 3. otherwise deny.
//!
//! The decision itself ([`decide`]) is a pure function. [`PermissionResolver`]
//! only loads the inputs: one [`AccessSnapshot`] per evaluation, no caching.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use staybase_core::{PermissionId, RoleId, UserId};

use crate::error::AuthResult;
use crate::overrides::ActiveOverrides;
use crate::permissions::Permission;
use crate::roles::{RoleScope, TenantContext};
use crate::store::{OverrideStore, RoleStore, UserDirectory};

/// Which source of truth produced a verdict.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionSource {
    Override { granted: bool },
    Role,
    DefaultDeny,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub permission_id: PermissionId,
    pub allowed: bool,
    pub source: DecisionSource,
}

/// Decide one permission from a user's overrides and role permissions.
///
/// - No IO
/// - No panics
/// - Absence of a grant is never permission
pub fn decide(
    required: PermissionId,
    overrides: &ActiveOverrides,
    role_permissions: &BTreeSet<PermissionId>,
) -> Verdict {
    if let Some(granted) = overrides.get(required) {
        return Verdict {
            permission_id: required,
            allowed: granted,
            source: DecisionSource::Override { granted },
        };
    }

    if role_permissions.contains(&required) {
        return Verdict {
            permission_id: required,
            allowed: true,
            source: DecisionSource::Role,
        };
    }

    Verdict {
        permission_id: required,
        allowed: false,
        source: DecisionSource::DefaultDeny,
    }
}

/// The role half of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    pub role_id: RoleId,
    pub name: String,
    pub scope: RoleScope,
    pub is_active: bool,
    /// Already empty when the role is inactive.
    pub permissions: BTreeSet<PermissionId>,
}

/// Everything needed to decide any permission for one user, fetched once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessSnapshot {
    pub user_id: UserId,
    pub role: Option<RoleGrant>,
    pub overrides: ActiveOverrides,
}

impl AccessSnapshot {
    pub fn role_permissions(&self) -> BTreeSet<PermissionId> {
        self.role
            .as_ref()
            .map(|r| r.permissions.clone())
            .unwrap_or_default()
    }

    pub fn evaluate(&self, required: PermissionId) -> Verdict {
        decide(required, &self.overrides, &self.role_permissions())
    }

    /// Evaluate inside a tenant context: role grants count only when the role
    /// scope covers the context. Overrides are not tenant-scoped.
    pub fn evaluate_within(&self, required: PermissionId, ctx: &TenantContext) -> Verdict {
        let role_permissions = match &self.role {
            Some(role) if role.scope.covers(ctx) => role.permissions.clone(),
            _ => BTreeSet::new(),
        };
        decide(required, &self.overrides, &role_permissions)
    }
}

pub struct PermissionResolver<S> {
    store: Arc<S>,
}

impl<S> Clone for PermissionResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> PermissionResolver<S>
where
    S: RoleStore + OverrideStore + UserDirectory,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Load the user's role and active overrides.
    ///
    /// Unknown users and users without a role get an empty role half; a role
    /// id that no longer resolves is treated the same way.
    pub async fn snapshot(&self, user_id: UserId) -> AuthResult<AccessSnapshot> {
        let overrides = self.store.active_overrides(user_id).await?;

        let role = match self.store.role_of(user_id).await? {
            None => None,
            Some(role_id) => match self.store.role(role_id).await? {
                Some(role) => Some(RoleGrant {
                    role_id: role.id,
                    permissions: role.effective_permissions(),
                    name: role.name,
                    scope: role.scope,
                    is_active: role.is_active,
                }),
                None => {
                    warn!(%user_id, %role_id, "user references a role that does not exist");
                    None
                }
            },
        };

        Ok(AccessSnapshot {
            user_id,
            role,
            overrides,
        })
    }

    pub async fn evaluate(&self, user_id: UserId, required: PermissionId) -> AuthResult<Verdict> {
        let verdict = self.snapshot(user_id).await?.evaluate(required);
        debug!(%user_id, permission_id = %required, allowed = verdict.allowed, source = ?verdict.source, "permission resolved");
        Ok(verdict)
    }

    pub async fn is_allowed(&self, user_id: UserId, required: PermissionId) -> AuthResult<bool> {
        Ok(self.evaluate(user_id, required).await?.allowed)
    }

    /// Explain why a permission is (or would be) allowed or denied.
    pub async fn explain(
        &self,
        user_id: UserId,
        permission: &Permission,
    ) -> AuthResult<AuthorizationExplanation> {
        let snapshot = self.snapshot(user_id).await?;
        Ok(explain_snapshot(&snapshot, permission))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (Audit Trail)
// ─────────────────────────────────────────────────────────────────────────────

/// Detailed explanation of an authorization decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub required_permission: String,
    pub granted: bool,
    pub source: DecisionSource,
    /// Human-readable reason for the decision.
    pub reason: String,
    pub principal: PrincipalState,
    /// Empty when access was granted.
    pub suggestions: Vec<String>,
}

/// State of the user at the time of the decision.
#[derive(Debug, Clone, Serialize)]
pub struct PrincipalState {
    pub user_id: UserId,
    pub role_id: Option<RoleId>,
    pub role_name: Option<String>,
    pub role_active: bool,
    pub role_permissions: Vec<PermissionId>,
    pub allow_overrides: Vec<PermissionId>,
    pub deny_overrides: Vec<PermissionId>,
}

pub fn explain_snapshot(snapshot: &AccessSnapshot, permission: &Permission) -> AuthorizationExplanation {
    let verdict = snapshot.evaluate(permission.id);
    let key = permission.key.to_string();

    let mut allow_overrides = Vec::new();
    let mut deny_overrides = Vec::new();
    for (id, granted) in snapshot.overrides.iter() {
        if granted {
            allow_overrides.push(id);
        } else {
            deny_overrides.push(id);
        }
    }
    allow_overrides.sort();
    deny_overrides.sort();

    let principal = PrincipalState {
        user_id: snapshot.user_id,
        role_id: snapshot.role.as_ref().map(|r| r.role_id),
        role_name: snapshot.role.as_ref().map(|r| r.name.clone()),
        role_active: snapshot.role.as_ref().is_some_and(|r| r.is_active),
        role_permissions: snapshot.role_permissions().into_iter().collect(),
        allow_overrides,
        deny_overrides,
    };

    let (reason, suggestions) = match verdict.source {
        DecisionSource::Override { granted: true } => {
            (format!("User holds an explicit allow override for '{key}'"), vec![])
        }
        DecisionSource::Override { granted: false } => (
            format!("User holds an explicit deny override for '{key}', which takes precedence over the role"),
            vec![format!("Deactivate the deny override on '{key}' for this user")],
        ),
        DecisionSource::Role => (
            format!(
                "Role '{}' grants '{key}'",
                principal.role_name.as_deref().unwrap_or_default()
            ),
            vec![],
        ),
        DecisionSource::DefaultDeny => {
            let reason = match &snapshot.role {
                None => format!("User has no role and no override for '{key}'"),
                Some(role) if !role.is_active => {
                    format!("Role '{}' is inactive and grants nothing", role.name)
                }
                Some(role) => format!("Role '{}' does not grant '{key}'", role.name),
            };
            let mut suggestions = vec![
                format!("Assign a role that grants '{key}'"),
                format!("Grant '{key}' to the user through an allow override"),
            ];
            if snapshot.role.as_ref().is_some_and(|r| !r.is_active) {
                suggestions.insert(0, "Reactivate the user's role".to_string());
            }
            (reason, suggestions)
        }
    };

    AuthorizationExplanation {
        required_permission: key,
        granted: verdict.allowed,
        source: verdict.source,
        reason,
        principal,
        suggestions,
    }
}
