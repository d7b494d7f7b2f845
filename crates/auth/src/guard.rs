//! Access guard: the check a caller runs before a privileged operation.
//!
//! Callers name permissions by key (`"reservation.create.property"`); the
//! guard resolves keys against the catalog and delegates the decision to the
//! resolver. It never mutates state.

use serde::Serialize;
use tracing::{debug, error};

use staybase_core::{PermissionId, UserId};

use crate::catalog::PermissionCatalog;
use crate::error::{AuthError, AuthResult};
use crate::permissions::{Permission, PermissionKey};
use crate::resolver::{AccessSnapshot, PermissionResolver};
use crate::roles::TenantContext;
use crate::store::{OverrideStore, PermissionStore, RoleStore, UserDirectory};

/// Why a check denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DenialReason {
    /// The key is malformed or absent from the catalog.
    PermissionKeyUnknown(String),
    PermissionDenied(PermissionKey),
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::PermissionKeyUnknown(key) => write!(f, "permission key unknown: {key}"),
            DenialReason::PermissionDenied(key) => write!(f, "missing permission '{key}'"),
        }
    }
}

impl From<DenialReason> for AuthError {
    fn from(value: DenialReason) -> Self {
        match value {
            DenialReason::PermissionKeyUnknown(key) => AuthError::PermissionKeyUnknown(key),
            DenialReason::PermissionDenied(key) => AuthError::PermissionDenied(key.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenialReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Turn a denial into an error.
    pub fn into_result(self) -> AuthResult<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(reason.into()),
        }
    }
}

/// Operation-side authorization contract.
///
/// Implement this on operations that require permissions; the boundary
/// enforces the requirements before running them.
pub trait RequiresPermissions {
    fn required_permissions(&self) -> &[&'static str];
}

pub struct AccessGuard<S> {
    catalog: PermissionCatalog<S>,
    resolver: PermissionResolver<S>,
}

impl<S> Clone for AccessGuard<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<S> AccessGuard<S>
where
    S: PermissionStore + RoleStore + OverrideStore + UserDirectory,
{
    pub fn new(catalog: PermissionCatalog<S>, resolver: PermissionResolver<S>) -> Self {
        Self { catalog, resolver }
    }

    pub async fn check(&self, user_id: UserId, key: &str) -> AuthResult<Decision> {
        self.check_all(user_id, &[key]).await
    }

    /// Logical AND over `keys`.
    ///
    /// Every key is resolved before anything is evaluated, so an unknown key
    /// is reported even when another key would have been denied.
    pub async fn check_all(&self, user_id: UserId, keys: &[&str]) -> AuthResult<Decision> {
        let permissions = match self.resolve_keys(keys).await? {
            Ok(permissions) => permissions,
            Err(reason) => return Ok(Decision::Deny(reason)),
        };
        let snapshot = self.resolver.snapshot(user_id).await?;
        Ok(decide_all(&snapshot, &permissions, |p| snapshot.evaluate(p.id).allowed))
    }

    /// Like [`Self::check`], with role grants limited to `ctx`.
    pub async fn check_within(
        &self,
        user_id: UserId,
        key: &str,
        ctx: &TenantContext,
    ) -> AuthResult<Decision> {
        let permissions = match self.resolve_keys(&[key]).await? {
            Ok(permissions) => permissions,
            Err(reason) => return Ok(Decision::Deny(reason)),
        };
        let snapshot = self.resolver.snapshot(user_id).await?;
        Ok(decide_all(&snapshot, &permissions, |p| {
            snapshot.evaluate_within(p.id, ctx).allowed
        }))
    }

    pub async fn require(&self, user_id: UserId, key: &str) -> AuthResult<()> {
        self.check(user_id, key).await?.into_result()
    }

    pub async fn require_all(&self, user_id: UserId, keys: &[&str]) -> AuthResult<()> {
        self.check_all(user_id, keys).await?.into_result()
    }

    pub async fn require_within(
        &self,
        user_id: UserId,
        key: &str,
        ctx: &TenantContext,
    ) -> AuthResult<()> {
        self.check_within(user_id, key, ctx).await?.into_result()
    }

    /// Check an operation's declared requirements.
    ///
    /// This is intended to be called **before** running the operation.
    pub async fn authorize_operation<O>(&self, user_id: UserId, operation: &O) -> AuthResult<()>
    where
        O: RequiresPermissions + ?Sized,
    {
        self.require_all(user_id, operation.required_permissions()).await
    }

    /// Whether the user is allowed every id in `permission_ids`.
    pub async fn allows_all<I>(&self, user_id: UserId, permission_ids: I) -> AuthResult<bool>
    where
        I: IntoIterator<Item = PermissionId>,
    {
        let snapshot = self.resolver.snapshot(user_id).await?;
        Ok(permission_ids
            .into_iter()
            .all(|id| snapshot.evaluate(id).allowed))
    }

    /// `Err(reason)` for the first key that is malformed or not in the catalog.
    async fn resolve_keys(
        &self,
        keys: &[&str],
    ) -> AuthResult<Result<Vec<Permission>, DenialReason>> {
        let mut permissions = Vec::with_capacity(keys.len());
        for raw in keys {
            let key = match raw.parse::<PermissionKey>() {
                Ok(key) => key,
                Err(e) => {
                    error!(key = %raw, error = %e, "malformed permission key in access check");
                    return Ok(Err(DenialReason::PermissionKeyUnknown((*raw).to_string())));
                }
            };
            match self.catalog.find_key(&key).await? {
                Some(permission) => permissions.push(permission),
                None => {
                    error!(%key, "access check names a permission missing from the catalog");
                    return Ok(Err(DenialReason::PermissionKeyUnknown(key.to_string())));
                }
            }
        }
        Ok(Ok(permissions))
    }
}

fn decide_all<F>(snapshot: &AccessSnapshot, permissions: &[Permission], allowed: F) -> Decision
where
    F: Fn(&Permission) -> bool,
{
    for permission in permissions {
        if !allowed(permission) {
            debug!(user_id = %snapshot.user_id, key = %permission.key, "access denied");
            return Decision::Deny(DenialReason::PermissionDenied(permission.key.clone()));
        }
    }
    Decision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_maps_to_error() {
        let key: PermissionKey = "guest.read.property".parse().unwrap();
        assert_eq!(
            Decision::Deny(DenialReason::PermissionDenied(key)).into_result(),
            Err(AuthError::PermissionDenied("guest.read.property".into()))
        );
        assert_eq!(
            Decision::Deny(DenialReason::PermissionKeyUnknown("nope".into())).into_result(),
            Err(AuthError::PermissionKeyUnknown("nope".into()))
        );
        assert!(Decision::Allow.into_result().is_ok());
    }

    #[test]
    fn decision_serializes_with_reason() {
        let json = serde_json::to_value(Decision::Deny(DenialReason::PermissionKeyUnknown(
            "x.y".into(),
        )))
        .unwrap();
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["reason"]["kind"], "permission_key_unknown");
    }
}
