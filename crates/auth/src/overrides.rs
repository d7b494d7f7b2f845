//! Per-user permission overrides.
//!
//! An override explicitly grants or denies one permission to one user,
//! independent of the user's role. Rows are never deleted: revocation flips
//! `is_active` so the audit trail survives.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use staybase_core::{PermissionId, UserId};

use crate::error::{AuthError, AuthResult};
use crate::store::{OverrideStore, PermissionStore};

/// One `(user, permission)` override row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionOverride {
    pub user_id: UserId,
    pub permission_id: PermissionId,
    /// `true` is an explicit allow, `false` an explicit deny.
    pub granted: bool,
    pub is_active: bool,
    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,
    pub revoked_by: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}

impl PermissionOverride {
    pub fn new(
        user_id: UserId,
        permission_id: PermissionId,
        granted: bool,
        granted_by: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            permission_id,
            granted,
            is_active: true,
            granted_by,
            granted_at: now,
            revoked_by: None,
            updated_at: now,
        }
    }
}

/// The active overrides of a single user: permission id → granted.
///
/// This is the only override view the resolver consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveOverrides(HashMap<PermissionId, bool>);

impl ActiveOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, permission_id: PermissionId) -> Option<bool> {
        self.0.get(&permission_id).copied()
    }

    pub fn insert(&mut self, permission_id: PermissionId, granted: bool) {
        self.0.insert(permission_id, granted);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PermissionId, bool)> + '_ {
        self.0.iter().map(|(id, granted)| (*id, *granted))
    }
}

impl FromIterator<(PermissionId, bool)> for ActiveOverrides {
    fn from_iter<T: IntoIterator<Item = (PermissionId, bool)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Administrative service over the override store.
pub struct OverrideRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for OverrideRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> OverrideRegistry<S>
where
    S: OverrideStore + PermissionStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Grant (`granted = true`) or deny (`granted = false`) one permission to one user.
    ///
    /// Upserts by `(user_id, permission_id)`: repeating the call, or flipping
    /// `granted`, reuses the same row.
    #[instrument(skip_all, fields(%user_id, %permission_id, granted = granted), err)]
    pub async fn set_override(
        &self,
        user_id: UserId,
        permission_id: PermissionId,
        granted: bool,
        granted_by: UserId,
        now: DateTime<Utc>,
    ) -> AuthResult<PermissionOverride> {
        if self.store.permission(permission_id).await?.is_none() {
            return Err(AuthError::InvalidPermission(permission_id));
        }

        let row = self
            .store
            .upsert_override(PermissionOverride::new(
                user_id,
                permission_id,
                granted,
                granted_by,
                now,
            ))
            .await?;

        info!(%granted_by, "permission override set");
        Ok(row)
    }

    /// Stop applying an override. The row is kept for audit.
    #[instrument(skip_all, fields(%user_id, %permission_id), err)]
    pub async fn deactivate(
        &self,
        user_id: UserId,
        permission_id: PermissionId,
        revoked_by: UserId,
        now: DateTime<Utc>,
    ) -> AuthResult<PermissionOverride> {
        let row = self
            .store
            .deactivate_override(user_id, permission_id, revoked_by, now)
            .await?
            .ok_or_else(|| {
                AuthError::not_found(format!("override ({user_id}, {permission_id})"))
            })?;

        info!(%revoked_by, "permission override deactivated");
        Ok(row)
    }

    /// Deactivate every active override of a user.
    #[instrument(skip_all, fields(%user_id), err)]
    pub async fn clear(
        &self,
        user_id: UserId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> AuthResult<usize> {
        let cleared = self
            .store
            .deactivate_all_overrides(user_id, revoked_by, now)
            .await?;
        if cleared > 0 {
            info!(cleared, "permission overrides cleared");
        }
        Ok(cleared)
    }

    pub async fn active_overrides(&self, user_id: UserId) -> AuthResult<ActiveOverrides> {
        Ok(self.store.active_overrides(user_id).await?)
    }

    /// Every override row of the user, newest change first.
    pub async fn history(&self, user_id: UserId) -> AuthResult<Vec<PermissionOverride>> {
        let mut rows = self.store.overrides(user_id).await?;
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_overrides_lookup() {
        let allow = PermissionId::new();
        let deny = PermissionId::new();
        let overrides: ActiveOverrides = [(allow, true), (deny, false)].into_iter().collect();

        assert_eq!(overrides.get(allow), Some(true));
        assert_eq!(overrides.get(deny), Some(false));
        assert_eq!(overrides.get(PermissionId::new()), None);
        assert_eq!(overrides.len(), 2);
    }

    #[test]
    fn new_rows_start_active() {
        let row = PermissionOverride::new(
            UserId::new(),
            PermissionId::new(),
            false,
            UserId::new(),
            Utc::now(),
        );
        assert!(row.is_active);
        assert!(!row.granted);
        assert!(row.revoked_by.is_none());
    }
}
