//! Role registry: named permission bundles and their lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use staybase_core::{DomainError, PermissionId, RoleId};

use crate::error::{AuthError, AuthResult};
use crate::roles::{NewRole, Role, RoleScope};
use crate::store::{PermissionStore, RoleStore, StoreError, UserDirectory};

pub struct RoleRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for RoleRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> RoleRegistry<S>
where
    S: RoleStore + PermissionStore + UserDirectory,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create a role.
    ///
    /// Every permission must exist in the catalog and fit inside the role's scope.
    #[instrument(skip_all, fields(name = %request.name, scope = %request.scope.level()), err)]
    pub async fn create(&self, request: NewRole, now: DateTime<Utc>) -> AuthResult<Role> {
        if request.name.trim().is_empty() {
            return Err(DomainError::validation("role name cannot be empty").into());
        }

        for permission_id in &request.permissions {
            self.ensure_assignable(&request.scope, *permission_id).await?;
        }

        let role = request.into_role(now);
        let role = self.store.insert_role(role).await.map_err(|e| match e {
            StoreError::Conflict(_) => AuthError::Conflict("role name already exists in scope".into()),
            other => other.into(),
        })?;

        info!(role_id = %role.id, permissions = role.permissions.len(), "role created");
        Ok(role)
    }

    /// Add a permission to a role. Assigning an already-present id is a no-op.
    #[instrument(skip_all, fields(%role_id, %permission_id), err)]
    pub async fn assign_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        let role = self.get(role_id).await?;
        if role.permissions.contains(&permission_id) {
            return Ok(());
        }
        self.ensure_assignable(&role.scope, permission_id).await?;

        if self
            .store
            .add_role_permission(role_id, permission_id, now)
            .await?
        {
            info!("permission assigned to role");
        }
        Ok(())
    }

    /// Remove a permission from a role. Revoking an absent id is a no-op.
    #[instrument(skip_all, fields(%role_id, %permission_id), err)]
    pub async fn revoke_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        // Fails with NotFound for unknown roles.
        self.get(role_id).await?;

        if self
            .store
            .remove_role_permission(role_id, permission_id, now)
            .await?
        {
            info!("permission revoked from role");
        }
        Ok(())
    }

    /// The permission set the role grants right now.
    ///
    /// Unknown roles fail with `NotFound`; inactive roles yield the empty set.
    pub async fn effective_permissions(&self, role_id: RoleId) -> AuthResult<BTreeSet<PermissionId>> {
        Ok(self.get(role_id).await?.effective_permissions())
    }

    pub async fn get(&self, role_id: RoleId) -> AuthResult<Role> {
        self.store
            .role(role_id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("role {role_id}")))
    }

    pub async fn find_by_name(&self, name: &str, scope: &RoleScope) -> AuthResult<Option<Role>> {
        Ok(self.store.role_by_name(name, scope).await?)
    }

    /// All roles, highest priority first, then by name.
    pub async fn list(&self) -> AuthResult<Vec<Role>> {
        let mut roles = self.store.roles().await?;
        roles.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(roles)
    }

    #[instrument(skip_all, fields(%role_id), err)]
    pub async fn deactivate(&self, role_id: RoleId, now: DateTime<Utc>) -> AuthResult<Role> {
        let role = self.store.set_role_active(role_id, false, now).await?;
        info!("role deactivated");
        Ok(role)
    }

    #[instrument(skip_all, fields(%role_id), err)]
    pub async fn activate(&self, role_id: RoleId, now: DateTime<Utc>) -> AuthResult<Role> {
        let role = self.store.set_role_active(role_id, true, now).await?;
        info!("role activated");
        Ok(role)
    }

    /// Delete a role nobody holds. Held roles must be deactivated instead.
    #[instrument(skip_all, fields(%role_id), err)]
    pub async fn delete(&self, role_id: RoleId) -> AuthResult<()> {
        let role = self.get(role_id).await?;

        let holders = self.store.users_with_role(role_id).await?;
        if holders > 0 {
            return Err(AuthError::InUse(format!(
                "role '{}' is held by {holders} user(s); deactivate it instead",
                role.name
            )));
        }

        self.store.delete_role(role_id).await.map_err(|e| match e {
            StoreError::Conflict(msg) => AuthError::InUse(msg),
            other => other.into(),
        })?;
        info!(name = %role.name, "role deleted");
        Ok(())
    }

    async fn ensure_assignable(&self, scope: &RoleScope, permission_id: PermissionId) -> AuthResult<()> {
        let permission = self
            .store
            .permission(permission_id)
            .await?
            .ok_or(AuthError::InvalidPermission(permission_id))?;

        if !scope.admits(permission.scope()) {
            return Err(AuthError::ScopeViolation(format!(
                "{}-scoped role cannot carry {}",
                scope.level(),
                permission.key
            )));
        }
        Ok(())
    }
}
