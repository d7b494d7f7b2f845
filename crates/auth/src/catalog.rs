//! Permission catalog: the universe of permissions the core can reason about.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use staybase_core::{DomainError, PermissionId};

use crate::error::{AuthError, AuthResult};
use crate::permissions::{CatalogActor, NewPermission, Permission, PermissionKey, Scope};
use crate::store::{PermissionStore, StoreError};

pub struct PermissionCatalog<S> {
    store: Arc<S>,
}

impl<S> Clone for PermissionCatalog<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S> PermissionCatalog<S>
where
    S: PermissionStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a permission, or return the existing row for the same triple.
    ///
    /// Safe to call from provisioning scripts that re-run.
    #[instrument(skip_all, fields(key = %request.key), err)]
    pub async fn register(&self, request: NewPermission, now: DateTime<Utc>) -> AuthResult<Permission> {
        if request.name.trim().is_empty() {
            return Err(AuthError::Domain(DomainError::validation(
                "permission name cannot be empty",
            )));
        }

        let candidate = request.into_permission(now);
        let candidate_id = candidate.id;
        let stored = self.store.register_permission(candidate).await?;

        if stored.id == candidate_id {
            info!(permission_id = %stored.id, "permission registered");
        }
        Ok(stored)
    }

    pub async fn lookup(&self, resource: &str, action: &str, scope: Scope) -> AuthResult<Permission> {
        let key = PermissionKey::new(resource, action, scope)?;
        self.lookup_key(&key).await
    }

    pub async fn lookup_key(&self, key: &PermissionKey) -> AuthResult<Permission> {
        self.store
            .permission_by_key(key)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("permission {key}")))
    }

    /// Resolve a key to its catalog row, `None` when the catalog lacks it.
    pub async fn find_key(&self, key: &PermissionKey) -> AuthResult<Option<Permission>> {
        Ok(self.store.permission_by_key(key).await?)
    }

    pub async fn get(&self, id: PermissionId) -> AuthResult<Permission> {
        self.store
            .permission(id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("permission {id}")))
    }

    /// All permissions, ordered by key.
    pub async fn list(&self) -> AuthResult<Vec<Permission>> {
        let mut permissions = self.store.permissions().await?;
        permissions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(permissions)
    }

    /// Edit descriptive fields. The key is immutable.
    #[instrument(skip_all, fields(%id), err)]
    pub async fn describe(
        &self,
        id: PermissionId,
        name: &str,
        description: Option<&str>,
        actor: CatalogActor,
    ) -> AuthResult<Permission> {
        let existing = self.get(id).await?;
        ensure_editable(&existing, actor)?;

        if name.trim().is_empty() {
            return Err(AuthError::Domain(DomainError::validation(
                "permission name cannot be empty",
            )));
        }

        Ok(self
            .store
            .update_permission_details(id, name.trim(), description)
            .await?)
    }

    /// Delete a permission nothing references.
    #[instrument(skip_all, fields(%id), err)]
    pub async fn delete(&self, id: PermissionId, actor: CatalogActor) -> AuthResult<()> {
        let existing = self.get(id).await?;
        ensure_editable(&existing, actor)?;

        if self.store.permission_in_use(id).await? {
            return Err(AuthError::InUse(format!("permission {} is referenced", existing.key)));
        }

        match self.store.delete_permission(id).await {
            Ok(()) => {
                info!(key = %existing.key, "permission deleted");
                Ok(())
            }
            // A reference appeared between the check and the delete.
            Err(StoreError::Conflict(_)) => Err(AuthError::InUse(format!(
                "permission {} is referenced",
                existing.key
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

fn ensure_editable(permission: &Permission, actor: CatalogActor) -> AuthResult<()> {
    if permission.is_system && actor == CatalogActor::Tenant {
        warn!(key = %permission.key, "tenant actor attempted to modify a system permission");
        return Err(AuthError::forbidden(format!(
            "permission {} is a system permission",
            permission.key
        )));
    }
    Ok(())
}
