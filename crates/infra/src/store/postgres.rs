//! Postgres-backed authorization store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate role name in scope, second pending invitation for an email |
//! | Database (foreign key violation) | `23503` | `Conflict` | Unknown permission in a role, deleting a referenced permission or held role |
//! | Database (other) | Any other | `Backend` | Check constraints, type errors |
//! | PoolClosed / Other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! ## Atomicity
//!
//! Overrides upsert with `ON CONFLICT (user_id, permission_id)`. Invitation
//! transitions are `UPDATE ... WHERE status = 'pending'`, so two concurrent
//! accepts of one token cannot both succeed; an accept also matches on
//! `token_hash`, so a token rotated in between loses.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use staybase_auth::invitation::{Invitation, InvitationStatus, InvitationTransition};
use staybase_auth::overrides::{ActiveOverrides, PermissionOverride};
use staybase_auth::permissions::{Permission, PermissionKey, Scope};
use staybase_auth::roles::{Role, RoleScope, UserType};
use staybase_auth::store::{
    InvitationStore, OverrideStore, PermissionStore, ProvisionUser, ProvisionedUser, RoleStore,
    StoreError, UserDirectory,
};
use staybase_core::{
    DepartmentId, InvitationId, OrganizationId, PermissionId, PropertyId, RoleId, UserId,
};

const SCHEMA: &str = include_str!("../../migrations/0001_authorization.sql");

const PERMISSION_COLUMNS: &str =
    "id, resource, action, scope, name, description, is_system, created_at";

const ROLE_COLUMNS: &str = "id, name, description, priority, scope_level, organization_id, \
     property_id, user_type, allowed_modules, is_active, created_at, updated_at";

const OVERRIDE_COLUMNS: &str =
    "user_id, permission_id, granted, is_active, granted_by, granted_at, revoked_by, updated_at";

const INVITATION_COLUMNS: &str = "id, email, role_id, department_id, property_id, message, status, \
     token_hash, invited_by, expires_at, created_at, accepted_at, accepted_user_id, cancelled_at, \
     cancelled_by";

/// Postgres-backed store implementing every authorization store trait.
///
/// ## Thread Safety
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
#[derive(Debug, Clone)]
pub struct PostgresAuthorizationStore {
    pool: Arc<PgPool>,
}

impl PostgresAuthorizationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the schema. Every statement is `IF NOT EXISTS`.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn role_permission_ids(&self, role_id: Uuid) -> Result<BTreeSet<PermissionId>, StoreError> {
        let rows = sqlx::query("SELECT permission_id FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("role_permission_ids", e))?;

        rows.iter()
            .map(|r| {
                r.try_get::<Uuid, _>("permission_id")
                    .map(PermissionId::from)
                    .map_err(|e| map_sqlx_error("role_permission_ids", e))
            })
            .collect()
    }

    async fn invitation_exists(&self, id: InvitationId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM invitations WHERE id = $1)")
            .bind(Uuid::from(id))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("invitation_exists", e))
    }
}

#[async_trait::async_trait]
impl PermissionStore for PostgresAuthorizationStore {
    #[instrument(skip_all, fields(key = %permission.key), err)]
    async fn register_permission(&self, permission: Permission) -> Result<Permission, StoreError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO permissions ({PERMISSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (resource, action, scope) DO NOTHING \
             RETURNING {PERMISSION_COLUMNS}"
        ))
        .bind(Uuid::from(permission.id))
        .bind(permission.key.resource())
        .bind(permission.key.action())
        .bind(permission.key.scope().as_str())
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(permission.is_system)
        .bind(permission.created_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_permission", e))?;

        match inserted {
            Some(row) => permission_from_row(&row),
            None => self
                .permission_by_key(&permission.key)
                .await?
                .ok_or_else(|| StoreError::Backend("permission vanished after conflict".to_string())),
        }
    }

    async fn permission(&self, id: PermissionId) -> Result<Option<Permission>, StoreError> {
        sqlx::query(&format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE id = $1"))
            .bind(Uuid::from(id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("permission", e))?
            .map(|row| permission_from_row(&row))
            .transpose()
    }

    async fn permission_by_key(&self, key: &PermissionKey) -> Result<Option<Permission>, StoreError> {
        sqlx::query(&format!(
            "SELECT {PERMISSION_COLUMNS} FROM permissions \
             WHERE resource = $1 AND action = $2 AND scope = $3"
        ))
        .bind(key.resource())
        .bind(key.action())
        .bind(key.scope().as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("permission_by_key", e))?
        .map(|row| permission_from_row(&row))
        .transpose()
    }

    async fn permissions(&self) -> Result<Vec<Permission>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {PERMISSION_COLUMNS} FROM permissions"))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("permissions", e))?;
        rows.iter().map(permission_from_row).collect()
    }

    async fn update_permission_details(
        &self,
        id: PermissionId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StoreError> {
        sqlx::query(&format!(
            "UPDATE permissions SET name = $2, description = $3 WHERE id = $1 \
             RETURNING {PERMISSION_COLUMNS}"
        ))
        .bind(Uuid::from(id))
        .bind(name)
        .bind(description)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_permission_details", e))?
        .map(|row| permission_from_row(&row))
        .transpose()?
        .ok_or_else(|| StoreError::NotFound(format!("permission {id}")))
    }

    async fn permission_in_use(&self, id: PermissionId) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM role_permissions WHERE permission_id = $1) \
                 OR EXISTS (SELECT 1 FROM user_permission_overrides WHERE permission_id = $1)",
        )
        .bind(Uuid::from(id))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("permission_in_use", e))
    }

    #[instrument(skip(self), err)]
    async fn delete_permission(&self, id: PermissionId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_permission", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("permission {id}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RoleStore for PostgresAuthorizationStore {
    #[instrument(skip_all, fields(name = %role.name), err)]
    async fn insert_role(&self, role: Role) -> Result<Role, StoreError> {
        let allowed_modules = serde_json::to_value(&role.allowed_modules)
            .map_err(|e| StoreError::Backend(format!("failed to encode allowed_modules: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_role", e))?;

        sqlx::query(&format!(
            "INSERT INTO roles ({ROLE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(Uuid::from(role.id))
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.priority)
        .bind(role.scope.level().as_str())
        .bind(role.scope.organization_id().map(Uuid::from))
        .bind(role.scope.property_id().map(Uuid::from))
        .bind(role.user_type.as_str())
        .bind(allowed_modules)
        .bind(role.is_active)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_role", e))?;

        for permission_id in &role.permissions {
            sqlx::query("INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)")
                .bind(Uuid::from(role.id))
                .bind(Uuid::from(*permission_id))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_role", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_role", e))?;
        Ok(role)
    }

    async fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        let Some(row) = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = $1"))
            .bind(Uuid::from(id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("role", e))?
        else {
            return Ok(None);
        };

        let permissions = self.role_permission_ids(Uuid::from(id)).await?;
        role_from_row(&row, permissions).map(Some)
    }

    async fn role_by_name(&self, name: &str, scope: &RoleScope) -> Result<Option<Role>, StoreError> {
        let Some(row) = sqlx::query(&format!(
            "SELECT {ROLE_COLUMNS} FROM roles \
             WHERE name = $1 AND scope_level = $2 \
               AND organization_id IS NOT DISTINCT FROM $3 \
               AND property_id IS NOT DISTINCT FROM $4"
        ))
        .bind(name)
        .bind(scope.level().as_str())
        .bind(scope.organization_id().map(Uuid::from))
        .bind(scope.property_id().map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_by_name", e))?
        else {
            return Ok(None);
        };

        let id: Uuid = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("role_by_name", e))?;
        let permissions = self.role_permission_ids(id).await?;
        role_from_row(&row, permissions).map(Some)
    }

    async fn roles(&self) -> Result<Vec<Role>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {ROLE_COLUMNS} FROM roles"))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("roles", e))?;

        let links = sqlx::query("SELECT role_id, permission_id FROM role_permissions")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("roles", e))?;

        let mut by_role: HashMap<Uuid, BTreeSet<PermissionId>> = HashMap::new();
        for link in &links {
            let role_id: Uuid = link
                .try_get("role_id")
                .map_err(|e| map_sqlx_error("roles", e))?;
            let permission_id: Uuid = link
                .try_get("permission_id")
                .map_err(|e| map_sqlx_error("roles", e))?;
            by_role
                .entry(role_id)
                .or_default()
                .insert(PermissionId::from(permission_id));
        }

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("roles", e))?;
                role_from_row(row, by_role.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    #[instrument(skip(self, now), err)]
    async fn add_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("add_role_permission", e))?;

        let touched = sqlx::query("UPDATE roles SET updated_at = updated_at WHERE id = $1")
            .bind(Uuid::from(role_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("add_role_permission", e))?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }

        let inserted = sqlx::query(
            "INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(Uuid::from(role_id))
        .bind(Uuid::from(permission_id))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("add_role_permission", e))?;

        let changed = inserted.rows_affected() == 1;
        if changed {
            sqlx::query("UPDATE roles SET updated_at = $2 WHERE id = $1")
                .bind(Uuid::from(role_id))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("add_role_permission", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("add_role_permission", e))?;
        Ok(changed)
    }

    #[instrument(skip(self, now), err)]
    async fn remove_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("remove_role_permission", e))?;

        let touched = sqlx::query("UPDATE roles SET updated_at = updated_at WHERE id = $1")
            .bind(Uuid::from(role_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove_role_permission", e))?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }

        let removed = sqlx::query(
            "DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2",
        )
        .bind(Uuid::from(role_id))
        .bind(Uuid::from(permission_id))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("remove_role_permission", e))?;

        let changed = removed.rows_affected() == 1;
        if changed {
            sqlx::query("UPDATE roles SET updated_at = $2 WHERE id = $1")
                .bind(Uuid::from(role_id))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("remove_role_permission", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("remove_role_permission", e))?;
        Ok(changed)
    }

    #[instrument(skip(self, now), err)]
    async fn set_role_active(
        &self,
        role_id: RoleId,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Role, StoreError> {
        let result = sqlx::query(
            "UPDATE roles \
             SET updated_at = CASE WHEN is_active <> $2 THEN $3 ELSE updated_at END, \
                 is_active = $2 \
             WHERE id = $1",
        )
        .bind(Uuid::from(role_id))
        .bind(active)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_role_active", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }
        self.role(role_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))
    }

    #[instrument(skip(self), err)]
    async fn delete_role(&self, role_id: RoleId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(Uuid::from(role_id))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_role", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("role {role_id}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OverrideStore for PostgresAuthorizationStore {
    #[instrument(skip_all, fields(user_id = %row.user_id, permission_id = %row.permission_id), err)]
    async fn upsert_override(&self, row: PermissionOverride) -> Result<PermissionOverride, StoreError> {
        let stored = sqlx::query(&format!(
            "INSERT INTO user_permission_overrides ({OVERRIDE_COLUMNS}) \
             VALUES ($1, $2, $3, TRUE, $4, $5, NULL, $6) \
             ON CONFLICT (user_id, permission_id) DO UPDATE SET \
                 granted = EXCLUDED.granted, \
                 is_active = TRUE, \
                 granted_by = EXCLUDED.granted_by, \
                 granted_at = EXCLUDED.granted_at, \
                 revoked_by = NULL, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {OVERRIDE_COLUMNS}"
        ))
        .bind(Uuid::from(row.user_id))
        .bind(Uuid::from(row.permission_id))
        .bind(row.granted)
        .bind(Uuid::from(row.granted_by))
        .bind(row.granted_at)
        .bind(row.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_override", e))?;

        override_from_row(&stored)
    }

    async fn deactivate_override(
        &self,
        user_id: UserId,
        permission_id: PermissionId,
        revoked_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionOverride>, StoreError> {
        let updated = sqlx::query(&format!(
            "UPDATE user_permission_overrides \
             SET is_active = FALSE, revoked_by = $3, updated_at = $4 \
             WHERE user_id = $1 AND permission_id = $2 AND is_active \
             RETURNING {OVERRIDE_COLUMNS}"
        ))
        .bind(Uuid::from(user_id))
        .bind(Uuid::from(permission_id))
        .bind(Uuid::from(revoked_by))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("deactivate_override", e))?;

        let row = match updated {
            Some(row) => Some(row),
            // Already inactive, or absent.
            None => sqlx::query(&format!(
                "SELECT {OVERRIDE_COLUMNS} FROM user_permission_overrides \
                 WHERE user_id = $1 AND permission_id = $2"
            ))
            .bind(Uuid::from(user_id))
            .bind(Uuid::from(permission_id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("deactivate_override", e))?,
        };

        row.map(|r| override_from_row(&r)).transpose()
    }

    async fn deactivate_all_overrides(
        &self,
        user_id: UserId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE user_permission_overrides \
             SET is_active = FALSE, revoked_by = $2, updated_at = $3 \
             WHERE user_id = $1 AND is_active",
        )
        .bind(Uuid::from(user_id))
        .bind(revoked_by.map(Uuid::from))
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("deactivate_all_overrides", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn active_overrides(&self, user_id: UserId) -> Result<ActiveOverrides, StoreError> {
        let rows = sqlx::query(
            "SELECT permission_id, granted FROM user_permission_overrides \
             WHERE user_id = $1 AND is_active",
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_overrides", e))?;

        rows.iter()
            .map(|r| {
                let permission_id: Uuid = r.try_get("permission_id")?;
                let granted: bool = r.try_get("granted")?;
                Ok((PermissionId::from(permission_id), granted))
            })
            .collect::<Result<ActiveOverrides, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("active_overrides", e))
    }

    async fn overrides(&self, user_id: UserId) -> Result<Vec<PermissionOverride>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM user_permission_overrides WHERE user_id = $1"
        ))
        .bind(Uuid::from(user_id))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("overrides", e))?;
        rows.iter().map(override_from_row).collect()
    }
}

#[async_trait::async_trait]
impl UserDirectory for PostgresAuthorizationStore {
    async fn role_of(&self, user_id: UserId) -> Result<Option<RoleId>, StoreError> {
        let role_id = sqlx::query_scalar::<_, Option<Uuid>>(
            "SELECT role_id FROM users WHERE id = $1 AND is_active",
        )
        .bind(Uuid::from(user_id))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("role_of", e))?;
        Ok(role_id.flatten().map(RoleId::from))
    }

    async fn users_with_role(&self, role_id: RoleId) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE role_id = $1")
            .bind(Uuid::from(role_id))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("users_with_role", e))?;
        Ok(count.max(0) as u64)
    }

    async fn active_user_by_email(&self, email: &str) -> Result<Option<UserId>, StoreError> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM users WHERE email = $1 AND is_active",
        )
        .bind(email.trim().to_lowercase())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_user_by_email", e))?;
        Ok(user_id.map(UserId::from))
    }

    #[instrument(skip_all, fields(role_id = %request.role_id), err)]
    async fn provision_user(&self, request: ProvisionUser) -> Result<ProvisionedUser, StoreError> {
        let email = request.email.trim().to_lowercase();
        // `xmax = 0` only for a freshly inserted row. An active row is left
        // alone and yields no row at all.
        let row = sqlx::query(
            "INSERT INTO users \
                 (id, email, display_name, role_id, user_type, department_id, property_id, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE) \
             ON CONFLICT (email) DO UPDATE SET \
                 display_name = EXCLUDED.display_name, \
                 role_id = EXCLUDED.role_id, \
                 user_type = EXCLUDED.user_type, \
                 department_id = EXCLUDED.department_id, \
                 property_id = EXCLUDED.property_id, \
                 is_active = TRUE, \
                 updated_at = now() \
             WHERE NOT users.is_active \
             RETURNING id, (xmax = 0) AS inserted",
        )
        .bind(Uuid::from(UserId::new()))
        .bind(&email)
        .bind(&request.display_name)
        .bind(Uuid::from(request.role_id))
        .bind(request.user_type.as_str())
        .bind(request.department_id.map(Uuid::from))
        .bind(request.property_id.map(Uuid::from))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("provision_user", e))?
        .ok_or_else(|| StoreError::Conflict(format!("{email} already belongs to an active user")))?;

        let user_id: Uuid = row
            .try_get("id")
            .map_err(|e| map_sqlx_error("provision_user", e))?;
        let inserted: bool = row
            .try_get("inserted")
            .map_err(|e| map_sqlx_error("provision_user", e))?;

        Ok(ProvisionedUser {
            user_id: UserId::from(user_id),
            reactivated: !inserted,
        })
    }
}

#[async_trait::async_trait]
impl InvitationStore for PostgresAuthorizationStore {
    #[instrument(skip_all, fields(invitation_id = %invitation.id), err)]
    async fn insert_invitation(&self, invitation: Invitation) -> Result<Invitation, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_invitation", e))?;

        // Stale pending rows would otherwise trip the one-pending-per-email index.
        sqlx::query(
            "UPDATE invitations SET status = 'expired' \
             WHERE email = $1 AND status = 'pending' AND expires_at < $2",
        )
        .bind(&invitation.email)
        .bind(invitation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invitation", e))?;

        sqlx::query(&format!(
            "INSERT INTO invitations ({INVITATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(Uuid::from(invitation.id))
        .bind(&invitation.email)
        .bind(Uuid::from(invitation.role_id))
        .bind(invitation.department_id.map(Uuid::from))
        .bind(invitation.property_id.map(Uuid::from))
        .bind(&invitation.message)
        .bind(invitation.status.as_str())
        .bind(&invitation.token_hash)
        .bind(Uuid::from(invitation.invited_by))
        .bind(invitation.expires_at)
        .bind(invitation.created_at)
        .bind(invitation.accepted_at)
        .bind(invitation.accepted_user_id.map(Uuid::from))
        .bind(invitation.cancelled_at)
        .bind(invitation.cancelled_by.map(Uuid::from))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invitation", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_invitation", e))?;
        Ok(invitation)
    }

    async fn invitation(&self, id: InvitationId) -> Result<Option<Invitation>, StoreError> {
        sqlx::query(&format!("SELECT {INVITATION_COLUMNS} FROM invitations WHERE id = $1"))
            .bind(Uuid::from(id))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("invitation", e))?
            .map(|row| invitation_from_row(&row))
            .transpose()
    }

    async fn invitation_by_token_hash(&self, token_hash: &str) -> Result<Option<Invitation>, StoreError> {
        sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("invitation_by_token_hash", e))?
        .map(|row| invitation_from_row(&row))
        .transpose()
    }

    async fn live_invitation_for_email(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError> {
        sqlx::query(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE email = $1 AND status = 'pending' AND expires_at >= $2"
        ))
        .bind(email)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("live_invitation_for_email", e))?
        .map(|row| invitation_from_row(&row))
        .transpose()
    }

    #[instrument(skip(self, transition), fields(target = %transition.target()), err)]
    async fn transition_invitation(
        &self,
        id: InvitationId,
        transition: InvitationTransition,
    ) -> Result<Option<Invitation>, StoreError> {
        let status = transition.target();
        let (accepted_at, cancelled_at, cancelled_by, token_hash) = match transition {
            InvitationTransition::Accept { at, token_hash } => (Some(at), None, None, Some(token_hash)),
            InvitationTransition::Expire { .. } => (None, None, None, None),
            InvitationTransition::Cancel { by, at } => (None, Some(at), Some(Uuid::from(by)), None),
        };

        let updated = sqlx::query(&format!(
            "UPDATE invitations SET \
                 status = $2, \
                 accepted_at = COALESCE($3, accepted_at), \
                 cancelled_at = COALESCE($4, cancelled_at), \
                 cancelled_by = COALESCE($5, cancelled_by) \
             WHERE id = $1 AND status = 'pending' \
               AND ($6::TEXT IS NULL OR token_hash = $6) \
             RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(Uuid::from(id))
        .bind(status.as_str())
        .bind(accepted_at)
        .bind(cancelled_at)
        .bind(cancelled_by)
        .bind(token_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_invitation", e))?;

        match updated {
            Some(row) => invitation_from_row(&row).map(Some),
            None if self.invitation_exists(id).await? => Ok(None),
            None => Err(StoreError::NotFound(format!("invitation {id}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn reopen_invitation(&self, id: InvitationId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'pending', accepted_at = NULL \
             WHERE id = $1 AND status = 'accepted' AND accepted_user_id IS NULL",
        )
        .bind(Uuid::from(id))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reopen_invitation", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn attach_accepted_user(&self, id: InvitationId, user_id: UserId) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE invitations SET accepted_user_id = $2 WHERE id = $1")
            .bind(Uuid::from(id))
            .bind(Uuid::from(user_id))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("attach_accepted_user", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("invitation {id}")));
        }
        Ok(())
    }

    async fn rotate_invitation_token(
        &self,
        id: InvitationId,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError> {
        let updated = sqlx::query(&format!(
            "UPDATE invitations SET token_hash = $2, expires_at = $3 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(Uuid::from(id))
        .bind(token_hash)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("rotate_invitation_token", e))?;

        match updated {
            Some(row) => invitation_from_row(&row).map(Some),
            None if self.invitation_exists(id).await? => Ok(None),
            None => Err(StoreError::NotFound(format!("invitation {id}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn expire_pending_invitations(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'expired' \
             WHERE status = 'pending' AND expires_at < $1",
        )
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire_pending_invitations", e))?;
        Ok(result.rows_affected() as usize)
    }
}

// Row mapping

fn permission_from_row(row: &PgRow) -> Result<Permission, StoreError> {
    let map = |e| map_sqlx_error("permission_from_row", e);
    let scope: Scope = parse_column(row.try_get::<String, _>("scope").map_err(map)?)?;
    let resource: String = row.try_get("resource").map_err(map)?;
    let action: String = row.try_get("action").map_err(map)?;

    Ok(Permission {
        id: PermissionId::from(row.try_get::<Uuid, _>("id").map_err(map)?),
        key: PermissionKey::new(&resource, &action, scope).map_err(invalid_row)?,
        name: row.try_get("name").map_err(map)?,
        description: row.try_get("description").map_err(map)?,
        is_system: row.try_get("is_system").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
    })
}

fn role_from_row(row: &PgRow, permissions: BTreeSet<PermissionId>) -> Result<Role, StoreError> {
    let map = |e| map_sqlx_error("role_from_row", e);
    let level: Scope = parse_column(row.try_get::<String, _>("scope_level").map_err(map)?)?;
    let organization_id: Option<Uuid> = row.try_get("organization_id").map_err(map)?;
    let property_id: Option<Uuid> = row.try_get("property_id").map_err(map)?;
    let scope = RoleScope::from_parts(
        level,
        organization_id.map(OrganizationId::from),
        property_id.map(PropertyId::from),
    )
    .map_err(invalid_row)?;
    let user_type: UserType = parse_column(row.try_get::<String, _>("user_type").map_err(map)?)?;
    let allowed_modules: serde_json::Value = row.try_get("allowed_modules").map_err(map)?;
    let allowed_modules: Vec<String> = serde_json::from_value(allowed_modules)
        .map_err(|e| StoreError::Backend(format!("invalid allowed_modules column: {e}")))?;

    Ok(Role {
        id: RoleId::from(row.try_get::<Uuid, _>("id").map_err(map)?),
        name: row.try_get("name").map_err(map)?,
        description: row.try_get("description").map_err(map)?,
        priority: row.try_get("priority").map_err(map)?,
        permissions,
        scope,
        user_type,
        allowed_modules,
        is_active: row.try_get("is_active").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}

fn override_from_row(row: &PgRow) -> Result<PermissionOverride, StoreError> {
    let map = |e| map_sqlx_error("override_from_row", e);
    Ok(PermissionOverride {
        user_id: UserId::from(row.try_get::<Uuid, _>("user_id").map_err(map)?),
        permission_id: PermissionId::from(row.try_get::<Uuid, _>("permission_id").map_err(map)?),
        granted: row.try_get("granted").map_err(map)?,
        is_active: row.try_get("is_active").map_err(map)?,
        granted_by: UserId::from(row.try_get::<Uuid, _>("granted_by").map_err(map)?),
        granted_at: row.try_get("granted_at").map_err(map)?,
        revoked_by: row
            .try_get::<Option<Uuid>, _>("revoked_by")
            .map_err(map)?
            .map(UserId::from),
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}

fn invitation_from_row(row: &PgRow) -> Result<Invitation, StoreError> {
    let map = |e| map_sqlx_error("invitation_from_row", e);
    let status: InvitationStatus = parse_column(row.try_get::<String, _>("status").map_err(map)?)?;

    Ok(Invitation {
        id: InvitationId::from(row.try_get::<Uuid, _>("id").map_err(map)?),
        email: row.try_get("email").map_err(map)?,
        role_id: RoleId::from(row.try_get::<Uuid, _>("role_id").map_err(map)?),
        department_id: row
            .try_get::<Option<Uuid>, _>("department_id")
            .map_err(map)?
            .map(DepartmentId::from),
        property_id: row
            .try_get::<Option<Uuid>, _>("property_id")
            .map_err(map)?
            .map(PropertyId::from),
        message: row.try_get("message").map_err(map)?,
        status,
        token_hash: row.try_get("token_hash").map_err(map)?,
        invited_by: UserId::from(row.try_get::<Uuid, _>("invited_by").map_err(map)?),
        expires_at: row.try_get("expires_at").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
        accepted_at: row.try_get("accepted_at").map_err(map)?,
        accepted_user_id: row
            .try_get::<Option<Uuid>, _>("accepted_user_id")
            .map_err(map)?
            .map(UserId::from),
        cancelled_at: row.try_get("cancelled_at").map_err(map)?,
        cancelled_by: row
            .try_get::<Option<Uuid>, _>("cancelled_by")
            .map_err(map)?
            .map(UserId::from),
    })
}

fn parse_column<T>(value: String) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = staybase_core::DomainError>,
{
    value.parse().map_err(invalid_row)
}

fn invalid_row(err: staybase_core::DomainError) -> StoreError {
    StoreError::Backend(format!("invalid row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique violation
                Some("23505") => StoreError::Conflict(msg),
                // Foreign key violation
                Some("23503") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
