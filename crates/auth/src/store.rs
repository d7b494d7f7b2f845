//! Persistence boundary of the authorization core.
//!
//! The core owns no storage. These traits describe the minimum it needs from a
//! data store; `staybase-infra` ships in-memory and PostgreSQL implementations.
//!
//! Implementations must provide:
//! - insert-or-get semantics on the permission triple
//! - a unique `(user_id, permission_id)` pair for overrides (upsert, never duplicate)
//! - conditional (`status = pending`) updates for invitation transitions; an
//!   accept also matches the token digest it carries

use chrono::{DateTime, Utc};
use thiserror::Error;

use staybase_core::{
    DepartmentId, InvitationId, PermissionId, PropertyId, RoleId, UserId,
};

use crate::invitation::{Invitation, InvitationTransition};
use crate::overrides::{ActiveOverrides, PermissionOverride};
use crate::permissions::{Permission, PermissionKey};
use crate::roles::{Role, RoleScope, UserType};

/// Store operation error.
///
/// These are infrastructure outcomes; services translate them into
/// [`crate::AuthError`] at the boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Unique or referential constraint rejected the write.
    #[error("constraint conflict: {0}")]
    Conflict(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait PermissionStore: Send + Sync {
    /// Insert the permission unless its key already exists; return the stored row.
    async fn register_permission(&self, permission: Permission) -> Result<Permission, StoreError>;

    async fn permission(&self, id: PermissionId) -> Result<Option<Permission>, StoreError>;

    async fn permission_by_key(&self, key: &PermissionKey) -> Result<Option<Permission>, StoreError>;

    async fn permissions(&self) -> Result<Vec<Permission>, StoreError>;

    /// Update descriptive fields only.
    async fn update_permission_details(
        &self,
        id: PermissionId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StoreError>;

    /// Whether any role or override row references the permission.
    async fn permission_in_use(&self, id: PermissionId) -> Result<bool, StoreError>;

    /// Remove an unreferenced permission. A live reference yields `Conflict`.
    async fn delete_permission(&self, id: PermissionId) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait RoleStore: Send + Sync {
    /// Insert a role. A duplicate name within the same scope yields `Conflict`.
    async fn insert_role(&self, role: Role) -> Result<Role, StoreError>;

    async fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError>;

    async fn role_by_name(&self, name: &str, scope: &RoleScope) -> Result<Option<Role>, StoreError>;

    async fn roles(&self) -> Result<Vec<Role>, StoreError>;

    /// Add a permission to a role; returns whether the set changed.
    async fn add_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Remove a permission from a role; returns whether the set changed.
    async fn remove_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn set_role_active(
        &self,
        role_id: RoleId,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Role, StoreError>;

    async fn delete_role(&self, role_id: RoleId) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait OverrideStore: Send + Sync {
    /// Upsert by `(user_id, permission_id)`; the stored row is active afterwards.
    async fn upsert_override(&self, row: PermissionOverride) -> Result<PermissionOverride, StoreError>;

    /// Mark the pair inactive. `None` when no row exists.
    async fn deactivate_override(
        &self,
        user_id: UserId,
        permission_id: PermissionId,
        revoked_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionOverride>, StoreError>;

    /// Mark every active row of the user inactive; returns how many changed.
    async fn deactivate_all_overrides(
        &self,
        user_id: UserId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn active_overrides(&self, user_id: UserId) -> Result<ActiveOverrides, StoreError>;

    /// All rows for the user, active and inactive.
    async fn overrides(&self, user_id: UserId) -> Result<Vec<PermissionOverride>, StoreError>;
}

/// Provisioning request handed to the user directory on invitation acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionUser {
    pub email: String,
    pub display_name: String,
    pub role_id: RoleId,
    pub user_type: UserType,
    pub department_id: Option<DepartmentId>,
    pub property_id: Option<PropertyId>,
}

/// Outcome of provisioning.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProvisionedUser {
    pub user_id: UserId,
    /// `true` when a deactivated user was reactivated and rebound.
    pub reactivated: bool,
}

/// The external user collaborator, reduced to what authorization reads and writes.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    /// The user's role binding; `None` for unknown users and users without a role.
    async fn role_of(&self, user_id: UserId) -> Result<Option<RoleId>, StoreError>;

    async fn users_with_role(&self, role_id: RoleId) -> Result<u64, StoreError>;

    /// The active user registered under `email`, if any.
    async fn active_user_by_email(&self, email: &str) -> Result<Option<UserId>, StoreError>;

    /// Create the user, or reactivate and rebind a deactivated user with the
    /// same email. An active user with that email yields `Conflict`.
    async fn provision_user(&self, request: ProvisionUser) -> Result<ProvisionedUser, StoreError>;
}

#[async_trait::async_trait]
pub trait InvitationStore: Send + Sync {
    async fn insert_invitation(&self, invitation: Invitation) -> Result<Invitation, StoreError>;

    async fn invitation(&self, id: InvitationId) -> Result<Option<Invitation>, StoreError>;

    async fn invitation_by_token_hash(&self, token_hash: &str) -> Result<Option<Invitation>, StoreError>;

    /// A pending invitation for `email` that has not passed its expiry at `now`.
    async fn live_invitation_for_email(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError>;

    /// Compare-and-set from `Pending`. Returns the updated row when this call
    /// performed the transition, `None` when the row was no longer pending.
    async fn transition_invitation(
        &self,
        id: InvitationId,
        transition: InvitationTransition,
    ) -> Result<Option<Invitation>, StoreError>;

    /// Revert an acceptance whose provisioning failed (`Accepted` without a user).
    async fn reopen_invitation(&self, id: InvitationId) -> Result<bool, StoreError>;

    async fn attach_accepted_user(&self, id: InvitationId, user_id: UserId) -> Result<(), StoreError>;

    /// Replace token digest and expiry of a pending invitation.
    async fn rotate_invitation_token(
        &self,
        id: InvitationId,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError>;

    /// Move pending rows with `expires_at < now` to `Expired`; returns the count.
    async fn expire_pending_invitations(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Everything the full authorization core needs from one backing store.
pub trait AuthorizationStore:
    PermissionStore + RoleStore + OverrideStore + InvitationStore + UserDirectory
{
}

impl<T> AuthorizationStore for T where
    T: PermissionStore + RoleStore + OverrideStore + InvitationStore + UserDirectory
{
}
