use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use staybase_auth::invitation::{Invitation, InvitationStatus, InvitationTransition};
use staybase_auth::overrides::{ActiveOverrides, PermissionOverride};
use staybase_auth::permissions::{Permission, PermissionKey};
use staybase_auth::roles::{Role, RoleScope};
use staybase_auth::store::{
    InvitationStore, OverrideStore, PermissionStore, ProvisionUser, ProvisionedUser, RoleStore,
    StoreError, UserDirectory,
};
use staybase_core::{InvitationId, PermissionId, RoleId, UserId};

use super::DirectoryUser;

#[derive(Debug, Default)]
struct Tables {
    permissions: HashMap<PermissionId, Permission>,
    permission_keys: HashMap<PermissionKey, PermissionId>,
    roles: HashMap<RoleId, Role>,
    overrides: HashMap<(UserId, PermissionId), PermissionOverride>,
    users: HashMap<UserId, DirectoryUser>,
    invitations: HashMap<InvitationId, Invitation>,
    invitation_tokens: HashMap<String, InvitationId>,
}

impl Tables {
    fn permission_referenced(&self, id: PermissionId) -> bool {
        self.roles.values().any(|r| r.permissions.contains(&id))
            || self.overrides.keys().any(|(_, p)| *p == id)
    }

    fn require_permission(&self, id: PermissionId) -> Result<(), StoreError> {
        if self.permissions.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!("permission {id} does not exist")))
        }
    }
}

/// In-memory authorization store for tests/dev.
///
/// All tables live behind one lock, so every trait method is atomic with
/// respect to every other.
#[derive(Debug, Default)]
pub struct InMemoryAuthorizationStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    fail_provisioning: AtomicBool,
}

impl InMemoryAuthorizationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    /// Seed a directory user directly (tests, fixtures).
    pub fn insert_user(&self, user: DirectoryUser) -> Result<DirectoryUser, StoreError> {
        let mut t = self.write()?;
        if t.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict(format!("email {} already registered", user.email)));
        }
        if let Some(role_id) = user.role_id {
            if !t.roles.contains_key(&role_id) {
                return Err(StoreError::Conflict(format!("role {role_id} does not exist")));
            }
        }
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    pub fn user(&self, user_id: UserId) -> Result<Option<DirectoryUser>, StoreError> {
        Ok(self.read()?.users.get(&user_id).cloned())
    }

    pub fn user_by_email(&self, email: &str) -> Result<Option<DirectoryUser>, StoreError> {
        let email = email.trim().to_lowercase();
        Ok(self.read()?.users.values().find(|u| u.email == email).cloned())
    }

    pub fn set_user_role(&self, user_id: UserId, role_id: Option<RoleId>) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if let Some(role_id) = role_id {
            if !t.roles.contains_key(&role_id) {
                return Err(StoreError::Conflict(format!("role {role_id} does not exist")));
            }
        }
        let user = t
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.role_id = role_id;
        Ok(())
    }

    pub fn deactivate_user(&self, user_id: UserId) -> Result<(), StoreError> {
        let mut t = self.write()?;
        let user = t
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.is_active = false;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_provisioning(&self, fail: bool) {
        self.fail_provisioning.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl PermissionStore for InMemoryAuthorizationStore {
    async fn register_permission(&self, permission: Permission) -> Result<Permission, StoreError> {
        let mut t = self.write()?;
        if let Some(existing) = t.permission_keys.get(&permission.key) {
            let existing = *existing;
            return t
                .permissions
                .get(&existing)
                .cloned()
                .ok_or_else(|| StoreError::Backend("permission key index out of sync".to_string()));
        }
        t.permission_keys.insert(permission.key.clone(), permission.id);
        t.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn permission(&self, id: PermissionId) -> Result<Option<Permission>, StoreError> {
        Ok(self.read()?.permissions.get(&id).cloned())
    }

    async fn permission_by_key(&self, key: &PermissionKey) -> Result<Option<Permission>, StoreError> {
        let t = self.read()?;
        Ok(t.permission_keys
            .get(key)
            .and_then(|id| t.permissions.get(id))
            .cloned())
    }

    async fn permissions(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.read()?.permissions.values().cloned().collect())
    }

    async fn update_permission_details(
        &self,
        id: PermissionId,
        name: &str,
        description: Option<&str>,
    ) -> Result<Permission, StoreError> {
        let mut t = self.write()?;
        let permission = t
            .permissions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("permission {id}")))?;
        permission.name = name.to_string();
        permission.description = description.map(str::to_string);
        Ok(permission.clone())
    }

    async fn permission_in_use(&self, id: PermissionId) -> Result<bool, StoreError> {
        Ok(self.read()?.permission_referenced(id))
    }

    async fn delete_permission(&self, id: PermissionId) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if t.permission_referenced(id) {
            return Err(StoreError::Conflict(format!("permission {id} is referenced")));
        }
        let removed = t
            .permissions
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("permission {id}")))?;
        t.permission_keys.remove(&removed.key);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RoleStore for InMemoryAuthorizationStore {
    async fn insert_role(&self, role: Role) -> Result<Role, StoreError> {
        let mut t = self.write()?;
        if t
            .roles
            .values()
            .any(|r| r.name == role.name && r.scope == role.scope)
        {
            return Err(StoreError::Conflict(format!(
                "role '{}' already exists in scope",
                role.name
            )));
        }
        for permission_id in &role.permissions {
            t.require_permission(*permission_id)?;
        }
        t.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        Ok(self.read()?.roles.get(&id).cloned())
    }

    async fn role_by_name(&self, name: &str, scope: &RoleScope) -> Result<Option<Role>, StoreError> {
        Ok(self
            .read()?
            .roles
            .values()
            .find(|r| r.name == name && r.scope == *scope)
            .cloned())
    }

    async fn roles(&self) -> Result<Vec<Role>, StoreError> {
        Ok(self.read()?.roles.values().cloned().collect())
    }

    async fn add_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        t.require_permission(permission_id)?;
        let role = t
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))?;
        let changed = role.permissions.insert(permission_id);
        if changed {
            role.updated_at = now;
        }
        Ok(changed)
    }

    async fn remove_role_permission(
        &self,
        role_id: RoleId,
        permission_id: PermissionId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let role = t
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))?;
        let changed = role.permissions.remove(&permission_id);
        if changed {
            role.updated_at = now;
        }
        Ok(changed)
    }

    async fn set_role_active(
        &self,
        role_id: RoleId,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Role, StoreError> {
        let mut t = self.write()?;
        let role = t
            .roles
            .get_mut(&role_id)
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))?;
        if role.is_active != active {
            role.is_active = active;
            role.updated_at = now;
        }
        Ok(role.clone())
    }

    async fn delete_role(&self, role_id: RoleId) -> Result<(), StoreError> {
        let mut t = self.write()?;
        if t.users.values().any(|u| u.role_id == Some(role_id)) {
            return Err(StoreError::Conflict(format!("role {role_id} is held by users")));
        }
        if t.invitations.values().any(|i| i.role_id == role_id) {
            return Err(StoreError::Conflict(format!("role {role_id} is referenced by invitations")));
        }
        t.roles
            .remove(&role_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))
    }
}

#[async_trait::async_trait]
impl OverrideStore for InMemoryAuthorizationStore {
    async fn upsert_override(&self, row: PermissionOverride) -> Result<PermissionOverride, StoreError> {
        let mut t = self.write()?;
        t.require_permission(row.permission_id)?;

        let key = (row.user_id, row.permission_id);
        if let Some(existing) = t.overrides.get_mut(&key) {
            existing.granted = row.granted;
            existing.is_active = true;
            existing.granted_by = row.granted_by;
            existing.granted_at = row.granted_at;
            existing.revoked_by = None;
            existing.updated_at = row.updated_at;
            return Ok(existing.clone());
        }
        t.overrides.insert(key, row.clone());
        Ok(row)
    }

    async fn deactivate_override(
        &self,
        user_id: UserId,
        permission_id: PermissionId,
        revoked_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionOverride>, StoreError> {
        let mut t = self.write()?;
        Ok(t.overrides.get_mut(&(user_id, permission_id)).map(|row| {
            if row.is_active {
                row.is_active = false;
                row.revoked_by = Some(revoked_by);
                row.updated_at = now;
            }
            row.clone()
        }))
    }

    async fn deactivate_all_overrides(
        &self,
        user_id: UserId,
        revoked_by: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut t = self.write()?;
        let mut changed = 0;
        for row in t
            .overrides
            .values_mut()
            .filter(|r| r.user_id == user_id && r.is_active)
        {
            row.is_active = false;
            row.revoked_by = revoked_by;
            row.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn active_overrides(&self, user_id: UserId) -> Result<ActiveOverrides, StoreError> {
        Ok(self
            .read()?
            .overrides
            .values()
            .filter(|r| r.user_id == user_id && r.is_active)
            .map(|r| (r.permission_id, r.granted))
            .collect())
    }

    async fn overrides(&self, user_id: UserId) -> Result<Vec<PermissionOverride>, StoreError> {
        Ok(self
            .read()?
            .overrides
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl UserDirectory for InMemoryAuthorizationStore {
    async fn role_of(&self, user_id: UserId) -> Result<Option<RoleId>, StoreError> {
        Ok(self
            .read()?
            .users
            .get(&user_id)
            .filter(|u| u.is_active)
            .and_then(|u| u.role_id))
    }

    async fn users_with_role(&self, role_id: RoleId) -> Result<u64, StoreError> {
        Ok(self
            .read()?
            .users
            .values()
            .filter(|u| u.role_id == Some(role_id))
            .count() as u64)
    }

    async fn active_user_by_email(&self, email: &str) -> Result<Option<UserId>, StoreError> {
        let email = email.trim().to_lowercase();
        Ok(self
            .read()?
            .users
            .values()
            .find(|u| u.email == email && u.is_active)
            .map(|u| u.id))
    }

    async fn provision_user(&self, request: ProvisionUser) -> Result<ProvisionedUser, StoreError> {
        #[cfg(test)]
        if self.fail_provisioning.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("provisioning disabled".to_string()));
        }

        let mut t = self.write()?;
        if !t.roles.contains_key(&request.role_id) {
            return Err(StoreError::Conflict(format!("role {} does not exist", request.role_id)));
        }

        let email = request.email.trim().to_lowercase();
        if let Some(user) = t.users.values_mut().find(|u| u.email == email) {
            if user.is_active {
                return Err(StoreError::Conflict(format!("{email} already belongs to an active user")));
            }
            user.display_name = request.display_name;
            user.role_id = Some(request.role_id);
            user.user_type = request.user_type;
            user.department_id = request.department_id;
            user.property_id = request.property_id;
            user.is_active = true;
            return Ok(ProvisionedUser {
                user_id: user.id,
                reactivated: true,
            });
        }

        let user = DirectoryUser {
            id: UserId::new(),
            email,
            display_name: request.display_name,
            role_id: Some(request.role_id),
            user_type: request.user_type,
            department_id: request.department_id,
            property_id: request.property_id,
            is_active: true,
        };
        let user_id = user.id;
        t.users.insert(user_id, user);
        Ok(ProvisionedUser {
            user_id,
            reactivated: false,
        })
    }
}

#[async_trait::async_trait]
impl InvitationStore for InMemoryAuthorizationStore {
    async fn insert_invitation(&self, invitation: Invitation) -> Result<Invitation, StoreError> {
        let mut t = self.write()?;
        if !t.roles.contains_key(&invitation.role_id) {
            return Err(StoreError::Conflict(format!("role {} does not exist", invitation.role_id)));
        }
        if t.invitation_tokens.contains_key(&invitation.token_hash) {
            return Err(StoreError::Conflict("token digest already in use".to_string()));
        }

        let now = invitation.created_at;
        for other in t
            .invitations
            .values_mut()
            .filter(|i| i.email == invitation.email && i.status == InvitationStatus::Pending)
        {
            if other.is_expired_at(now) {
                other.apply(InvitationTransition::Expire { at: now });
            } else {
                return Err(StoreError::Conflict(format!(
                    "pending invitation exists for {}",
                    invitation.email
                )));
            }
        }

        t.invitation_tokens
            .insert(invitation.token_hash.clone(), invitation.id);
        t.invitations.insert(invitation.id, invitation.clone());
        Ok(invitation)
    }

    async fn invitation(&self, id: InvitationId) -> Result<Option<Invitation>, StoreError> {
        Ok(self.read()?.invitations.get(&id).cloned())
    }

    async fn invitation_by_token_hash(&self, token_hash: &str) -> Result<Option<Invitation>, StoreError> {
        let t = self.read()?;
        Ok(t.invitation_tokens
            .get(token_hash)
            .and_then(|id| t.invitations.get(id))
            .cloned())
    }

    async fn live_invitation_for_email(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .read()?
            .invitations
            .values()
            .find(|i| i.email == email && i.is_acceptable_at(now))
            .cloned())
    }

    async fn transition_invitation(
        &self,
        id: InvitationId,
        transition: InvitationTransition,
    ) -> Result<Option<Invitation>, StoreError> {
        let mut t = self.write()?;
        let invitation = t
            .invitations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("invitation {id}")))?;
        Ok(invitation.apply(transition).then(|| invitation.clone()))
    }

    async fn reopen_invitation(&self, id: InvitationId) -> Result<bool, StoreError> {
        let mut t = self.write()?;
        let invitation = t
            .invitations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("invitation {id}")))?;
        Ok(invitation.reopen())
    }

    async fn attach_accepted_user(&self, id: InvitationId, user_id: UserId) -> Result<(), StoreError> {
        let mut t = self.write()?;
        let invitation = t
            .invitations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("invitation {id}")))?;
        invitation.accepted_user_id = Some(user_id);
        Ok(())
    }

    async fn rotate_invitation_token(
        &self,
        id: InvitationId,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError> {
        let mut t = self.write()?;
        if t.invitation_tokens.contains_key(token_hash) {
            return Err(StoreError::Conflict("token digest already in use".to_string()));
        }

        let Some(invitation) = t.invitations.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("invitation {id}")));
        };
        if invitation.status != InvitationStatus::Pending {
            return Ok(None);
        }
        let old = std::mem::replace(&mut invitation.token_hash, token_hash.to_string());
        invitation.expires_at = expires_at;
        let updated = invitation.clone();

        t.invitation_tokens.remove(&old);
        t.invitation_tokens.insert(token_hash.to_string(), id);
        Ok(Some(updated))
    }

    async fn expire_pending_invitations(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut t = self.write()?;
        let mut expired = 0;
        for invitation in t
            .invitations
            .values_mut()
            .filter(|i| i.status == InvitationStatus::Pending && i.is_expired_at(now))
        {
            invitation.apply(InvitationTransition::Expire { at: now });
            expired += 1;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use staybase_auth::permissions::NewPermission;
    use staybase_auth::roles::{NewRole, UserType};
    use staybase_auth::PermissionCatalog;
    use staybase_auth::RoleRegistry;
    use std::sync::Arc;

    fn key(s: &str) -> PermissionKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn register_is_insert_or_get() {
        let store = InMemoryAuthorizationStore::new();
        let now = Utc::now();

        let first = store
            .register_permission(NewPermission::new(key("unit.read.property"), "Read units").into_permission(now))
            .await
            .unwrap();
        let second = store
            .register_permission(NewPermission::new(key("unit.read.property"), "Other").into_permission(now))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Read units");
        assert_eq!(store.permissions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_override_reuses_the_row() {
        let store = InMemoryAuthorizationStore::new();
        let now = Utc::now();
        let p = store
            .register_permission(NewPermission::new(key("guest.read.property"), "Read guests").into_permission(now))
            .await
            .unwrap();
        let (user, admin) = (UserId::new(), UserId::new());

        store
            .upsert_override(PermissionOverride::new(user, p.id, true, admin, now))
            .await
            .unwrap();
        store
            .deactivate_override(user, p.id, admin, now)
            .await
            .unwrap();
        let row = store
            .upsert_override(PermissionOverride::new(user, p.id, false, admin, now))
            .await
            .unwrap();

        assert!(row.is_active);
        assert!(!row.granted);
        assert!(row.revoked_by.is_none());
        assert_eq!(store.overrides(user).await.unwrap().len(), 1);
        assert_eq!(store.active_overrides(user).await.unwrap().get(p.id), Some(false));
    }

    #[tokio::test]
    async fn referenced_permission_cannot_be_deleted() {
        let store = Arc::new(InMemoryAuthorizationStore::new());
        let now = Utc::now();
        let catalog = PermissionCatalog::new(store.clone());
        let registry = RoleRegistry::new(store.clone());

        let p = catalog
            .register(NewPermission::new(key("task.read.property"), "Read tasks"), now)
            .await
            .unwrap();
        registry
            .create(NewRole::new("Viewer", RoleScope::Platform).with_permissions([p.id]), now)
            .await
            .unwrap();

        assert!(matches!(
            store.delete_permission(p.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_users_have_no_role() {
        let store = Arc::new(InMemoryAuthorizationStore::new());
        let registry = RoleRegistry::new(store.clone());
        let role = registry
            .create(NewRole::new("Viewer", RoleScope::Platform), Utc::now())
            .await
            .unwrap();
        let user = store
            .insert_user(DirectoryUser::new("ana@hotel.test", "Ana", UserType::Platform).with_role(role.id))
            .unwrap();

        assert_eq!(store.role_of(user.id).await.unwrap(), Some(role.id));
        store.deactivate_user(user.id).unwrap();
        assert_eq!(store.role_of(user.id).await.unwrap(), None);
        assert_eq!(store.users_with_role(role.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn insert_invitation_expires_stale_pending_rows_for_the_email() {
        let store = Arc::new(InMemoryAuthorizationStore::new());
        let registry = RoleRegistry::new(store.clone());
        let now = Utc::now();
        let role = registry
            .create(NewRole::new("Viewer", RoleScope::Platform), now)
            .await
            .unwrap();

        let invitation = |created_at: DateTime<Utc>, hash: &str| Invitation {
            id: InvitationId::new(),
            email: "ana@hotel.test".into(),
            role_id: role.id,
            department_id: None,
            property_id: None,
            message: None,
            status: InvitationStatus::Pending,
            token_hash: hash.into(),
            invited_by: UserId::new(),
            expires_at: created_at + chrono::Duration::hours(1),
            created_at,
            accepted_at: None,
            accepted_user_id: None,
            cancelled_at: None,
            cancelled_by: None,
        };

        let stale = store
            .insert_invitation(invitation(now - chrono::Duration::hours(2), "a"))
            .await
            .unwrap();
        store.insert_invitation(invitation(now, "b")).await.unwrap();
        assert!(matches!(
            store.insert_invitation(invitation(now, "c")).await,
            Err(StoreError::Conflict(_))
        ));

        let stale = store.invitation(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, InvitationStatus::Expired);
    }
}
