//! `staybase-auth`: role-based authorization core with per-user overrides.
//!
//! This crate is decoupled from HTTP and owns no storage: services are generic
//! over the async store traits in [`store`].

pub mod catalog;
pub mod error;
pub mod guard;
pub mod invitation;
pub mod overrides;
pub mod permissions;
pub mod registry;
pub mod resolver;
pub mod roles;
pub mod seed;
pub mod store;

use std::sync::Arc;

pub use catalog::PermissionCatalog;
pub use error::{AuthError, AuthResult};
pub use guard::{AccessGuard, Decision, DenialReason, RequiresPermissions};
pub use invitation::{
    AcceptInvitation, AcceptedInvitation, Invitation, InvitationPolicy, InvitationService,
    InvitationStatus, IssuedInvitation, NewInvitation,
};
pub use overrides::{ActiveOverrides, OverrideRegistry, PermissionOverride};
pub use permissions::{CatalogActor, NewPermission, Permission, PermissionKey, Scope};
pub use registry::RoleRegistry;
pub use resolver::{
    AccessSnapshot, AuthorizationExplanation, DecisionSource, PermissionResolver, Verdict, decide,
};
pub use roles::{NewRole, Role, RoleScope, TenantContext, UserType};
pub use store::{AuthorizationStore, StoreError};

/// Every authorization service, wired onto one store.
pub struct AuthorizationCore<S> {
    pub catalog: PermissionCatalog<S>,
    pub roles: RoleRegistry<S>,
    pub overrides: OverrideRegistry<S>,
    pub resolver: PermissionResolver<S>,
    pub guard: AccessGuard<S>,
    pub invitations: InvitationService<S>,
}

impl<S> Clone for AuthorizationCore<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: self.catalog.clone(),
            roles: self.roles.clone(),
            overrides: self.overrides.clone(),
            resolver: self.resolver.clone(),
            guard: self.guard.clone(),
            invitations: self.invitations.clone(),
        }
    }
}

impl<S> AuthorizationCore<S>
where
    S: AuthorizationStore,
{
    pub fn new(store: Arc<S>, policy: InvitationPolicy) -> Self {
        let catalog = PermissionCatalog::new(store.clone());
        let resolver = PermissionResolver::new(store.clone());
        Self {
            guard: AccessGuard::new(catalog.clone(), resolver.clone()),
            roles: RoleRegistry::new(store.clone()),
            overrides: OverrideRegistry::new(store.clone()),
            invitations: InvitationService::new(store, policy),
            catalog,
            resolver,
        }
    }
}
