//! Default hotel catalog and system roles.
//!
//! Every step is insert-or-skip, so provisioning can run on every deploy.

use chrono::{DateTime, Utc};
use tracing::info;

use staybase_core::{OrganizationId, PropertyId};

use crate::catalog::PermissionCatalog;
use crate::error::AuthResult;
use crate::permissions::{NewPermission, Permission, PermissionKey, Scope};
use crate::registry::RoleRegistry;
use crate::roles::{NewRole, RoleScope};
use crate::store::{PermissionStore, RoleStore, UserDirectory};

/// Property-level business resources with full CRUD.
pub const PROPERTY_RESOURCES: [&str; 5] = ["guest", "reservation", "unit", "task", "department"];

pub const CRUD_ACTIONS: [&str; 4] = ["create", "read", "update", "delete"];

/// Administrative `resource.action` pairs registered at every scope.
pub const ADMIN_PERMISSIONS: [(&str, &str); 4] = [
    ("role", "assign"),
    ("role", "manage"),
    ("invitation", "manage"),
    ("user", "manage"),
];

pub const PLATFORM_ADMIN: &str = "PLATFORM_ADMIN";

/// A role to provision, with permissions named by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTemplate {
    pub name: String,
    pub description: Option<String>,
    pub scope: RoleScope,
    pub priority: i32,
    pub permission_keys: Vec<PermissionKey>,
}

impl RoleTemplate {
    pub fn new(name: impl Into<String>, scope: RoleScope, priority: i32) -> Self {
        Self {
            name: name.into(),
            description: None,
            scope,
            priority,
            permission_keys: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_keys(mut self, keys: impl IntoIterator<Item = PermissionKey>) -> Self {
        self.permission_keys.extend(keys);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub permissions_created: usize,
    pub roles_created: usize,
}

/// The standard permission catalog.
pub fn default_permissions() -> Vec<NewPermission> {
    let mut out = Vec::new();

    for resource in PROPERTY_RESOURCES {
        for action in CRUD_ACTIONS {
            if let Ok(key) = PermissionKey::new(resource, action, Scope::Property) {
                out.push(NewPermission::new(key, format!("{} {}", title(action), plural(resource))));
            }
        }
    }

    for (resource, action) in ADMIN_PERMISSIONS {
        for scope in Scope::ALL {
            if let Ok(key) = PermissionKey::new(resource, action, scope) {
                out.push(
                    NewPermission::new(key, format!("{} {} ({scope})", title(action), plural(resource)))
                        .system(),
                );
            }
        }
    }

    if let Ok(key) = PermissionKey::new("permission", "manage", Scope::Platform) {
        out.push(NewPermission::new(key, "Manage permission catalog").system());
    }

    out
}

/// Standard tenant roles for one property of one organization.
pub fn default_tenant_roles(organization_id: OrganizationId, property_id: PropertyId) -> Vec<RoleTemplate> {
    let org_scope = RoleScope::Organization { organization_id };
    let property_scope = RoleScope::Property {
        organization_id,
        property_id,
    };

    let property_crud: Vec<PermissionKey> = keys_for(&PROPERTY_RESOURCES, &CRUD_ACTIONS);
    let admin_at = |scopes: &[Scope]| -> Vec<PermissionKey> {
        ADMIN_PERMISSIONS
            .iter()
            .flat_map(|(r, a)| scopes.iter().filter_map(move |s| PermissionKey::new(r, a, *s).ok()))
            .collect()
    };

    vec![
        RoleTemplate::new("ORG_ADMIN", org_scope, 90)
            .with_description("Administers every property of the organization")
            .with_keys(property_crud.clone())
            .with_keys(admin_at(&[Scope::Property, Scope::Organization])),
        RoleTemplate::new("PROPERTY_MANAGER", property_scope, 70)
            .with_description("Runs a single property")
            .with_keys(property_crud)
            .with_keys(admin_at(&[Scope::Property])),
        RoleTemplate::new("FRONT_DESK", property_scope, 40)
            .with_description("Guest check-in and reservations")
            .with_keys(keys_for(&["guest", "reservation"], &CRUD_ACTIONS))
            .with_keys(keys_for(&["unit"], &["read"])),
        RoleTemplate::new("HOUSEKEEPING", property_scope, 20)
            .with_description("Cleaning tasks and unit status")
            .with_keys(keys_for(&["task"], &["read", "update"]))
            .with_keys(keys_for(&["unit"], &["read", "update"])),
    ]
}

/// Register the default catalog, `PLATFORM_ADMIN`, and `tenant_roles`.
pub async fn seed_defaults<S>(
    catalog: &PermissionCatalog<S>,
    registry: &RoleRegistry<S>,
    tenant_roles: &[RoleTemplate],
    now: DateTime<Utc>,
) -> AuthResult<SeedReport>
where
    S: PermissionStore + RoleStore + UserDirectory,
{
    let mut report = SeedReport::default();

    let mut all = Vec::new();
    for request in default_permissions() {
        let existed = catalog.find_key(&request.key).await?.is_some();
        let permission = catalog.register(request, now).await?;
        if !existed {
            report.permissions_created += 1;
        }
        all.push(permission);
    }

    let platform_admin = RoleTemplate::new(PLATFORM_ADMIN, RoleScope::Platform, 100)
        .with_description("Full access to the platform")
        .with_keys(all.iter().map(|p: &Permission| p.key.clone()));

    for template in std::iter::once(&platform_admin).chain(tenant_roles) {
        if registry
            .find_by_name(&template.name, &template.scope)
            .await?
            .is_some()
        {
            continue;
        }

        let mut ids = Vec::with_capacity(template.permission_keys.len());
        for key in &template.permission_keys {
            ids.push(catalog.lookup_key(key).await?.id);
        }

        let mut request = NewRole::new(template.name.clone(), template.scope)
            .with_priority(template.priority)
            .with_permissions(ids);
        if let Some(description) = &template.description {
            request = request.with_description(description.clone());
        }
        registry.create(request, now).await?;
        report.roles_created += 1;
    }

    info!(
        permissions_created = report.permissions_created,
        roles_created = report.roles_created,
        "authorization defaults seeded"
    );
    Ok(report)
}

fn keys_for(resources: &[&str], actions: &[&str]) -> Vec<PermissionKey> {
    resources
        .iter()
        .flat_map(|r| {
            actions
                .iter()
                .filter_map(move |a| PermissionKey::new(r, a, Scope::Property).ok())
        })
        .collect()
}

fn title(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn plural(resource: &str) -> String {
    format!("{resource}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_catalog_shape() {
        let permissions = default_permissions();
        // 5 resources × 4 actions + 4 admin pairs × 3 scopes + permission.manage
        assert_eq!(permissions.len(), 20 + 12 + 1);

        let keys: HashSet<String> = permissions.iter().map(|p| p.key.to_string()).collect();
        assert_eq!(keys.len(), permissions.len());
        assert!(keys.contains("reservation.create.property"));
        assert!(keys.contains("role.assign.organization"));
        assert!(keys.contains("permission.manage.platform"));
    }

    #[test]
    fn admin_permissions_are_system() {
        for p in default_permissions() {
            let admin = ADMIN_PERMISSIONS
                .iter()
                .any(|(r, a)| *r == p.key.resource() && *a == p.key.action())
                || p.key.resource() == "permission";
            assert_eq!(p.is_system, admin, "{}", p.key);
        }
    }

    #[test]
    fn tenant_roles_fit_their_scope() {
        let roles = default_tenant_roles(OrganizationId::new(), PropertyId::new());
        for role in &roles {
            for key in &role.permission_keys {
                assert!(role.scope.admits(key.scope()), "{} cannot carry {key}", role.name);
            }
        }
    }

    #[test]
    fn display_names() {
        assert_eq!(title("create"), "Create");
        assert_eq!(plural("guest"), "guests");
    }
}
