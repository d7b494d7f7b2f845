use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use staybase_core::{DomainError, OrganizationId, PermissionId, PropertyId, RoleId};

use crate::permissions::Scope;

/// Tenant scoping of a role.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum RoleScope {
    Platform,
    Organization {
        organization_id: OrganizationId,
    },
    Property {
        organization_id: OrganizationId,
        property_id: PropertyId,
    },
}

impl RoleScope {
    pub fn level(&self) -> Scope {
        match self {
            RoleScope::Platform => Scope::Platform,
            RoleScope::Organization { .. } => Scope::Organization,
            RoleScope::Property { .. } => Scope::Property,
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self {
            RoleScope::Platform => None,
            RoleScope::Organization { organization_id }
            | RoleScope::Property {
                organization_id, ..
            } => Some(*organization_id),
        }
    }

    pub fn property_id(&self) -> Option<PropertyId> {
        match self {
            RoleScope::Property { property_id, .. } => Some(*property_id),
            _ => None,
        }
    }

    /// Whether a role at this scope may carry a permission of `scope`.
    ///
    /// A role never carries a permission broader than itself.
    pub fn admits(&self, scope: Scope) -> bool {
        scope <= self.level()
    }

    /// Whether grants from a role at this scope apply inside `ctx`.
    pub fn covers(&self, ctx: &TenantContext) -> bool {
        match self {
            RoleScope::Platform => true,
            RoleScope::Organization { organization_id } => *organization_id == ctx.organization_id,
            RoleScope::Property {
                organization_id,
                property_id,
            } => *organization_id == ctx.organization_id && Some(*property_id) == ctx.property_id,
        }
    }

    /// Rebuild a scope from its stored columns.
    pub fn from_parts(
        level: Scope,
        organization_id: Option<OrganizationId>,
        property_id: Option<PropertyId>,
    ) -> Result<Self, DomainError> {
        match (level, organization_id, property_id) {
            (Scope::Platform, None, None) => Ok(RoleScope::Platform),
            (Scope::Organization, Some(organization_id), None) => {
                Ok(RoleScope::Organization { organization_id })
            }
            (Scope::Property, Some(organization_id), Some(property_id)) => Ok(RoleScope::Property {
                organization_id,
                property_id,
            }),
            _ => Err(DomainError::validation(format!(
                "inconsistent role scope columns for level '{level}'"
            ))),
        }
    }
}

/// Where a request acts: an organization and, optionally, one of its properties.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: OrganizationId,
    pub property_id: Option<PropertyId>,
}

impl TenantContext {
    pub fn organization(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            property_id: None,
        }
    }

    pub fn property(organization_id: OrganizationId, property_id: PropertyId) -> Self {
        Self {
            organization_id,
            property_id: Some(property_id),
        }
    }
}

/// Class of principal allowed to hold a role.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Platform,
    Organization,
    Property,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Platform => "platform",
            UserType::Organization => "organization",
            UserType::Property => "property",
        }
    }
}

impl core::str::FromStr for UserType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(UserType::Platform),
            "organization" => Ok(UserType::Organization),
            "property" => Ok(UserType::Property),
            other => Err(DomainError::validation(format!("unknown user type '{other}'"))),
        }
    }
}

impl From<Scope> for UserType {
    fn from(value: Scope) -> Self {
        match value {
            Scope::Platform => UserType::Platform,
            Scope::Organization => UserType::Organization,
            Scope::Property => UserType::Property,
        }
    }
}

/// A named bundle of permissions assignable to a user.
///
/// # Invariants
/// - Every id in `permissions` references an existing catalog permission.
/// - No permission is broader than the role's scope.
/// - An inactive role grants nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub description: Option<String>,
    /// Higher wins tie-breaks (listing order, default role selection).
    pub priority: i32,
    pub permissions: BTreeSet<PermissionId>,
    pub scope: RoleScope,
    pub user_type: UserType,
    pub allowed_modules: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// The permission set this role currently grants.
    pub fn effective_permissions(&self) -> BTreeSet<PermissionId> {
        if self.is_active {
            self.permissions.clone()
        } else {
            BTreeSet::new()
        }
    }
}

/// Creation request for the role registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRole {
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub permissions: BTreeSet<PermissionId>,
    pub scope: RoleScope,
    pub user_type: UserType,
    pub allowed_modules: Vec<String>,
}

impl NewRole {
    /// A role whose principal class follows its scope.
    pub fn new(name: impl Into<String>, scope: RoleScope) -> Self {
        Self {
            name: name.into(),
            description: None,
            priority: 0,
            permissions: BTreeSet::new(),
            scope,
            user_type: scope.level().into(),
            allowed_modules: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = PermissionId>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_user_type(mut self, user_type: UserType) -> Self {
        self.user_type = user_type;
        self
    }

    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn into_role(self, now: DateTime<Utc>) -> Role {
        Role {
            id: RoleId::new(),
            name: self.name.trim().to_string(),
            description: self.description,
            priority: self.priority,
            permissions: self.permissions,
            scope: self.scope,
            user_type: self.user_type,
            allowed_modules: self.allowed_modules,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_scope() -> (OrganizationId, PropertyId, RoleScope) {
        let org = OrganizationId::new();
        let property = PropertyId::new();
        (
            org,
            property,
            RoleScope::Property {
                organization_id: org,
                property_id: property,
            },
        )
    }

    #[test]
    fn property_role_admits_only_property_permissions() {
        let (_, _, scope) = property_scope();
        assert!(scope.admits(Scope::Property));
        assert!(!scope.admits(Scope::Organization));
        assert!(!scope.admits(Scope::Platform));
    }

    #[test]
    fn platform_role_admits_everything() {
        for s in Scope::ALL {
            assert!(RoleScope::Platform.admits(s));
        }
    }

    #[test]
    fn coverage_follows_tenant_boundaries() {
        let (org, property, scope) = property_scope();
        assert!(scope.covers(&TenantContext::property(org, property)));
        assert!(!scope.covers(&TenantContext::property(org, PropertyId::new())));
        assert!(!scope.covers(&TenantContext::organization(org)));

        let org_scope = RoleScope::Organization {
            organization_id: org,
        };
        assert!(org_scope.covers(&TenantContext::property(org, property)));
        assert!(!org_scope.covers(&TenantContext::organization(OrganizationId::new())));
        assert!(RoleScope::Platform.covers(&TenantContext::organization(OrganizationId::new())));
    }

    #[test]
    fn scope_round_trips_through_columns() {
        let (org, property, scope) = property_scope();
        let rebuilt = RoleScope::from_parts(Scope::Property, Some(org), Some(property)).unwrap();
        assert_eq!(rebuilt, scope);
        assert!(RoleScope::from_parts(Scope::Platform, Some(org), None).is_err());
    }

    #[test]
    fn inactive_role_grants_nothing() {
        let mut role = NewRole::new("Housekeeper", RoleScope::Platform)
            .with_permissions([PermissionId::new()])
            .into_role(Utc::now());
        assert_eq!(role.effective_permissions().len(), 1);
        role.is_active = false;
        assert!(role.effective_permissions().is_empty());
    }
}
