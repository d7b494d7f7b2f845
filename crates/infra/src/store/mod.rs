//! Authorization store backends.
//!
//! Both backends implement every trait of `staybase_auth::store`, so one value
//! satisfies `AuthorizationStore`.

mod in_memory;
mod postgres;

use serde::{Deserialize, Serialize};

use staybase_auth::roles::UserType;
use staybase_core::{DepartmentId, PropertyId, RoleId, UserId};

pub use in_memory::InMemoryAuthorizationStore;
pub use postgres::PostgresAuthorizationStore;

/// The user record kept by the directory.
///
/// Only the fields authorization and invitation provisioning touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    /// Lowercased.
    pub email: String,
    pub display_name: String,
    pub role_id: Option<RoleId>,
    pub user_type: UserType,
    pub department_id: Option<DepartmentId>,
    pub property_id: Option<PropertyId>,
    /// Inactive users resolve as having no role.
    pub is_active: bool,
}

impl DirectoryUser {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>, user_type: UserType) -> Self {
        Self {
            id: UserId::new(),
            email: email.into().trim().to_lowercase(),
            display_name: display_name.into(),
            role_id: None,
            user_type,
            department_id: None,
            property_id: None,
            is_active: true,
        }
    }

    pub fn with_role(mut self, role_id: RoleId) -> Self {
        self.role_id = Some(role_id);
        self
    }

    pub fn with_department(mut self, department_id: DepartmentId) -> Self {
        self.department_id = Some(department_id);
        self
    }

    pub fn with_property(mut self, property_id: PropertyId) -> Self {
        self.property_id = Some(property_id);
        self
    }
}
