use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use staybase_core::{DomainError, PermissionId};

/// Tenant breadth a permission (or role) applies at.
///
/// Ordered from narrowest to broadest so `Scope::Property < Scope::Platform`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Property,
    Organization,
    Platform,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Platform, Scope::Organization, Scope::Property];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Platform => "platform",
            Scope::Organization => "organization",
            Scope::Property => "property",
        }
    }
}

impl core::fmt::Display for Scope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(Scope::Platform),
            "organization" => Ok(Scope::Organization),
            "property" => Ok(Scope::Property),
            other => Err(DomainError::validation(format!("unknown scope '{other}'"))),
        }
    }
}

/// Textual permission requirement: `"<resource>.<action>.<scope>"`.
///
/// This is the stable contract between declarative operation requirements and
/// the catalog. Always exactly three dot-separated fields; resource and action
/// are lowercase tokens (`a-z`, `0-9`, `_`, `-`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionKey {
    resource: String,
    action: String,
    scope: Scope,
}

impl PermissionKey {
    pub fn new(resource: &str, action: &str, scope: Scope) -> Result<Self, DomainError> {
        validate_token("resource", resource)?;
        validate_token("action", action)?;
        Ok(Self {
            resource: resource.to_string(),
            action: action.to_string(),
            scope,
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }
}

fn validate_token(field: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("permission {field} is empty")));
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !valid {
        return Err(DomainError::validation(format!(
            "permission {field} '{value}' must be a lowercase token"
        )));
    }
    Ok(())
}

impl core::fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.resource, self.action, self.scope)
    }
}

impl FromStr for PermissionKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let [resource, action, scope] = parts.as_slice() else {
            return Err(DomainError::validation(format!(
                "permission key '{s}' must have exactly three dot-separated fields"
            )));
        };
        PermissionKey::new(resource, action, scope.parse()?)
    }
}

impl TryFrom<String> for PermissionKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PermissionKey> for String {
    fn from(value: PermissionKey) -> Self {
        value.to_string()
    }
}

/// A catalog permission: one atomic capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub key: PermissionKey,
    pub name: String,
    pub description: Option<String>,
    /// System permissions cannot be edited or deleted by tenant administrators.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn scope(&self) -> Scope {
        self.key.scope()
    }
}

/// Registration request for the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPermission {
    pub key: PermissionKey,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
}

impl NewPermission {
    pub fn new(key: PermissionKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            description: None,
            is_system: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Materialize into a catalog row with a fresh id.
    pub fn into_permission(self, created_at: DateTime<Utc>) -> Permission {
        Permission {
            id: PermissionId::new(),
            key: self.key,
            name: self.name,
            description: self.description,
            is_system: self.is_system,
            created_at,
        }
    }
}

/// Who is editing the catalog.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CatalogActor {
    /// Seed scripts and platform administration tooling.
    System,
    /// A tenant administrator; may not touch system permissions.
    Tenant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_three_field_keys() {
        let key: PermissionKey = "unit.create.property".parse().unwrap();
        assert_eq!(key.resource(), "unit");
        assert_eq!(key.action(), "create");
        assert_eq!(key.scope(), Scope::Property);
        assert_eq!(key.to_string(), "unit.create.property");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!("unit.create".parse::<PermissionKey>().is_err());
        assert!("unit.create.property.extra".parse::<PermissionKey>().is_err());
        assert!("".parse::<PermissionKey>().is_err());
    }

    #[test]
    fn rejects_unknown_scope_and_uppercase_tokens() {
        assert!("unit.create.galaxy".parse::<PermissionKey>().is_err());
        assert!("Unit.create.property".parse::<PermissionKey>().is_err());
        assert!("unit..property".parse::<PermissionKey>().is_err());
    }

    #[test]
    fn scope_breadth_ordering() {
        assert!(Scope::Platform > Scope::Organization);
        assert!(Scope::Organization > Scope::Property);
    }

    #[test]
    fn key_serializes_as_wire_string() {
        let key: PermissionKey = "role.assign.platform".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"role.assign.platform\"");
        let back: PermissionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    proptest! {
        #[test]
        fn well_formed_keys_display_as_their_input(
            resource in "[a-z][a-z0-9_]{0,12}",
            action in "[a-z][a-z0-9_-]{0,12}",
            scope in prop::sample::select(Scope::ALL.to_vec()),
        ) {
            let text = format!("{resource}.{action}.{scope}");
            let key: PermissionKey = text.parse().unwrap();
            prop_assert_eq!(key.to_string(), text);
        }

        #[test]
        fn keys_without_two_dots_never_parse(text in "[a-z.]{0,24}") {
            prop_assume!(text.matches('.').count() != 2);
            prop_assert!(text.parse::<PermissionKey>().is_err());
        }
    }
}
