//! `staybase-core`: identity and error primitives shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{
    DepartmentId, InvitationId, OrganizationId, PermissionId, PropertyId, RoleId, UserId,
};
