//! Authorization error taxonomy.

use thiserror::Error;

use staybase_core::{DomainError, PermissionId};

use crate::store::StoreError;

/// Result type used by every authorization service.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors returned by administrative and provisioning operations.
///
/// An ordinary access denial is **not** an error: the resolver and guard
/// return it as a value. `PermissionDenied` exists only for callers that opt
/// into `require*` helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown permission id: {0}")]
    InvalidPermission(PermissionId),

    #[error("in use: {0}")]
    InUse(String),

    /// The actor lacks authority for the administrative action itself.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invitation token is invalid")]
    InvalidToken,

    #[error("invitation has expired")]
    Expired,

    #[error("invitation was already processed")]
    AlreadyProcessed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A declared permission requirement does not exist in the catalog.
    #[error("permission key unknown: {0}")]
    PermissionKeyUnknown(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl AuthError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<StoreError> for AuthError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(what) => AuthError::NotFound(what),
            StoreError::Conflict(msg) => AuthError::Conflict(msg),
            StoreError::Backend(msg) => AuthError::Storage(msg),
        }
    }
}
