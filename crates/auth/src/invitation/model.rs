use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use staybase_core::{DepartmentId, DomainError, InvitationId, PropertyId, RoleId, UserId};

const MAX_EMAIL_LEN: usize = 255;

/// Upper bound on an invitation lifetime.
pub const MAX_TTL_HOURS: i64 = 24 * 365;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Expired,
    Cancelled,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Expired => "expired",
            InvitationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }
}

impl core::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for InvitationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvitationStatus::Pending),
            "accepted" => Ok(InvitationStatus::Accepted),
            "expired" => Ok(InvitationStatus::Expired),
            "cancelled" => Ok(InvitationStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown invitation status '{other}'"
            ))),
        }
    }
}

/// A transition out of `Pending`. Stores apply it only while the row is still pending.
///
/// `Accept` also names the token digest it was redeemed with; a row whose token
/// has been rotated since no longer matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationTransition {
    Accept { at: DateTime<Utc>, token_hash: String },
    Expire { at: DateTime<Utc> },
    Cancel { by: UserId, at: DateTime<Utc> },
}

impl InvitationTransition {
    pub fn target(&self) -> InvitationStatus {
        match self {
            InvitationTransition::Accept { .. } => InvitationStatus::Accepted,
            InvitationTransition::Expire { .. } => InvitationStatus::Expired,
            InvitationTransition::Cancel { .. } => InvitationStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    /// Trimmed and lowercased.
    pub email: String,
    pub role_id: RoleId,
    pub department_id: Option<DepartmentId>,
    pub property_id: Option<PropertyId>,
    pub message: Option<String>,
    pub status: InvitationStatus,
    /// SHA-256 hex digest of the token; the token itself is never stored.
    #[serde(skip_serializing, default)]
    pub token_hash: String,
    pub invited_by: UserId,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_user_id: Option<UserId>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<UserId>,
}

impl Invitation {
    /// Past its expiry at `now`. Expiry is strict: `now == expires_at` is still valid.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_acceptable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == InvitationStatus::Pending && !self.is_expired_at(now)
    }

    /// Apply a transition if the row is pending. Returns whether it changed.
    pub fn apply(&mut self, transition: InvitationTransition) -> bool {
        if self.status != InvitationStatus::Pending {
            return false;
        }
        if let InvitationTransition::Accept { token_hash, .. } = &transition {
            if *token_hash != self.token_hash {
                return false;
            }
        }
        self.status = transition.target();
        match transition {
            InvitationTransition::Accept { at, .. } => self.accepted_at = Some(at),
            InvitationTransition::Expire { .. } => {}
            InvitationTransition::Cancel { by, at } => {
                self.cancelled_at = Some(at);
                self.cancelled_by = Some(by);
            }
        }
        true
    }

    /// Undo an acceptance that never got a user attached.
    pub fn reopen(&mut self) -> bool {
        if self.status != InvitationStatus::Accepted || self.accepted_user_id.is_some() {
            return false;
        }
        self.status = InvitationStatus::Pending;
        self.accepted_at = None;
        true
    }
}

/// The plaintext single-use token. Handed to the invitee once, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct InvitationToken(String);

impl InvitationToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hash(&self) -> String {
        hash_token(&self.0)
    }
}

impl From<String> for InvitationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for InvitationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl core::fmt::Debug for InvitationToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("InvitationToken(..)")
    }
}

/// SHA-256 hex digest used as the lookup key for tokens.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Trim, lowercase and validate an email address.
pub fn normalize_email(email: &str) -> Result<String, DomainError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() {
        return Err(DomainError::validation("email is required"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(DomainError::validation("email too long"));
    }
    if email.chars().any(char::is_whitespace) {
        return Err(DomainError::validation("invalid email format"));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(DomainError::validation("invalid email format"));
    };
    let domain_ok = !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.');
    if local.is_empty() || !domain_ok {
        return Err(DomainError::validation("invalid email format"));
    }
    Ok(email)
}

/// Invitation lifetime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvitationPolicy {
    pub ttl: Duration,
}

impl Default for InvitationPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(72),
        }
    }
}

impl InvitationPolicy {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Ttl in whole hours, between 1 and [`MAX_TTL_HOURS`].
    pub fn with_ttl_hours(self, hours: i64) -> Result<Self, DomainError> {
        if !(1..=MAX_TTL_HOURS).contains(&hours) {
            return Err(DomainError::validation(format!(
                "invitation ttl must be between 1 and {MAX_TTL_HOURS} hours, got {hours}"
            )));
        }
        let ttl = Duration::try_hours(hours)
            .ok_or_else(|| DomainError::validation(format!("invitation ttl out of range: {hours}h")))?;
        Ok(self.with_ttl(ttl))
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, DomainError> {
        now.checked_add_signed(self.ttl)
            .ok_or_else(|| DomainError::validation("invitation expiry is out of range"))
    }
}

/// Creation request for an invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvitation {
    pub email: String,
    pub role_id: RoleId,
    pub department_id: Option<DepartmentId>,
    pub property_id: Option<PropertyId>,
    pub message: Option<String>,
}

impl NewInvitation {
    pub fn new(email: impl Into<String>, role_id: RoleId) -> Self {
        Self {
            email: email.into(),
            role_id,
            department_id: None,
            property_id: None,
            message: None,
        }
    }

    pub fn with_department(mut self, department_id: DepartmentId) -> Self {
        self.department_id = Some(department_id);
        self
    }

    pub fn with_property(mut self, property_id: PropertyId) -> Self {
        self.property_id = Some(property_id);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Profile fields the invitee supplies on acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AcceptInvitation {
    pub display_name: Option<String>,
}

impl AcceptInvitation {
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// A freshly minted invitation together with its plaintext token.
#[derive(Debug, Clone)]
pub struct IssuedInvitation {
    pub invitation: Invitation,
    pub token: InvitationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedInvitation {
    pub invitation: Invitation,
    pub user_id: UserId,
    /// An existing user with the same email was reactivated and rebound.
    pub reactivated: bool,
}

/// What an accept page shows before the invitee commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvitationPreview {
    pub invitation_id: InvitationId,
    pub email: String,
    pub role_name: Option<String>,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}
