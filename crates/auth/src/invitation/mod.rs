//! User invitations: single-use, expiring tokens that provision a user into a role.

mod model;
mod service;

pub use model::{
    AcceptInvitation, AcceptedInvitation, Invitation, InvitationPolicy, InvitationPreview,
    InvitationStatus, InvitationToken, InvitationTransition, IssuedInvitation, MAX_TTL_HOURS,
    NewInvitation, hash_token, normalize_email,
};
pub use service::InvitationService;
