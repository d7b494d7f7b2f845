use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use staybase_core::{InvitationId, RoleId, UserId};

use crate::catalog::PermissionCatalog;
use crate::error::{AuthError, AuthResult};
use crate::guard::{AccessGuard, Decision, DenialReason};
use crate::resolver::PermissionResolver;
use crate::roles::{Role, RoleScope, TenantContext};
use crate::store::{AuthorizationStore, ProvisionUser, ProvisionedUser, StoreError};

use super::model::{
    AcceptInvitation, AcceptedInvitation, Invitation, InvitationPolicy, InvitationPreview,
    InvitationStatus, InvitationToken, InvitationTransition, IssuedInvitation, NewInvitation,
    hash_token, normalize_email,
};

/// Invitation lifecycle: `Pending → {Accepted, Expired, Cancelled}`.
pub struct InvitationService<S> {
    store: Arc<S>,
    guard: AccessGuard<S>,
    policy: InvitationPolicy,
}

impl<S> Clone for InvitationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            guard: self.guard.clone(),
            policy: self.policy,
        }
    }
}

impl<S> InvitationService<S>
where
    S: AuthorizationStore,
{
    pub fn new(store: Arc<S>, policy: InvitationPolicy) -> Self {
        let guard = AccessGuard::new(
            PermissionCatalog::new(store.clone()),
            PermissionResolver::new(store.clone()),
        );
        Self {
            store,
            guard,
            policy,
        }
    }

    pub fn policy(&self) -> &InvitationPolicy {
        &self.policy
    }

    /// Invite `email` into `role_id`.
    ///
    /// The inviter must be allowed `role.assign.<role scope>` and must hold every
    /// permission the role carries. An email that already belongs to an active
    /// user is a `Conflict`. Nothing is written on failure.
    #[instrument(skip_all, fields(role_id = %request.role_id, %invited_by), err)]
    pub async fn create(
        &self,
        request: NewInvitation,
        invited_by: UserId,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedInvitation> {
        let email = normalize_email(&request.email)?;
        let role = self.role(request.role_id).await?;
        if !role.is_active {
            return Err(AuthError::invalid_state(format!("role '{}' is inactive", role.name)));
        }

        let assign_key = format!("role.assign.{}", role.scope.level());
        self.ensure_allowed(invited_by, &assign_key, &role.scope).await?;

        if !self
            .guard
            .allows_all(invited_by, role.permissions.iter().copied())
            .await?
        {
            warn!(role = %role.name, "inviter does not hold every permission of the role");
            return Err(AuthError::forbidden(format!(
                "cannot invite into '{}': inviter lacks some of its permissions",
                role.name
            )));
        }

        if self.store.active_user_by_email(&email).await?.is_some() {
            warn!(role = %role.name, "invitation targets an active user");
            return Err(AuthError::Conflict(format!("{email} already belongs to an active user")));
        }

        if self
            .store
            .live_invitation_for_email(&email, now)
            .await?
            .is_some()
        {
            return Err(AuthError::Conflict(format!(
                "a pending invitation already exists for {email}"
            )));
        }

        let token = InvitationToken::generate();
        let invitation = Invitation {
            id: InvitationId::new(),
            email,
            role_id: role.id,
            department_id: request.department_id,
            property_id: request.property_id.or(role.scope.property_id()),
            message: request.message,
            status: InvitationStatus::Pending,
            token_hash: token.hash(),
            invited_by,
            expires_at: self.policy.expires_at(now)?,
            created_at: now,
            accepted_at: None,
            accepted_user_id: None,
            cancelled_at: None,
            cancelled_by: None,
        };

        let invitation = self
            .store
            .insert_invitation(invitation)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    AuthError::Conflict("a pending invitation already exists for this email".into())
                }
                other => other.into(),
            })?;

        info!(invitation_id = %invitation.id, expires_at = %invitation.expires_at, "invitation created");
        Ok(IssuedInvitation { invitation, token })
    }

    /// Redeem a token.
    ///
    /// Expiry is reported as `Expired` whether or not a sweep already moved the
    /// row. The token is claimed with a compare-and-set on status and token
    /// digest before the user is provisioned, so of two concurrent callers
    /// exactly one succeeds and a token rotated by `reissue` cannot win. If
    /// provisioning fails the claim is released again.
    #[instrument(skip_all, err)]
    pub async fn accept(
        &self,
        token: &str,
        profile: AcceptInvitation,
        now: DateTime<Utc>,
    ) -> AuthResult<AcceptedInvitation> {
        let token_hash = hash_token(token);
        let invitation = self
            .store
            .invitation_by_token_hash(&token_hash)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        match invitation.status {
            InvitationStatus::Expired => return Err(AuthError::Expired),
            InvitationStatus::Pending if invitation.is_expired_at(now) => {
                self.expire(&invitation, now).await?;
                return Err(AuthError::Expired);
            }
            InvitationStatus::Pending => {}
            InvitationStatus::Accepted | InvitationStatus::Cancelled => {
                return Err(AuthError::AlreadyProcessed);
            }
        }

        let role = self.role(invitation.role_id).await?;
        if !role.is_active {
            return Err(AuthError::invalid_state(format!("role '{}' is inactive", role.name)));
        }

        let claimed = match self
            .store
            .transition_invitation(
                invitation.id,
                InvitationTransition::Accept { at: now, token_hash },
            )
            .await?
        {
            Some(claimed) => claimed,
            None => return Err(self.lost_claim(invitation.id).await?),
        };

        let display_name = profile
            .display_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| default_display_name(&claimed.email));

        let request = ProvisionUser {
            email: claimed.email.clone(),
            display_name,
            role_id: claimed.role_id,
            user_type: role.user_type,
            department_id: claimed.department_id,
            property_id: claimed.property_id,
        };

        let provisioned = match self.provision(request, now).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                warn!(invitation_id = %claimed.id, error = %e, "provisioning failed; releasing invitation");
                if !self.store.reopen_invitation(claimed.id).await? {
                    warn!(invitation_id = %claimed.id, "invitation could not be reopened");
                }
                return Err(e);
            }
        };

        self.store
            .attach_accepted_user(claimed.id, provisioned.user_id)
            .await?;

        info!(
            invitation_id = %claimed.id,
            user_id = %provisioned.user_id,
            reactivated = provisioned.reactivated,
            "invitation accepted"
        );

        let invitation = Invitation {
            accepted_user_id: Some(provisioned.user_id),
            ..claimed
        };
        Ok(AcceptedInvitation {
            invitation,
            user_id: provisioned.user_id,
            reactivated: provisioned.reactivated,
        })
    }

    #[instrument(skip_all, fields(%invitation_id, %actor), err)]
    pub async fn cancel(
        &self,
        invitation_id: InvitationId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> AuthResult<Invitation> {
        let invitation = self.managed_pending(invitation_id, actor, now).await?;

        let cancelled = self
            .store
            .transition_invitation(invitation.id, InvitationTransition::Cancel { by: actor, at: now })
            .await?
            .ok_or_else(|| AuthError::invalid_state("invitation is no longer pending"))?;

        info!("invitation cancelled");
        Ok(cancelled)
    }

    /// Rotate the token and push the expiry out by the policy ttl.
    ///
    /// The old token stops working immediately.
    #[instrument(skip_all, fields(%invitation_id, %actor), err)]
    pub async fn reissue(
        &self,
        invitation_id: InvitationId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedInvitation> {
        let invitation = self.managed_pending(invitation_id, actor, now).await?;

        let token = InvitationToken::generate();
        let invitation = self
            .store
            .rotate_invitation_token(invitation.id, &token.hash(), self.policy.expires_at(now)?)
            .await?
            .ok_or_else(|| AuthError::invalid_state("invitation is no longer pending"))?;

        info!(expires_at = %invitation.expires_at, "invitation reissued");
        Ok(IssuedInvitation { invitation, token })
    }

    /// Expire every pending invitation past its expiry. Returns how many moved.
    #[instrument(skip_all, err)]
    pub async fn sweep(&self, now: DateTime<Utc>) -> AuthResult<usize> {
        let expired = self.store.expire_pending_invitations(now).await?;
        if expired > 0 {
            info!(expired, "expired pending invitations");
        }
        Ok(expired)
    }

    pub async fn preview(&self, token: &str, now: DateTime<Utc>) -> AuthResult<InvitationPreview> {
        let invitation = self
            .store
            .invitation_by_token_hash(&hash_token(token))
            .await?
            .ok_or(AuthError::InvalidToken)?;
        let role_name = self.store.role(invitation.role_id).await?.map(|r| r.name);

        Ok(InvitationPreview {
            invitation_id: invitation.id,
            is_valid: invitation.is_acceptable_at(now),
            email: invitation.email,
            role_name,
            status: invitation.status,
            expires_at: invitation.expires_at,
        })
    }

    pub async fn get(&self, invitation_id: InvitationId) -> AuthResult<Invitation> {
        self.store
            .invitation(invitation_id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("invitation {invitation_id}")))
    }

    /// Load a pending, unexpired invitation the actor may manage.
    ///
    /// A pending row found past its expiry is moved to `Expired` and rejected.
    async fn managed_pending(
        &self,
        invitation_id: InvitationId,
        actor: UserId,
        now: DateTime<Utc>,
    ) -> AuthResult<Invitation> {
        let invitation = self.get(invitation_id).await?;
        let role = self.role(invitation.role_id).await?;

        let manage_key = format!("invitation.manage.{}", role.scope.level());
        self.ensure_allowed(actor, &manage_key, &role.scope).await?;

        if invitation.status != InvitationStatus::Pending {
            return Err(AuthError::invalid_state(format!(
                "invitation is {}",
                invitation.status
            )));
        }
        if invitation.is_expired_at(now) {
            self.expire(&invitation, now).await?;
            return Err(AuthError::invalid_state("invitation is expired"));
        }
        Ok(invitation)
    }

    async fn provision(
        &self,
        request: ProvisionUser,
        now: DateTime<Utc>,
    ) -> AuthResult<ProvisionedUser> {
        let provisioned = self.store.provision_user(request).await?;
        // A reactivated user starts over without overrides.
        let cleared = self
            .store
            .deactivate_all_overrides(provisioned.user_id, None, now)
            .await?;
        if cleared > 0 {
            info!(user_id = %provisioned.user_id, cleared, "overrides cleared on reactivation");
        }
        Ok(provisioned)
    }

    /// Why a claim found the row changed: still pending means the token was rotated.
    async fn lost_claim(&self, invitation_id: InvitationId) -> AuthResult<AuthError> {
        let current = self.get(invitation_id).await?;
        Ok(match current.status {
            InvitationStatus::Pending => AuthError::InvalidToken,
            InvitationStatus::Expired => AuthError::Expired,
            InvitationStatus::Accepted | InvitationStatus::Cancelled => AuthError::AlreadyProcessed,
        })
    }

    async fn expire(&self, invitation: &Invitation, now: DateTime<Utc>) -> AuthResult<()> {
        if self
            .store
            .transition_invitation(invitation.id, InvitationTransition::Expire { at: now })
            .await?
            .is_some()
        {
            info!(invitation_id = %invitation.id, "invitation expired");
        }
        Ok(())
    }

    async fn role(&self, role_id: RoleId) -> AuthResult<Role> {
        self.store
            .role(role_id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("role {role_id}")))
    }

    /// `Forbidden` unless `user_id` is allowed `key` where the role lives.
    ///
    /// A key missing from the catalog is a configuration fault and surfaces as
    /// `PermissionKeyUnknown`.
    async fn ensure_allowed(&self, user_id: UserId, key: &str, scope: &RoleScope) -> AuthResult<()> {
        let decision = match tenant_of(scope) {
            Some(ctx) => self.guard.check_within(user_id, key, &ctx).await?,
            None => self.guard.check(user_id, key).await?,
        };
        match decision {
            Decision::Allow => Ok(()),
            Decision::Deny(DenialReason::PermissionKeyUnknown(key)) => {
                Err(AuthError::PermissionKeyUnknown(key))
            }
            Decision::Deny(reason @ DenialReason::PermissionDenied(_)) => {
                warn!(%user_id, %reason, "invitation action denied");
                Err(AuthError::forbidden(reason.to_string()))
            }
        }
    }
}

fn tenant_of(scope: &RoleScope) -> Option<TenantContext> {
    match *scope {
        RoleScope::Platform => None,
        RoleScope::Organization { organization_id } => Some(TenantContext::organization(organization_id)),
        RoleScope::Property {
            organization_id,
            property_id,
        } => Some(TenantContext::property(organization_id, property_id)),
    }
}

fn default_display_name(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use staybase_core::{OrganizationId, PropertyId};

    #[test]
    fn display_name_falls_back_to_local_part() {
        assert_eq!(default_display_name("ana@hotel.test"), "ana");
    }

    #[test]
    fn tenant_context_follows_role_scope() {
        let org = OrganizationId::new();
        let property = PropertyId::new();
        assert_eq!(tenant_of(&RoleScope::Platform), None);
        assert_eq!(
            tenant_of(&RoleScope::Organization { organization_id: org }),
            Some(TenantContext::organization(org))
        );
        assert_eq!(
            tenant_of(&RoleScope::Property {
                organization_id: org,
                property_id: property
            }),
            Some(TenantContext::property(org, property))
        );
    }
}
