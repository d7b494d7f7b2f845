//! Invitation lifecycle end to end against the in-memory store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use staybase_auth::{
    AcceptInvitation, AuthError, AuthorizationCore, InvitationPolicy, InvitationStatus,
    IssuedInvitation, NewInvitation, NewPermission, NewRole, Permission, Role, RoleScope,
};
use staybase_auth::invitation::{InvitationTransition, hash_token};
use staybase_auth::store::{InvitationStore, OverrideStore, UserDirectory};
use staybase_core::{OrganizationId, PropertyId, UserId};
use staybase_infra::{DirectoryUser, InMemoryAuthorizationStore};

struct Hotel {
    store: Arc<InMemoryAuthorizationStore>,
    core: AuthorizationCore<InMemoryAuthorizationStore>,
    now: DateTime<Utc>,
    scope: RoleScope,
    housekeeping: Role,
    manager: UserId,
    unit_read: Permission,
}

impl Hotel {
    async fn open() -> Self {
        let store = Arc::new(InMemoryAuthorizationStore::new());
        let core = AuthorizationCore::new(store.clone(), InvitationPolicy::default().with_ttl_hours(48).unwrap());
        let now = Utc::now();
        let scope = RoleScope::Property {
            organization_id: OrganizationId::new(),
            property_id: PropertyId::new(),
        };

        let mut permissions = Vec::new();
        for key in [
            "unit.read.property",
            "unit.update.property",
            "role.assign.property",
            "invitation.manage.property",
        ] {
            permissions.push(
                core.catalog
                    .register(NewPermission::new(key.parse().unwrap(), key), now)
                    .await
                    .unwrap(),
            );
        }

        let housekeeping = core
            .roles
            .create(
                NewRole::new("HOUSEKEEPING", scope).with_permissions([permissions[0].id, permissions[1].id]),
                now,
            )
            .await
            .unwrap();
        let manager_role = core
            .roles
            .create(
                NewRole::new("PROPERTY_MANAGER", scope).with_permissions(permissions.iter().map(|p| p.id)),
                now,
            )
            .await
            .unwrap();
        let manager = store
            .insert_user(
                DirectoryUser::new("manager@hotel.test", "Manager", manager_role.user_type)
                    .with_role(manager_role.id),
            )
            .unwrap()
            .id;

        Self {
            unit_read: permissions[0].clone(),
            store,
            core,
            now,
            scope,
            housekeeping,
            manager,
        }
    }

    async fn invite(&self, email: &str) -> IssuedInvitation {
        self.core
            .invitations
            .create(NewInvitation::new(email, self.housekeeping.id), self.manager, self.now)
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_accepts_succeed_exactly_once() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;

    let (a, b) = {
        let (s1, s2) = (hotel.core.invitations.clone(), hotel.core.invitations.clone());
        let (t1, t2) = (issued.token.as_str().to_string(), issued.token.as_str().to_string());
        let now = hotel.now;
        let first = tokio::spawn(async move { s1.accept(&t1, AcceptInvitation::default(), now).await });
        let second = tokio::spawn(async move { s2.accept(&t2, AcceptInvitation::default(), now).await });
        let (a, b) = tokio::join!(first, second);
        (a.unwrap(), b.unwrap())
    };

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(AuthError::AlreadyProcessed)))
    );

    let stored = hotel.core.invitations.get(issued.invitation.id).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Accepted);
    assert!(stored.accepted_user_id.is_some());
}

#[tokio::test]
async fn accept_after_expiry_marks_the_row_expired() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("late@hotel.test").await;
    let later = issued.invitation.expires_at + Duration::seconds(1);

    let err = hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), later)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Expired);

    let stored = hotel.core.invitations.get(issued.invitation.id).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Expired);
    assert!(hotel.store.user_by_email("late@hotel.test").unwrap().is_none());

    // Accepting at exactly the expiry instant is still allowed.
    let issued = hotel.invite("edge@hotel.test").await;
    hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), issued.invitation.expires_at)
        .await
        .unwrap();
}

#[tokio::test]
async fn swept_tokens_still_report_expired() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("swept@hotel.test").await;
    let later = issued.invitation.expires_at + Duration::seconds(1);

    assert_eq!(hotel.core.invitations.sweep(later).await.unwrap(), 1);
    for _ in 0..2 {
        let err = hotel
            .core
            .invitations
            .accept(issued.token.as_str(), AcceptInvitation::default(), later)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }
    assert!(hotel.store.user_by_email("swept@hotel.test").unwrap().is_none());
}

#[tokio::test]
async fn unknown_tokens_are_rejected() {
    let hotel = Hotel::open().await;
    let err = hotel
        .core
        .invitations
        .accept("not-a-token", AcceptInvitation::default(), hotel.now)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidToken);
}

#[tokio::test]
async fn cancel_requires_a_pending_invitation() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;
    hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), hotel.now)
        .await
        .unwrap();

    let err = hotel
        .core
        .invitations
        .cancel(issued.invitation.id, hotel.manager, hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(_)), "{err:?}");
}

#[tokio::test]
async fn cancelled_tokens_cannot_be_accepted() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;

    let cancelled = hotel
        .core
        .invitations
        .cancel(issued.invitation.id, hotel.manager, hotel.now)
        .await
        .unwrap();
    assert_eq!(cancelled.status, InvitationStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(hotel.manager));

    let err = hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), hotel.now)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::AlreadyProcessed);
}

#[tokio::test]
async fn cancel_needs_invitation_manage() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;
    let housekeeper = hotel
        .store
        .insert_user(
            DirectoryUser::new("hk@hotel.test", "HK", hotel.housekeeping.user_type)
                .with_role(hotel.housekeeping.id),
        )
        .unwrap()
        .id;

    let err = hotel
        .core
        .invitations
        .cancel(issued.invitation.id, housekeeper, hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Forbidden(_)), "{err:?}");
}

#[tokio::test]
async fn sweep_expires_only_past_due_rows() {
    let hotel = Hotel::open().await;
    let early = hotel.invite("early@hotel.test").await;
    let later_issue = hotel
        .core
        .invitations
        .create(
            NewInvitation::new("later@hotel.test", hotel.housekeeping.id),
            hotel.manager,
            hotel.now + Duration::hours(24),
        )
        .await
        .unwrap();

    let sweep_at = early.invitation.expires_at + Duration::minutes(1);
    assert_eq!(hotel.core.invitations.sweep(sweep_at).await.unwrap(), 1);
    assert_eq!(hotel.core.invitations.sweep(sweep_at).await.unwrap(), 0);

    let early = hotel.core.invitations.get(early.invitation.id).await.unwrap();
    let later = hotel.core.invitations.get(later_issue.invitation.id).await.unwrap();
    assert_eq!(early.status, InvitationStatus::Expired);
    assert_eq!(later.status, InvitationStatus::Pending);
}

#[tokio::test]
async fn reissue_invalidates_the_old_token() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;
    let an_hour_later = hotel.now + Duration::hours(1);

    let reissued = hotel
        .core
        .invitations
        .reissue(issued.invitation.id, hotel.manager, an_hour_later)
        .await
        .unwrap();
    assert_ne!(reissued.token.as_str(), issued.token.as_str());
    assert_eq!(reissued.invitation.expires_at, an_hour_later + Duration::hours(48));

    let err = hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), an_hour_later)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidToken);

    hotel
        .core
        .invitations
        .accept(reissued.token.as_str(), AcceptInvitation::default(), an_hour_later)
        .await
        .unwrap();
}

#[tokio::test]
async fn claim_with_a_rotated_token_loses() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;
    let old_hash = hash_token(issued.token.as_str());

    // The old token was looked up before the rotation committed.
    let pending = hotel.store.invitation_by_token_hash(&old_hash).await.unwrap().unwrap();
    let reissued = hotel
        .core
        .invitations
        .reissue(pending.id, hotel.manager, hotel.now)
        .await
        .unwrap();

    let claimed = hotel
        .store
        .transition_invitation(
            pending.id,
            InvitationTransition::Accept { at: hotel.now, token_hash: old_hash },
        )
        .await
        .unwrap();
    assert!(claimed.is_none());

    let stored = hotel.core.invitations.get(pending.id).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Pending);

    hotel
        .core
        .invitations
        .accept(reissued.token.as_str(), AcceptInvitation::default(), hotel.now)
        .await
        .unwrap();
}

#[tokio::test]
async fn reissue_of_an_expired_invitation_fails() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;
    let later = issued.invitation.expires_at + Duration::hours(1);

    let err = hotel
        .core
        .invitations
        .reissue(issued.invitation.id, hotel.manager, later)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(_)), "{err:?}");

    let stored = hotel.core.invitations.get(issued.invitation.id).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Expired);
}

#[tokio::test]
async fn reactivated_users_lose_their_overrides() {
    let hotel = Hotel::open().await;
    let former = hotel
        .store
        .insert_user(DirectoryUser::new("back@hotel.test", "Back", hotel.housekeeping.user_type))
        .unwrap()
        .id;
    hotel.store.deactivate_user(former).unwrap();
    hotel
        .core
        .overrides
        .set_override(former, hotel.unit_read.id, false, hotel.manager, hotel.now)
        .await
        .unwrap();

    let issued = hotel.invite("Back@Hotel.test").await;
    let accepted = hotel
        .core
        .invitations
        .accept(
            issued.token.as_str(),
            AcceptInvitation::default().with_display_name("Back Again"),
            hotel.now,
        )
        .await
        .unwrap();

    assert_eq!(accepted.user_id, former);
    assert!(accepted.reactivated);
    assert!(hotel.store.active_overrides(former).await.unwrap().is_empty());
    assert_eq!(hotel.store.role_of(former).await.unwrap(), Some(hotel.housekeeping.id));
    assert!(hotel.core.resolver.is_allowed(former, hotel.unit_read.id).await.unwrap());

    let user = hotel.store.user(former).unwrap().unwrap();
    assert!(user.is_active);
    assert_eq!(user.display_name, "Back Again");
}

#[tokio::test]
async fn active_users_cannot_be_invited_into_another_role() {
    let hotel = Hotel::open().await;
    let peer_role = hotel.store.role_of(hotel.manager).await.unwrap().unwrap();
    let peer = hotel
        .store
        .insert_user(
            DirectoryUser::new("peer@hotel.test", "Peer", hotel.housekeeping.user_type).with_role(peer_role),
        )
        .unwrap()
        .id;
    hotel
        .core
        .overrides
        .set_override(peer, hotel.unit_read.id, true, hotel.manager, hotel.now)
        .await
        .unwrap();

    let err = hotel
        .core
        .invitations
        .create(NewInvitation::new("Peer@hotel.test", hotel.housekeeping.id), hotel.manager, hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Conflict(_)), "{err:?}");

    assert_eq!(hotel.store.role_of(peer).await.unwrap(), Some(peer_role));
    assert_eq!(hotel.store.active_overrides(peer).await.unwrap().len(), 1);
}

#[tokio::test]
async fn accept_refuses_to_rebind_a_user_activated_since_the_invite() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("late-hire@hotel.test").await;
    let hired = hotel
        .store
        .insert_user(DirectoryUser::new("late-hire@hotel.test", "Hired", hotel.housekeeping.user_type))
        .unwrap()
        .id;

    let err = hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Conflict(_)), "{err:?}");

    assert_eq!(hotel.store.role_of(hired).await.unwrap(), None);
    let stored = hotel.core.invitations.get(issued.invitation.id).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Pending);
}

#[tokio::test]
async fn missing_assign_permission_is_a_configuration_error() {
    let store = Arc::new(InMemoryAuthorizationStore::new());
    let core = AuthorizationCore::new(store.clone(), InvitationPolicy::default());
    let now = Utc::now();
    let scope = RoleScope::Organization {
        organization_id: OrganizationId::new(),
    };

    let read = core
        .catalog
        .register(NewPermission::new("unit.read.organization".parse().unwrap(), "Read units"), now)
        .await
        .unwrap();
    let role = core
        .roles
        .create(NewRole::new("REGIONAL", scope).with_permissions([read.id]), now)
        .await
        .unwrap();
    let inviter = store
        .insert_user(DirectoryUser::new("regional@hotel.test", "Regional", role.user_type).with_role(role.id))
        .unwrap()
        .id;

    let err = core
        .invitations
        .create(NewInvitation::new("ana@hotel.test", role.id), inviter, now)
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::PermissionKeyUnknown("role.assign.organization".to_string()));
}

#[tokio::test]
async fn preview_reports_validity_without_side_effects() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;

    let preview = hotel
        .core
        .invitations
        .preview(issued.token.as_str(), hotel.now)
        .await
        .unwrap();
    assert!(preview.is_valid);
    assert_eq!(preview.email, "ana@hotel.test");
    assert_eq!(preview.role_name.as_deref(), Some("HOUSEKEEPING"));

    let after = issued.invitation.expires_at + Duration::seconds(1);
    let preview = hotel
        .core
        .invitations
        .preview(issued.token.as_str(), after)
        .await
        .unwrap();
    assert!(!preview.is_valid);
    assert_eq!(preview.status, InvitationStatus::Pending);
}

#[tokio::test]
async fn inviter_must_hold_every_permission_of_the_role() {
    let hotel = Hotel::open().await;
    let delete = hotel
        .core
        .catalog
        .register(NewPermission::new("unit.delete.property".parse().unwrap(), "Delete units"), hotel.now)
        .await
        .unwrap();
    let supervisor = hotel
        .core
        .roles
        .create(
            NewRole::new("SUPERVISOR", hotel.scope).with_permissions([hotel.unit_read.id, delete.id]),
            hotel.now,
        )
        .await
        .unwrap();

    let err = hotel
        .core
        .invitations
        .create(NewInvitation::new("sup@hotel.test", supervisor.id), hotel.manager, hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Forbidden(_)), "{err:?}");
}

#[tokio::test]
async fn one_live_invitation_per_email() {
    let hotel = Hotel::open().await;
    let first = hotel.invite("ana@hotel.test").await;

    let err = hotel
        .core
        .invitations
        .create(NewInvitation::new("ANA@hotel.test", hotel.housekeeping.id), hotel.manager, hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Conflict(_)), "{err:?}");

    // Once the first has lapsed a new one may be issued.
    let later = first.invitation.expires_at + Duration::seconds(1);
    hotel
        .core
        .invitations
        .create(NewInvitation::new("ana@hotel.test", hotel.housekeeping.id), hotel.manager, later)
        .await
        .unwrap();
    let first = hotel.core.invitations.get(first.invitation.id).await.unwrap();
    assert_eq!(first.status, InvitationStatus::Expired);
}

#[tokio::test]
async fn invitations_into_inactive_roles_are_refused() {
    let hotel = Hotel::open().await;
    let issued = hotel.invite("ana@hotel.test").await;
    hotel.core.roles.deactivate(hotel.housekeeping.id, hotel.now).await.unwrap();

    let err = hotel
        .core
        .invitations
        .accept(issued.token.as_str(), AcceptInvitation::default(), hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(_)), "{err:?}");

    let stored = hotel.core.invitations.get(issued.invitation.id).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Pending);

    let err = hotel
        .core
        .invitations
        .create(NewInvitation::new("bo@hotel.test", hotel.housekeeping.id), hotel.manager, hotel.now)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidState(_)), "{err:?}");
}
