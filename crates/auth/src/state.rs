//! Lifecycle of a single (organization, user) authorization pair.
//!
//! ```text
//! ABSENT ──invite(no account)──▶ PENDING_INVITE ──user registers──▶ ACTIVE(role)
//! ABSENT ──invite(account)─────────────────────────────────────────▶ ACTIVE(role)
//! ACTIVE(role) ──update(new)──▶ ACTIVE(new)
//! any ──delete──▶ ABSENT
//! ```
//!
//! The machine is pure. Use cases resolve the current state from the store,
//! ask for the next one, and perform the corresponding store mutation.

use orgauth_core::DomainError;

use crate::authorization::{OrganizationAuthorization, RequestPermissionOrganization};
use crate::roles::OrganizationRole;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthorizationState {
    Absent,
    PendingInvite(OrganizationRole),
    Active(OrganizationRole),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Grant `role` to an email; `has_account` tells whether a user exists for it.
    Invite { role: OrganizationRole, has_account: bool },
    /// A user with the pending email was created.
    UserRegistered,
    Update(OrganizationRole),
    Delete,
}

impl AuthorizationState {
    /// Current state from what the store holds for the pair.
    ///
    /// An authorization row wins over a leftover invite row.
    pub fn resolve(
        authorization: Option<&OrganizationAuthorization>,
        invite: Option<&RequestPermissionOrganization>,
    ) -> Self {
        match (authorization, invite) {
            (Some(auth), _) => AuthorizationState::Active(auth.role),
            (None, Some(req)) => AuthorizationState::PendingInvite(req.role),
            (None, None) => AuthorizationState::Absent,
        }
    }

    /// Next state after `transition`.
    ///
    /// `Update` on a pair that is not active behaves as an upsert, so a replayed
    /// or reordered inbound update still converges.
    pub fn next(self, transition: Transition) -> Result<Self, DomainError> {
        use AuthorizationState::*;

        let next = match (self, transition) {
            (_, Transition::Delete) => Absent,

            (_, Transition::Invite { role, has_account }) => {
                let role = role.ensure_grantable()?;
                if has_account {
                    Active(role)
                } else {
                    match self {
                        Active(current) => Active(current),
                        _ => PendingInvite(role),
                    }
                }
            }

            (PendingInvite(role), Transition::UserRegistered) => Active(role),
            (state, Transition::UserRegistered) => state,

            (PendingInvite(_), Transition::Update(role)) => PendingInvite(role.ensure_grantable()?),
            (_, Transition::Update(role)) => Active(role.ensure_grantable()?),
        };

        Ok(next)
    }

    pub fn is_active(self) -> bool {
        matches!(self, AuthorizationState::Active(_))
    }

    /// Label used in logs.
    pub fn name(self) -> &'static str {
        match self {
            AuthorizationState::Absent => "absent",
            AuthorizationState::PendingInvite(_) => "pending_invite",
            AuthorizationState::Active(_) => "active",
        }
    }
}
