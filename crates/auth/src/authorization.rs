//! Authorization and pending-invite records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orgauth_core::{
    OrganizationAuthorizationId, OrganizationId, ProjectAuthorizationId, ProjectId,
    RequestPermissionId, UserId,
};

use crate::roles::{OrganizationRole, ProjectRole};

/// Result of a create-or-update-in-place operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted<T> {
    /// `true` when a new record was inserted, `false` when an existing one was updated.
    pub created: bool,
    pub record: T,
}

impl<T> Upserted<T> {
    pub fn created(record: T) -> Self {
        Self { created: true, record }
    }

    pub fn updated(record: T) -> Self {
        Self { created: false, record }
    }

    /// Wire action describing this upsert.
    pub fn action(&self) -> &'static str {
        if self.created { "create" } else { "update" }
    }
}

/// (Organization, User, Role). At most one per (organization, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationAuthorization {
    pub id: OrganizationAuthorizationId,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub user_email: String,
    pub role: OrganizationRole,
    /// Copied from the user at creation/update time.
    pub has_2fa: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationAuthorization {
    pub fn can_contribute(&self) -> bool {
        self.role.can_contribute()
    }
}

/// (Project, User, Role), derived from an organization authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectAuthorization {
    pub id: ProjectAuthorizationId,
    pub project_id: ProjectId,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub user_email: String,
    pub role: ProjectRole,
    /// Back-reference to the organization authorization it hangs off.
    pub organization_authorization_id: OrganizationAuthorizationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pending organization invite for an email without an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPermissionOrganization {
    pub id: RequestPermissionId,
    pub organization_id: OrganizationId,
    pub email: String,
    pub role: OrganizationRole,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Pending project invite for an email without an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPermissionProject {
    pub id: RequestPermissionId,
    pub project_id: ProjectId,
    pub organization_id: OrganizationId,
    pub email: String,
    pub role: ProjectRole,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_action_follows_created_flag() {
        assert_eq!(Upserted::created(()).action(), "create");
        assert_eq!(Upserted::updated(()).action(), "update");
    }
}
