//! Authorization event wire format (one JSON object per message).
//!
//! ```json
//! {"action": "create", "organization_uuid": "...", "user_email": "a@b.com", "role": 3}
//! ```
//!
//! Outbound events always carry `role` (the resulting role, or the last known
//! role for deletes). Inbound events use the same shape; optional fields are
//! omitted when unset.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orgauth_core::{OrganizationId, ProjectId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// `create` for a fresh record, `update` for an in-place change.
    pub fn from_upsert(created: bool) -> Self {
        if created { Action::Create } else { Action::Update }
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of record an event targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Organization,
    Project,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationEvent {
    pub action: Action,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<EntityKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_uuid: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_uuid: Option<Uuid>,

    pub user_email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<i64>,

    /// Acting user, when the change was requested by someone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_2fa: Option<bool>,
}

impl AuthorizationEvent {
    fn base(action: Action, user_email: impl Into<String>) -> Self {
        Self {
            action,
            entity: None,
            organization_uuid: None,
            project_uuid: None,
            user_email: user_email.into(),
            role: None,
            request_user: None,
            created_by: None,
            has_2fa: None,
        }
    }

    /// Organization-level authorization change.
    pub fn organization(
        action: Action,
        organization_id: OrganizationId,
        user_email: impl Into<String>,
        role: i64,
    ) -> Self {
        Self {
            organization_uuid: Some(*organization_id.as_uuid()),
            role: Some(role),
            ..Self::base(action, user_email)
        }
    }

    /// Project-level authorization change. Carries the owning organization too.
    pub fn project(
        action: Action,
        organization_id: OrganizationId,
        project_id: ProjectId,
        user_email: impl Into<String>,
        role: i64,
    ) -> Self {
        Self {
            organization_uuid: Some(*organization_id.as_uuid()),
            project_uuid: Some(*project_id.as_uuid()),
            role: Some(role),
            ..Self::base(action, user_email)
        }
    }

    /// A user account with `user_email` was registered.
    pub fn user_registered(user_email: impl Into<String>) -> Self {
        Self {
            entity: Some(EntityKind::User),
            ..Self::base(Action::Create, user_email)
        }
    }

    pub fn with_request_user(mut self, request_user: impl Into<String>) -> Self {
        self.request_user = Some(request_user.into());
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_has_2fa(mut self, has_2fa: bool) -> Self {
        self.has_2fa = Some(has_2fa);
        self
    }

    /// Explicit `entity`, or the one implied by the UUIDs present.
    pub fn target_entity(&self) -> Option<EntityKind> {
        self.entity.or(match (self.project_uuid, self.organization_uuid) {
            (Some(_), _) => Some(EntityKind::Project),
            (None, Some(_)) => Some(EntityKind::Organization),
            (None, None) => None,
        })
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_uuid.map(OrganizationId::from_uuid)
    }

    pub fn project_id(&self) -> Option<ProjectId> {
        self.project_uuid.map(ProjectId::from_uuid)
    }
}

/// Sent once to the project-membership destination after an organization's
/// members were granted access to a new project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMembersNotice {
    pub action: Action,
    pub organization_uuid: Uuid,
    pub project_uuid: Uuid,
    pub user_emails: Vec<String>,
}

impl ProjectMembersNotice {
    pub fn new(organization_id: OrganizationId, project_id: ProjectId, user_emails: Vec<String>) -> Self {
        Self {
            action: Action::Update,
            organization_uuid: *organization_id.as_uuid(),
            project_uuid: *project_id.as_uuid(),
            user_emails,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn organization_event_wire_shape() {
        let org = OrganizationId::new();
        let event = AuthorizationEvent::organization(Action::Create, org, "a@b.com", 3);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "create",
                "organization_uuid": org.to_string(),
                "user_email": "a@b.com",
                "role": 3,
            })
        );
    }

    #[test]
    fn target_entity_is_inferred_from_uuids() {
        let org = OrganizationId::new();
        let project = ProjectId::new();

        let e = AuthorizationEvent::project(Action::Delete, org, project, "a@b.com", 1);
        assert_eq!(e.target_entity(), Some(EntityKind::Project));

        let e = AuthorizationEvent::organization(Action::Update, org, "a@b.com", 2);
        assert_eq!(e.target_entity(), Some(EntityKind::Organization));

        let e = AuthorizationEvent::user_registered("a@b.com");
        assert_eq!(e.target_entity(), Some(EntityKind::User));
    }

    #[test]
    fn unknown_fields_are_ignored_on_decode() {
        let raw = json!({
            "action": "update",
            "organization_uuid": "0191e5a4-7b3c-7d2e-9f10-1234567890ab",
            "user_email": "a@b.com",
            "role": 2,
            "trace_id": "abc"
        });
        let event: AuthorizationEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.action, Action::Update);
        assert_eq!(event.role, Some(2));
    }
}
