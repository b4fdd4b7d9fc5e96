//! Call contracts for the use cases (what the HTTP layer or the event
//! consumer hands in).

use serde::{Deserialize, Serialize};

use orgauth_auth::{OrganizationRole, ProjectRole};
use orgauth_core::{OrganizationAuthorizationId, OrganizationId, ProjectId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAuthorizationDTO {
    pub user_email: String,
    pub org_uuid: OrganizationId,
    pub role: OrganizationRole,
}

/// Target is `id` when given, otherwise `user_email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAuthorizationDTO {
    pub org_uuid: OrganizationId,
    pub role: OrganizationRole,
    pub request_user: Option<String>,
    pub id: Option<OrganizationAuthorizationId>,
    pub user_email: Option<String>,
}

/// Target is `id` when given, otherwise `user_email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAuthorizationDTO {
    pub org_uuid: OrganizationId,
    pub request_user: Option<String>,
    pub id: Option<OrganizationAuthorizationId>,
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProjectAuthorizationDTO {
    pub user_email: String,
    pub project_uuid: ProjectId,
    pub created_by_email: Option<String>,
    pub role: ProjectRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProjectAuthorizationDTO {
    pub project_uuid: ProjectId,
    pub user_email: String,
    pub role: ProjectRole,
    pub request_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteProjectAuthorizationDTO {
    pub project_uuid: ProjectId,
    pub user_email: String,
    pub request_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteToOrganizationDTO {
    pub org_uuid: OrganizationId,
    pub email: String,
    pub role: OrganizationRole,
    pub created_by_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteToProjectDTO {
    pub project_uuid: ProjectId,
    pub email: String,
    pub role: ProjectRole,
    pub created_by_email: String,
}
