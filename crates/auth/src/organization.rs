//! Tenant entities: organizations and the projects they own.

use serde::{Deserialize, Serialize};

use orgauth_core::{OrganizationId, ProjectId};

/// Tenant root. Owns projects and organization-level authorizations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    /// Identifier of this organization in the external intelligence system.
    pub external_id: Option<String>,
    pub is_suspended: bool,
}

impl Organization {
    pub fn new(id: OrganizationId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            external_id: None,
            is_suspended: false,
        }
    }
}

/// Workspace scoped under exactly one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub organization_id: OrganizationId,
    pub name: String,
    /// Reference to the project's organization in the external workflow engine.
    pub flow_organization: Option<String>,
}

impl Project {
    pub fn new(id: ProjectId, organization_id: OrganizationId, name: impl Into<String>) -> Self {
        Self {
            id,
            organization_id,
            name: name.into(),
            flow_organization: None,
        }
    }
}
