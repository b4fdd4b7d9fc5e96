//! Closed role enumerations and the organization → project role mapping.
//!
//! Roles travel on the wire as integers. Both enums serialize as their code and
//! reject unknown codes on deserialization, so an unmapped role can never slip
//! through as a silent default.

use serde::{Deserialize, Serialize};

use orgauth_core::DomainError;

/// Role of a user inside an organization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum OrganizationRole {
    NotSet = 0,
    Viewer = 1,
    Contributor = 2,
    Admin = 3,
    Financial = 4,
    Support = 5,
}

/// Role of a user inside a project.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ProjectRole {
    NotSet = 0,
    Moderator = 1,
    Contributor = 2,
    Viewer = 3,
    Support = 4,
}

/// Project role implied by an organization role, if any.
///
/// Only roles that can contribute cascade into projects. `Viewer`, `Financial`
/// and `NotSet` return `None`: there is nothing to propagate.
pub fn organization_role_to_project_role(role: OrganizationRole) -> Option<ProjectRole> {
    match role {
        OrganizationRole::Admin => Some(ProjectRole::Moderator),
        OrganizationRole::Contributor => Some(ProjectRole::Contributor),
        OrganizationRole::Support => Some(ProjectRole::Support),
        OrganizationRole::Viewer | OrganizationRole::Financial | OrganizationRole::NotSet => None,
    }
}

impl OrganizationRole {
    pub const ALL: [OrganizationRole; 6] = [
        OrganizationRole::NotSet,
        OrganizationRole::Viewer,
        OrganizationRole::Contributor,
        OrganizationRole::Admin,
        OrganizationRole::Financial,
        OrganizationRole::Support,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    /// Whether this role cascades into every project of the organization.
    pub fn can_contribute(self) -> bool {
        organization_role_to_project_role(self).is_some()
    }

    /// Role usable for a grant (anything but `NotSet`).
    pub fn ensure_grantable(self) -> Result<Self, DomainError> {
        match self {
            OrganizationRole::NotSet => Err(DomainError::invalid_role(
                "organization role NOT_SET cannot be granted",
            )),
            role => Ok(role),
        }
    }
}

impl ProjectRole {
    pub const ALL: [ProjectRole; 5] = [
        ProjectRole::NotSet,
        ProjectRole::Moderator,
        ProjectRole::Contributor,
        ProjectRole::Viewer,
        ProjectRole::Support,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn ensure_grantable(self) -> Result<Self, DomainError> {
        match self {
            ProjectRole::NotSet => Err(DomainError::invalid_role(
                "project role NOT_SET cannot be granted",
            )),
            role => Ok(role),
        }
    }
}

impl TryFrom<i64> for OrganizationRole {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        OrganizationRole::ALL
            .into_iter()
            .find(|r| r.code() == value)
            .ok_or_else(|| DomainError::invalid_role(format!("unknown organization role {value}")))
    }
}

impl TryFrom<i64> for ProjectRole {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        ProjectRole::ALL
            .into_iter()
            .find(|r| r.code() == value)
            .ok_or_else(|| DomainError::invalid_role(format!("unknown project role {value}")))
    }
}

impl From<OrganizationRole> for i64 {
    fn from(value: OrganizationRole) -> Self {
        value.code()
    }
}

impl From<ProjectRole> for i64 {
    fn from(value: ProjectRole) -> Self {
        value.code()
    }
}

impl core::fmt::Display for OrganizationRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            OrganizationRole::NotSet => "not_set",
            OrganizationRole::Viewer => "viewer",
            OrganizationRole::Contributor => "contributor",
            OrganizationRole::Admin => "admin",
            OrganizationRole::Financial => "financial",
            OrganizationRole::Support => "support",
        };
        f.write_str(name)
    }
}

impl core::fmt::Display for ProjectRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ProjectRole::NotSet => "not_set",
            ProjectRole::Moderator => "moderator",
            ProjectRole::Contributor => "contributor",
            ProjectRole::Viewer => "viewer",
            ProjectRole::Support => "support",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn contributing_roles_map_to_project_roles() {
        assert_eq!(
            organization_role_to_project_role(OrganizationRole::Admin),
            Some(ProjectRole::Moderator)
        );
        assert_eq!(
            organization_role_to_project_role(OrganizationRole::Contributor),
            Some(ProjectRole::Contributor)
        );
        assert_eq!(
            organization_role_to_project_role(OrganizationRole::Support),
            Some(ProjectRole::Support)
        );
    }

    #[test]
    fn non_contributing_roles_do_not_cascade() {
        for role in [
            OrganizationRole::NotSet,
            OrganizationRole::Viewer,
            OrganizationRole::Financial,
        ] {
            assert_eq!(organization_role_to_project_role(role), None);
            assert!(!role.can_contribute());
        }
    }

    #[test]
    fn roles_serialize_as_integer_codes() {
        assert_eq!(serde_json::to_string(&OrganizationRole::Admin).unwrap(), "3");
        assert_eq!(serde_json::to_string(&ProjectRole::Viewer).unwrap(), "3");

        let role: ProjectRole = serde_json::from_str("1").unwrap();
        assert_eq!(role, ProjectRole::Moderator);
        assert!(serde_json::from_str::<OrganizationRole>("42").is_err());
    }

    #[test]
    fn not_set_is_never_grantable() {
        assert!(OrganizationRole::NotSet.ensure_grantable().is_err());
        assert!(ProjectRole::NotSet.ensure_grantable().is_err());
        assert_eq!(
            OrganizationRole::Viewer.ensure_grantable(),
            Ok(OrganizationRole::Viewer)
        );
    }

    proptest! {
        #[test]
        fn organization_role_codes_round_trip(code in -10i64..20) {
            match OrganizationRole::try_from(code) {
                Ok(role) => prop_assert_eq!(role.code(), code),
                Err(err) => {
                    prop_assert!(!(0..=5).contains(&code));
                    prop_assert!(err.is_permission());
                }
            }
        }

        #[test]
        fn project_role_codes_round_trip(code in -10i64..20) {
            match ProjectRole::try_from(code) {
                Ok(role) => prop_assert_eq!(role.code(), code),
                Err(_) => prop_assert!(!(0..=4).contains(&code)),
            }
        }

        #[test]
        fn mapped_roles_are_always_grantable(idx in 0usize..6) {
            let role = OrganizationRole::ALL[idx];
            if let Some(project_role) = organization_role_to_project_role(role) {
                prop_assert!(project_role.ensure_grantable().is_ok());
                prop_assert!(role.ensure_grantable().is_ok());
            }
        }
    }
}
