//! Lookup collaborators: the external user directory and the organization /
//! project repositories.
//!
//! All three are synchronous, always-consistent lookups. Missing entities are
//! reported with the matching `DomainError::*DoesNotExist` variant.

pub mod in_memory;

pub use in_memory::{DirectorySeed, InMemoryDirectory};

use orgauth_auth::{Organization, Project, User};
use orgauth_core::{DomainError, OrganizationId, ProjectId, UserId};

pub trait UserDirectory: Send + Sync {
    fn get_user_by_email(&self, email: &str) -> Result<User, DomainError>;

    fn get_user_by_id(&self, id: UserId) -> Result<User, DomainError>;

    /// Record a user reported by the identity service. Creates the account
    /// when the email is unknown; `has_2fa`, when given, overwrites the flag.
    fn register_user(&self, email: &str, has_2fa: Option<bool>) -> Result<User, DomainError>;

    /// `get_user_by_email` with "does not exist" turned into `None`.
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DomainError> {
        match self.get_user_by_email(email) {
            Ok(user) => Ok(Some(user)),
            Err(DomainError::UserDoesNotExist(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub trait OrganizationRepository: Send + Sync {
    fn get_by_uuid(&self, id: OrganizationId) -> Result<Organization, DomainError>;
}

pub trait ProjectRepository: Send + Sync {
    fn get_by_uuid(&self, id: ProjectId) -> Result<Project, DomainError>;

    fn list_by_organization(&self, organization_id: OrganizationId)
    -> Result<Vec<Project>, DomainError>;
}
