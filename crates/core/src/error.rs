//! Domain error model.

use thiserror::Error;

use crate::id::{OrganizationId, ProjectId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Two families matter to callers:
///
/// - **Not found** (`*DoesNotExist`): a referenced entity is missing. These are
///   raised by lookup collaborators and propagated unchanged; they are never
///   retried automatically.
/// - **Permission** (`PermissionDenied`, `InvalidRole`): rejected at the use case
///   boundary before any mutation happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("organization {0} does not exist")]
    OrganizationDoesNotExist(OrganizationId),

    #[error("project {0} does not exist")]
    ProjectDoesNotExist(ProjectId),

    /// Carries the lookup key (email or user id) that failed to resolve.
    #[error("user {0} does not exist")]
    UserDoesNotExist(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// A value failed validation (e.g. a DTO without a target user).
    #[error("validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    pub fn user_does_not_exist(key: impl Into<String>) -> Self {
        Self::UserDoesNotExist(key.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn invalid_role(msg: impl Into<String>) -> Self {
        Self::InvalidRole(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Referenced entity is missing (out-of-order or malformed inbound event).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OrganizationDoesNotExist(_)
                | Self::ProjectDoesNotExist(_)
                | Self::UserDoesNotExist(_)
        )
    }

    /// Rejected before mutation: self-modification or an unusable role.
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::InvalidRole(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found_errors() {
        assert!(DomainError::OrganizationDoesNotExist(OrganizationId::new()).is_not_found());
        assert!(DomainError::ProjectDoesNotExist(ProjectId::new()).is_not_found());
        assert!(DomainError::user_does_not_exist("a@b.com").is_not_found());
        assert!(!DomainError::permission_denied("self").is_not_found());
    }

    #[test]
    fn classifies_permission_errors() {
        assert!(DomainError::permission_denied("self").is_permission());
        assert!(DomainError::invalid_role("9").is_permission());
        assert!(!DomainError::validation("x").is_permission());
    }
}
