use thiserror::Error;

use orgauth_core::DomainError;
use orgauth_events::PublishError;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum UseCaseError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl UseCaseError {
    /// A referenced user, organization or project is missing, or the parent
    /// organization authorization vanished while a project grant was written.
    pub fn is_not_found(&self) -> bool {
        match self {
            UseCaseError::Domain(e) => e.is_not_found(),
            UseCaseError::Store(StoreError::MissingParent(_)) => true,
            _ => false,
        }
    }

    /// Rejected at the boundary before any mutation (self-modification, bad role).
    pub fn is_permission(&self) -> bool {
        matches!(self, UseCaseError::Domain(e) if e.is_permission())
    }
}

pub type UseCaseResult<T> = Result<T, UseCaseError>;

#[cfg(test)]
mod tests {
    use super::*;
    use orgauth_core::OrganizationId;

    #[test]
    fn classification_follows_domain_error() {
        let missing: UseCaseError = DomainError::OrganizationDoesNotExist(OrganizationId::new()).into();
        assert!(missing.is_not_found());
        assert!(!missing.is_permission());

        let denied: UseCaseError = DomainError::permission_denied("self").into();
        assert!(denied.is_permission());

        let backend: UseCaseError = StoreError::Poisoned.into();
        assert!(!backend.is_not_found() && !backend.is_permission());

        let orphan: UseCaseError =
            StoreError::MissingParent(orgauth_core::OrganizationAuthorizationId::new()).into();
        assert!(orphan.is_not_found());
    }
}
