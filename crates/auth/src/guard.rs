//! Boundary checks applied before any authorization mutation.

use orgauth_core::DomainError;

/// Canonical form used for every email comparison and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Reject an acting user who targets their own authorization.
///
/// `request_user` is `None` for changes that originate from another service
/// (there is no acting user to compare against).
pub fn ensure_not_self(request_user: Option<&str>, target_email: &str) -> Result<(), DomainError> {
    match request_user {
        Some(actor) if normalize_email(actor) == normalize_email(target_email) => Err(
            DomainError::permission_denied("a user cannot modify their own authorization"),
        ),
        _ => Ok(()),
    }
}
