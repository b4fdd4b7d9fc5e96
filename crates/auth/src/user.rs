//! User accounts as seen through the external user directory.

use serde::{Deserialize, Serialize};

use orgauth_core::UserId;

use crate::guard::normalize_email;

/// A registered account. Authorizations reference users; pending invites
/// reference bare emails instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Always stored normalized (trimmed, lowercase).
    pub email: String,
    pub has_2fa: bool,
}

impl User {
    pub fn new(id: UserId, email: &str) -> Self {
        Self {
            id,
            email: normalize_email(email),
            has_2fa: false,
        }
    }

    pub fn with_2fa(mut self, has_2fa: bool) -> Self {
        self.has_2fa = has_2fa;
        self
    }
}
