//! Pluggable body parsing for inbound messages.

use thiserror::Error;

use crate::envelope::AuthorizationEvent;

/// A message that can never be processed. Always terminal for the delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("undecodable message body: {0}")]
    Decode(String),

    #[error("invalid action/entity combination: {0}")]
    InvalidCombination(String),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ParseError {
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Turns a raw delivery body into an [`AuthorizationEvent`].
pub trait BodyParser: Send + Sync {
    fn parse(&self, body: &[u8]) -> Result<AuthorizationEvent, ParseError>;
}

/// Default parser: one JSON object per message.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonBodyParser;

impl BodyParser for JsonBodyParser {
    fn parse(&self, body: &[u8]) -> Result<AuthorizationEvent, ParseError> {
        let event: AuthorizationEvent =
            serde_json::from_slice(body).map_err(|e| ParseError::Decode(e.to_string()))?;

        if event.user_email.trim().is_empty() {
            return Err(ParseError::invalid_field("user_email", "must not be empty"));
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Action;

    #[test]
    fn parses_valid_json() {
        let body = br#"{"action":"delete","organization_uuid":"0191e5a4-7b3c-7d2e-9f10-1234567890ab","user_email":"a@b.com"}"#;
        let event = JsonBodyParser.parse(body).unwrap();
        assert_eq!(event.action, Action::Delete);
        assert_eq!(event.role, None);
    }

    #[test]
    fn rejects_garbage_and_unknown_actions() {
        assert!(matches!(JsonBodyParser.parse(b"not json"), Err(ParseError::Decode(_))));
        assert!(matches!(
            JsonBodyParser.parse(br#"{"action":"promote","user_email":"a@b.com"}"#),
            Err(ParseError::Decode(_))
        ));
    }

    #[test]
    fn rejects_blank_email() {
        let err = JsonBodyParser
            .parse(br#"{"action":"create","user_email":"  "}"#)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "user_email", .. }));
    }
}
