//! Outbound event delivery.
//!
//! A publish is retried until it is accepted by the broker: every transport
//! failure invalidates the shared connection, waits a fixed delay and tries
//! again. Two things fail the call instead:
//!
//! - a body that cannot be serialized
//! - the broker refusing the command itself (`ChannelError::Command`, e.g. a
//!   Redis `WRONGTYPE` on the stream key), which no retry can fix

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::channel::{ChannelError, Connector, MessageChannel};
use crate::connection::ConnectionHandle;
use crate::envelope::AuthorizationEvent;

/// Retry delay used when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker refused publish to {destination}: {reason}")]
    Refused { destination: String, reason: String },
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Number of broker calls it took (1 when nothing failed).
    pub attempts: u32,
}

/// Anything that can emit authorization events to a named destination.
pub trait EventSink: Send + Sync {
    fn publish_event(
        &self,
        event: &AuthorizationEvent,
        destination: &str,
    ) -> Result<PublishReceipt, PublishError>;

    /// Publish an arbitrary JSON body (notices that are not authorization events).
    fn publish_value(
        &self,
        body: &serde_json::Value,
        destination: &str,
    ) -> Result<PublishReceipt, PublishError>;
}

pub struct EventPublisher<C: Connector> {
    connection: Arc<ConnectionHandle<C>>,
    retry_delay: Duration,
}

impl<C: Connector> EventPublisher<C> {
    pub fn new(connection: Arc<ConnectionHandle<C>>) -> Self {
        Self {
            connection,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle<C>> {
        &self.connection
    }

    /// Serialize `body` as JSON and publish it to `destination` with an empty
    /// routing key. Blocks until the broker accepts the message.
    #[instrument(skip(self, body), fields(destination = %destination))]
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        body: &T,
        destination: &str,
    ) -> Result<PublishReceipt, PublishError> {
        let payload = serde_json::to_vec(body)?;
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);

            let result = self
                .connection
                .ensure_connected()
                .and_then(|channel| channel.publish(destination, "", &payload));

            match result {
                Ok(()) => {
                    debug!(attempts, bytes = payload.len(), "event published");
                    return Ok(PublishReceipt { attempts });
                }
                Err(ChannelError::Command(reason)) => {
                    error!(attempts, reason = %reason, "broker refused publish");
                    return Err(PublishError::Refused {
                        destination: destination.to_string(),
                        reason,
                    });
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        attempts,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "publish failed; retrying"
                    );
                    self.connection.invalidate();
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }
}

impl<C: Connector> EventSink for EventPublisher<C> {
    fn publish_event(
        &self,
        event: &AuthorizationEvent,
        destination: &str,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish(event, destination)
    }

    fn publish_value(
        &self,
        body: &serde_json::Value,
        destination: &str,
    ) -> Result<PublishReceipt, PublishError> {
        self.publish(body, destination)
    }
}

impl<C: Connector> core::fmt::Debug for EventPublisher<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("connection", &self.connection)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}
