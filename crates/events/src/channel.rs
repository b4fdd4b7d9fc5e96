//! Transport abstraction (mechanics only).
//!
//! Every broker library is adapted once to [`MessageChannel`]; nothing above
//! this layer knows which one is in use. The capability set mirrors what a
//! durable broker offers:
//!
//! - `publish` to a named destination (exchange / topic / stream)
//! - `next_delivery` from a named queue, one message at a time
//! - `ack` / `reject(requeue)` per delivery tag
//!
//! ## Delivery Guarantees
//!
//! At-least-once. A delivery that is neither acked nor rejected before its
//! channel dies is redelivered by the broker, so consumers must be idempotent.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The broker connection dropped, was refused, or timed out.
    #[error("connection error: {0}")]
    Connection(String),

    /// The channel was found closed before use.
    #[error("channel closed")]
    Closed,

    /// The broker rejected the command itself (unknown tag, wrong type, ...).
    #[error("broker command failed: {0}")]
    Command(String),
}

impl ChannelError {
    /// Transport-level failure: the channel must be re-established.
    ///
    /// "Found closed" and "send raised a connection error" are treated alike.
    pub fn is_transport(&self) -> bool {
        matches!(self, ChannelError::Connection(_) | ChannelError::Closed)
    }
}

/// A message handed out by `next_delivery`, pending ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    /// Broker-assigned tag, valid only on the channel that produced it.
    pub tag: String,
    pub body: Vec<u8>,
    /// The broker has handed this message out before.
    pub redelivered: bool,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// One open channel to a broker.
///
/// Implementations must be `Send + Sync`: the same channel is shared by the
/// publisher and the consumer of a process.
pub trait MessageChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Publish `body` to `destination`. An empty `routing_key` means fan-out.
    fn publish(&self, destination: &str, routing_key: &str, body: &[u8])
    -> Result<(), ChannelError>;

    /// Block up to `timeout` for the next message on `queue`.
    fn next_delivery(&self, queue: &str, timeout: Duration)
    -> Result<Option<Delivery>, ChannelError>;

    fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError>;

    /// Reject a delivery. With `requeue == false` the message is dead-lettered.
    fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), ChannelError>;

    fn close(&self);
}

/// Opens channels to one broker. Selected once at startup.
pub trait Connector: Send + Sync {
    type Channel: MessageChannel + 'static;

    fn connect(&self) -> Result<Self::Channel, ChannelError>;

    /// Broker description for logs (never includes credentials).
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_trigger_reconnect() {
        assert!(ChannelError::Closed.is_transport());
        assert!(ChannelError::Connection("reset".into()).is_transport());
        assert!(!ChannelError::Command("WRONGTYPE".into()).is_transport());
    }
}
