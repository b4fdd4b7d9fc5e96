//! Messaging mechanics for authorization events.
//!
//! - [`channel`]: the transport capability set (`publish`, `next_delivery`,
//!   `ack`, `reject`) and the `Connector` that opens channels.
//! - [`connection`]: the process-wide reconnecting handle shared by publishers
//!   and consumers.
//! - [`in_memory`]: an in-process broker for tests/dev.
//! - [`envelope`] / [`codec`]: the JSON wire format and the pluggable body parser.
//! - [`publisher`]: retry-until-sent delivery of outbound events.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod in_memory;
pub mod publisher;

pub use channel::{ChannelError, Connector, Delivery, MessageChannel};
pub use codec::{BodyParser, JsonBodyParser, ParseError};
pub use connection::ConnectionHandle;
pub use envelope::{Action, AuthorizationEvent, EntityKind, ProjectMembersNotice};
pub use in_memory::{DeadLetter, InMemoryBroker, InMemoryChannel, InMemoryConnector};
pub use publisher::{EventPublisher, EventSink, PublishError, PublishReceipt};
