//! Inbound side of the message channel.
//!
//! - [`consumer`]: applies authorization-sync deliveries through the use cases
//!   with per-message ack/reject.
//! - [`redis_streams`]: Redis Streams adapter for the channel traits
//!   (feature `redis`).

pub mod consumer;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use consumer::{
    ConsumerCounts, ConsumerStats, DeliveryOutcome, EventConsumer, InboundCommand, route,
};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisChannel, RedisConnector};
