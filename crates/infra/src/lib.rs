//! Infrastructure layer: storage, collaborators, use cases, transports, workers.
//!
//! - [`store`]: the Authorization Store (in-memory and Postgres).
//! - [`directory`]: user / organization / project lookups.
//! - [`usecases`]: create/update/delete orchestration with cascades and events.
//! - [`messaging`]: inbound consumer and the Redis Streams transport.
//! - [`workers`]: background consumer threads.
//! - [`config`]: environment-driven configuration.

pub mod config;
pub mod directory;
pub mod messaging;
pub mod store;
pub mod usecases;
pub mod workers;

#[cfg(test)]
mod integration_tests;
