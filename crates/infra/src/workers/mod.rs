//! Background workers.

pub mod consumer_worker;

pub use consumer_worker::{ConsumerWorker, WorkerHandle};
