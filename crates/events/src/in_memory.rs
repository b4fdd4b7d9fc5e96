//! In-memory broker for tests/dev.
//!
//! Models the parts of a durable broker the engine relies on:
//!
//! - destinations fan out to every bound queue (empty routing key)
//! - deliveries stay unacked until `ack`/`reject`; closing the channel that
//!   handed them out (or dropping every connection) requeues them as
//!   redelivered
//! - `reject(requeue = false)` dead-letters the message
//!
//! Faults can be injected (`fail_next_publishes`, `reject_next_publishes`,
//! `refuse_next_connects`, `drop_connections`) to exercise reconnect and
//! refusal paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::channel::{ChannelError, Connector, Delivery, MessageChannel};

/// A message rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Clone)]
struct Unacked {
    channel: u64,
    queue: String,
    message: QueuedMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// destination -> bound queues
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    unacked: HashMap<String, Unacked>,
    published: Vec<(String, Vec<u8>)>,
    dead_letters: Vec<DeadLetter>,
    next_tag: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    available: Condvar,
    generation: AtomicU64,
    next_channel: AtomicU64,
    fail_publishes: AtomicU32,
    reject_publishes: AtomicU32,
    refuse_connects: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare `queue` (idempotent).
    pub fn declare_queue(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    /// Route messages published to `destination` into `queue`.
    pub fn bind(&self, queue: &str, destination: &str) {
        let mut state = self.lock();
        state.queues.entry(queue.to_string()).or_default();
        let bound = state.bindings.entry(destination.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
    }

    /// Enqueue a raw message directly (bypassing destinations).
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(QueuedMessage {
                body: body.into(),
                redelivered: false,
            });
        drop(state);
        self.available.notify_all();
    }

    /// Bodies published to `destination`, oldest first.
    pub fn published(&self, destination: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.lock()
            .dead_letters
            .iter()
            .filter(|d| d.queue == queue)
            .cloned()
            .collect()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Make the next `n` publishes fail as if the connection dropped mid-send.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail as a broker-side command error. The
    /// channel stays open.
    pub fn reject_next_publishes(&self, n: u32) {
        self.reject_publishes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` connection attempts fail.
    pub fn refuse_next_connects(&self, n: u32) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Close every open channel. Unacked deliveries go back to their queues.
    pub fn drop_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        self.requeue_unacked(|_| true);
    }

    /// Put unacked deliveries of matching channels back at the head of their
    /// queues, oldest delivery first in line.
    fn requeue_unacked(&self, owned_by: impl Fn(u64) -> bool) {
        let mut state = self.lock();
        let tags: Vec<String> = state
            .unacked
            .iter()
            .filter(|(_, u)| owned_by(u.channel))
            .map(|(tag, _)| tag.clone())
            .collect();
        if tags.is_empty() {
            return;
        }

        let mut pending: Vec<(u64, Unacked)> = tags
            .into_iter()
            .filter_map(|tag| {
                let seq = tag.parse::<u64>().unwrap_or(0);
                state.unacked.remove(&tag).map(|u| (seq, u))
            })
            .collect();
        pending.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));
        for (_, mut unacked) in pending {
            unacked.message.redelivered = true;
            state
                .queues
                .entry(unacked.queue)
                .or_default()
                .push_front(unacked.message);
        }
        drop(state);
        self.available.notify_all();
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Opens channels on a shared [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

impl Connector for InMemoryConnector {
    type Channel = InMemoryChannel;

    fn connect(&self) -> Result<Self::Channel, ChannelError> {
        if InMemoryBroker::take_fault(&self.broker.refuse_connects) {
            return Err(ChannelError::Connection("connection refused".to_string()));
        }
        Ok(InMemoryChannel {
            id: self.broker.next_channel.fetch_add(1, Ordering::SeqCst),
            broker: self.broker.clone(),
            generation: self.broker.current_generation(),
            closed: AtomicBool::new(false),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    broker: Arc<InMemoryBroker>,
    generation: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn check_open(&self) -> Result<(), ChannelError> {
        if self.is_open() { Ok(()) } else { Err(ChannelError::Closed) }
    }
}

impl MessageChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation == self.broker.current_generation()
    }

    fn publish(&self, destination: &str, _routing_key: &str, body: &[u8]) -> Result<(), ChannelError> {
        self.check_open()?;

        if InMemoryBroker::take_fault(&self.broker.fail_publishes) {
            self.close();
            return Err(ChannelError::Connection("connection reset during publish".to_string()));
        }
        if InMemoryBroker::take_fault(&self.broker.reject_publishes) {
            return Err(ChannelError::Command(format!(
                "WRONGTYPE destination {destination} holds the wrong kind of value"
            )));
        }

        let mut state = self.broker.lock();
        state.published.push((destination.to_string(), body.to_vec()));
        let bound = state.bindings.get(destination).cloned().unwrap_or_default();
        for queue in bound {
            state.queues.entry(queue).or_default().push_back(QueuedMessage {
                body: body.to_vec(),
                redelivered: false,
            });
        }
        drop(state);
        self.broker.available.notify_all();
        Ok(())
    }

    fn next_delivery(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock();

        loop {
            self.check_open()?;

            if let Some(msg) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                state.next_tag += 1;
                let tag = state.next_tag.to_string();
                let delivery = Delivery {
                    queue: queue.to_string(),
                    tag: tag.clone(),
                    body: msg.body.clone(),
                    redelivered: msg.redelivered,
                };
                state.unacked.insert(
                    tag,
                    Unacked {
                        channel: self.id,
                        queue: queue.to_string(),
                        message: msg,
                    },
                );
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .broker
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        self.check_open()?;
        let mut state = self.broker.lock();
        state
            .unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| ChannelError::Command(format!("unknown delivery tag {}", delivery.tag)))
    }

    fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), ChannelError> {
        self.check_open()?;
        let mut state = self.broker.lock();
        let Unacked { queue, message: mut msg, .. } = state
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| ChannelError::Command(format!("unknown delivery tag {}", delivery.tag)))?;

        if requeue {
            msg.redelivered = true;
            state.queues.entry(queue).or_default().push_front(msg);
            drop(state);
            self.broker.available.notify_all();
        } else {
            state.dead_letters.push(DeadLetter { queue, body: msg.body });
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let id = self.id;
        self.broker.requeue_unacked(|owner| owner == id);
    }
}
