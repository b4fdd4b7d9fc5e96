//! Reconnecting connection handle.
//!
//! One `ConnectionHandle` is owned by the messaging subsystem of a process and
//! shared (via `Arc`) by every publisher and consumer. Callers never cache a
//! channel across operations: they call [`ConnectionHandle::ensure_connected`]
//! each time and [`ConnectionHandle::invalidate`] when an operation fails with a
//! transport error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use crate::channel::{ChannelError, Connector, MessageChannel};

pub struct ConnectionHandle<C: Connector> {
    connector: C,
    channel: Mutex<Option<Arc<C::Channel>>>,
    connects: AtomicU64,
}

impl<C: Connector> ConnectionHandle<C> {
    /// Create a handle. No connection is opened until first use.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            channel: Mutex::new(None),
            connects: AtomicU64::new(0),
        }
    }

    /// Return an open channel, (re)connecting if there is none or it was found closed.
    pub fn ensure_connected(&self) -> Result<Arc<C::Channel>, ChannelError> {
        let mut slot = self.channel.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(channel) = slot.as_ref().filter(|c| c.is_open()).cloned() {
            return Ok(channel);
        }
        if slot.take().is_some() {
            warn!(broker = %self.connector.describe(), "channel found closed; reconnecting");
        }

        let channel = Arc::new(self.connector.connect()?);
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        info!(broker = %self.connector.describe(), connects = n, "broker channel opened");

        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Drop the current channel so the next `ensure_connected` opens a new one.
    pub fn invalidate(&self) {
        let mut slot = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = slot.take() {
            channel.close();
        }
    }

    /// Close `channel` and forget it, unless the handle has already moved on
    /// to a newer channel, which is left untouched.
    pub fn release(&self, channel: &Arc<C::Channel>) {
        channel.close();
        let mut slot = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, channel)) {
            slot.take();
        }
    }

    /// Close the connection (shutdown). A later `ensure_connected` reopens it.
    pub fn close(&self) {
        self.invalidate();
        info!(broker = %self.connector.describe(), "broker connection closed");
    }

    /// Number of channels opened so far.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

impl<C: Connector> core::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("broker", &self.connector.describe())
            .field("connects", &self.connect_count())
            .finish()
    }
}
