use std::io;
use std::sync::mpsc;
use std::thread;

use tracing::{info, warn};

use orgauth_events::Connector;

use crate::messaging::EventConsumer;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A delivery being processed is settled first; the worker stops at the
    /// next poll boundary.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

/// Drives one [`EventConsumer`] on a dedicated thread.
///
/// - one delivery at a time
/// - a failed poll (the consumer has already released its channel) waits the
///   consumer's reconnect delay before polling again, indefinitely
/// - stops when its [`WorkerHandle`] is shut down
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    pub fn spawn<C>(name: impl Into<String>, consumer: EventConsumer<C>) -> io::Result<WorkerHandle>
    where
        C: Connector + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_name = name.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&thread_name, &consumer, &shutdown_rx))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<C: Connector>(name: &str, consumer: &EventConsumer<C>, shutdown_rx: &mpsc::Receiver<()>) {
    info!(worker = name, queue = consumer.queue(), "consumer worker started");

    loop {
        // Shutdown check (non-blocking)
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match consumer.poll_once() {
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    worker = name,
                    queue = consumer.queue(),
                    error = %err,
                    retry_in_ms = consumer.reconnect_delay().as_millis() as u64,
                    "consumer poll failed; retrying"
                );
                // Doubles as the reconnect backoff and an interruptible sleep.
                match shutdown_rx.recv_timeout(consumer.reconnect_delay()) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }

    let counts = consumer.stats().snapshot();
    info!(
        worker = name,
        queue = consumer.queue(),
        acknowledged = counts.acknowledged,
        rejected = counts.rejected(),
        "consumer worker stopped"
    );
}
