//! Redis Streams transport (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Destination**: one stream per destination name (`XADD <destination> * payload <body>`)
//! - **Queue**: one consumer group named after the queue, created on every
//!   stream bound to it
//! - **Consumer**: one named consumer per process inside each group
//! - **Dead-letter**: `reject(requeue = false)` appends to `<queue>.dlq` and
//!   acks the original entry
//!
//! A fresh channel first re-reads this consumer's pending entries (id `0`)
//! so deliveries left unacked by a dropped connection are handed out again.
//! After that it reads new entries (`>`) with `BLOCK`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use orgauth_events::{ChannelError, Connector, Delivery, MessageChannel};

/// Field holding the message body inside a stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// Extra read timeout on top of the `BLOCK` duration.
const READ_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

pub struct RedisConnector {
    client: redis::Client,
    /// queue -> bound stream keys
    bindings: Arc<HashMap<String, Vec<String>>>,
    consumer_name: String,
    display_url: String,
}

impl RedisConnector {
    pub fn new(
        redis_url: impl AsRef<str>,
        bindings: HashMap<String, Vec<String>>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(classify)?;
        Ok(Self {
            client,
            bindings: Arc::new(bindings),
            consumer_name: consumer_name.into(),
            display_url: redact_url(redis_url.as_ref()),
        })
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }
}

impl Connector for RedisConnector {
    type Channel = RedisChannel;

    #[instrument(skip(self), fields(broker = %self.display_url), err)]
    fn connect(&self) -> Result<Self::Channel, ChannelError> {
        let conn = self.client.get_connection().map_err(classify)?;
        Ok(RedisChannel {
            conn: Mutex::new(conn),
            bindings: self.bindings.clone(),
            consumer_name: self.consumer_name.clone(),
            open: AtomicBool::new(true),
            groups_ready: Mutex::new(HashSet::new()),
            backlog_drained: Mutex::new(HashSet::new()),
        })
    }

    fn describe(&self) -> String {
        format!("redis {}", self.display_url)
    }
}

impl core::fmt::Debug for RedisConnector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisConnector")
            .field("url", &self.display_url)
            .field("consumer_name", &self.consumer_name)
            .field("bindings", &self.bindings)
            .finish()
    }
}

pub struct RedisChannel {
    conn: Mutex<redis::Connection>,
    bindings: Arc<HashMap<String, Vec<String>>>,
    consumer_name: String,
    open: AtomicBool,
    /// Queues whose consumer groups were created on this channel.
    groups_ready: Mutex<HashSet<String>>,
    /// Queues whose pending backlog was re-read on this channel.
    backlog_drained: Mutex<HashSet<String>>,
}

impl RedisChannel {
    fn lock_conn(&self) -> Result<MutexGuard<'_, redis::Connection>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(self.conn.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run a command, closing the channel on transport failure.
    fn run<T: redis::FromRedisValue>(
        &self,
        conn: &mut redis::Connection,
        cmd: &redis::Cmd,
    ) -> Result<T, ChannelError> {
        cmd.query(conn).map_err(|e| {
            let err = classify(e);
            if err.is_transport() {
                self.open.store(false, Ordering::SeqCst);
            }
            err
        })
    }

    fn streams_for(&self, queue: &str) -> Result<&[String], ChannelError> {
        self.bindings
            .get(queue)
            .map(Vec::as_slice)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ChannelError::Command(format!("queue {queue} has no bound streams")))
    }

    fn ensure_groups(&self, conn: &mut redis::Connection, queue: &str) -> Result<(), ChannelError> {
        let mut ready = self.groups_ready.lock().unwrap_or_else(PoisonError::into_inner);
        if ready.contains(queue) {
            return Ok(());
        }

        for stream in self.streams_for(queue)? {
            let mut cmd = redis::cmd("XGROUP");
            cmd.arg("CREATE").arg(stream).arg(queue).arg("0").arg("MKSTREAM");
            match self.run::<()>(conn, &cmd) {
                Ok(()) => debug!(stream = %stream, group = %queue, "consumer group created"),
                Err(ChannelError::Command(msg)) if msg.contains("BUSYGROUP") => {}
                Err(err) => return Err(err),
            }
        }
        ready.insert(queue.to_string());
        Ok(())
    }

    fn read_group(
        &self,
        conn: &mut redis::Connection,
        queue: &str,
        start: &str,
        block: Option<Duration>,
    ) -> Result<Option<StreamEntry>, ChannelError> {
        let streams = self.streams_for(queue)?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(queue).arg(&self.consumer_name).arg("COUNT").arg(1);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block_millis(block));
        }
        cmd.arg("STREAMS").arg(streams);
        for _ in streams {
            cmd.arg(start);
        }

        let reply: redis::Value = self.run(conn, &cmd)?;
        parse_read_reply(reply)
    }
}

impl MessageChannel for RedisChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, body), fields(destination = %destination, bytes = body.len()), err)]
    fn publish(&self, destination: &str, _routing_key: &str, body: &[u8]) -> Result<(), ChannelError> {
        let mut conn = self.lock_conn()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(destination).arg("*").arg(PAYLOAD_FIELD).arg(body);
        let _id: String = self.run(&mut conn, &cmd)?;
        Ok(())
    }

    fn next_delivery(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, ChannelError> {
        let mut conn = self.lock_conn()?;
        self.ensure_groups(&mut conn, queue)?;

        let drained = self
            .backlog_drained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(queue);

        let mut redelivered = false;
        let mut entry = None;
        if !drained {
            entry = self.read_group(&mut conn, queue, "0", None)?;
            redelivered = entry.is_some();
            if entry.is_none() {
                self.backlog_drained
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(queue.to_string());
            }
        }

        if entry.is_none() {
            let read_timeout = (timeout > Duration::ZERO).then(|| timeout + READ_TIMEOUT_SLACK);
            conn.set_read_timeout(read_timeout).map_err(classify)?;
            let block = (timeout > Duration::ZERO).then_some(timeout);
            entry = self.read_group(&mut conn, queue, ">", block)?;
        }

        let Some(entry) = entry else {
            return Ok(None);
        };
        let tag = format_tag(&entry.stream, &entry.id);

        match entry.payload {
            Some(body) => Ok(Some(Delivery {
                queue: queue.to_string(),
                tag,
                body,
                redelivered,
            })),
            None => {
                // Trimmed from the stream while pending: nothing left to deliver.
                warn!(queue, delivery_tag = %tag, "pending entry without payload acknowledged");
                let mut cmd = redis::cmd("XACK");
                cmd.arg(&entry.stream).arg(queue).arg(&entry.id);
                let _: u64 = self.run(&mut conn, &cmd)?;
                Ok(None)
            }
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        let (stream, id) = parse_tag(&delivery.tag)?;
        let mut conn = self.lock_conn()?;
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(&delivery.queue).arg(id);
        let _: u64 = self.run(&mut conn, &cmd)?;
        Ok(())
    }

    #[instrument(skip(self, delivery), fields(queue = %delivery.queue, delivery_tag = %delivery.tag), err)]
    fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), ChannelError> {
        let (stream, id) = parse_tag(&delivery.tag)?;

        if requeue {
            // Left pending; the next read on this channel re-reads the backlog.
            self.backlog_drained
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&delivery.queue);
            return Ok(());
        }

        let mut conn = self.lock_conn()?;
        let mut dlq = redis::cmd("XADD");
        dlq.arg(dead_letter_stream(&delivery.queue))
            .arg("*")
            .arg("original_stream")
            .arg(stream)
            .arg("original_id")
            .arg(id)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(PAYLOAD_FIELD)
            .arg(delivery.body());
        let _dlq_id: String = self.run(&mut conn, &dlq)?;

        let mut ack = redis::cmd("XACK");
        ack.arg(stream).arg(&delivery.queue).arg(id);
        let _: u64 = self.run(&mut conn, &ack)?;
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// One entry from an `XREADGROUP` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    stream: String,
    id: String,
    /// `None` when the entry was deleted while still pending.
    payload: Option<Vec<u8>>,
}

/// First entry of an `XREADGROUP COUNT 1` reply, `None` on timeout or an
/// empty backlog.
///
/// Reply shape: `[[stream, [[id, [field, value, ...]], ...]], ...]`.
fn parse_read_reply(reply: redis::Value) -> Result<Option<StreamEntry>, ChannelError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(None),
        redis::Value::Bulk(streams) => streams,
        other => return Err(malformed("reply", &other)),
    };

    for stream in streams {
        let mut parts = match stream {
            redis::Value::Bulk(parts) => parts,
            other => return Err(malformed("stream", &other)),
        };
        if parts.len() != 2 {
            return Err(ChannelError::Command("stream reply must have 2 parts".to_string()));
        }
        let entries = parts.pop();
        let name = text(parts.pop(), "stream name")?;

        let entries = match entries {
            Some(redis::Value::Bulk(entries)) => entries,
            Some(redis::Value::Nil) | None => continue,
            Some(other) => return Err(malformed("entries", &other)),
        };

        if let Some(entry) = entries.into_iter().next() {
            let mut entry = match entry {
                redis::Value::Bulk(entry) => entry,
                other => return Err(malformed("entry", &other)),
            };
            if entry.len() != 2 {
                return Err(ChannelError::Command("stream entry must have 2 parts".to_string()));
            }
            let fields = entry.pop();
            let id = text(entry.pop(), "entry id")?;
            let payload = match fields {
                Some(redis::Value::Bulk(fields)) => field(&fields, PAYLOAD_FIELD),
                _ => None,
            };
            return Ok(Some(StreamEntry {
                stream: name,
                id,
                payload,
            }));
        }
    }

    Ok(None)
}

fn field(fields: &[redis::Value], key: &str) -> Option<Vec<u8>> {
    fields.chunks(2).find_map(|pair| match pair {
        [redis::Value::Data(k), redis::Value::Data(v)] if k.as_slice() == key.as_bytes() => {
            Some(v.clone())
        }
        _ => None,
    })
}

fn text(value: Option<redis::Value>, what: &str) -> Result<String, ChannelError> {
    match value {
        Some(redis::Value::Data(bytes)) => String::from_utf8(bytes)
            .map_err(|_| ChannelError::Command(format!("{what} is not utf-8"))),
        Some(redis::Value::Status(s)) => Ok(s),
        other => Err(ChannelError::Command(format!("unexpected {what}: {other:?}"))),
    }
}

fn malformed(what: &str, value: &redis::Value) -> ChannelError {
    ChannelError::Command(format!("unexpected XREADGROUP {what}: {value:?}"))
}

fn format_tag(stream: &str, id: &str) -> String {
    format!("{stream}|{id}")
}

/// Split a delivery tag back into `(stream, entry id)`. Entry ids never
/// contain `|`, so the last separator wins.
fn parse_tag(tag: &str) -> Result<(&str, &str), ChannelError> {
    tag.rsplit_once('|')
        .filter(|(stream, id)| !stream.is_empty() && !id.is_empty())
        .ok_or_else(|| ChannelError::Command(format!("malformed delivery tag {tag}")))
}

fn dead_letter_stream(queue: &str) -> String {
    format!("{queue}.dlq")
}

/// `BLOCK` takes milliseconds and treats 0 as "forever".
fn block_millis(block: Duration) -> u64 {
    u64::try_from(block.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn classify(err: redis::RedisError) -> ChannelError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        ChannelError::Connection(err.to_string())
    } else {
        ChannelError::Command(err.to_string())
    }
}

/// Drop `user:password@` from a URL before it reaches logs.
fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}
