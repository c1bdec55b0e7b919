//! Connections and their inboxes.
//!
//! A [`Connection`] is created by `hello` and lives until `disconnect`. It
//! owns everything that is private to one peer:
//!
//! - the inbox: its [`Pool`] plus the priority queue of delivered slices
//! - its match rules
//! - the memfds it holds a reference to
//!
//! The router is the only producer into an inbox and the connection itself
//! the only consumer, so each piece has its own lock and no lock is held
//! across two connections.
//!
//! # Delivered layout
//!
//! A delivery occupies one pool slice: the encoded message first, then every
//! payload vector, each 8-byte aligned. The message's payload items are
//! rewritten to `PAYLOAD_OFF` items pointing at those copies, so a receiver
//! never sees the sender's addresses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::item::{ChainContext, Item, align8};
use crate::matcher::{MatchDb, MatchEvent, MatchRule};
use crate::memfd::{Memfd, MemfdTable};
use crate::message::Message;
use crate::metadata::{AttachFlags, ProcessMetadata};
use crate::pool::Pool;

bitflags! {
    /// Connection flags given at hello.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ConnFlags: u64 {
        /// Activator for the name in the `STARTER_NAME` item.
        const STARTER   = 1 << 0;
        /// Accepts file descriptors.
        const ACCEPT_FD = 1 << 1;
    }
}

/// A dequeued message: where it sits in the receiver's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Received {
    /// Pool offset; pass to `free` when done.
    pub offset: u64,
    /// Encoded message size at `offset`.
    pub size: u64,
}

/// A message ready to be copied into an inbox.
///
/// Payload is carried as `PAYLOAD_VEC` items holding the resolved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The message as the recipient will see it.
    pub message: Message,
    /// Queue priority.
    pub priority: i64,
    /// Well-known name the sender addressed, if any.
    pub dst_name: Option<String>,
}

#[derive(Debug, Clone)]
struct Queued {
    offset: u64,
    size: u64,
    dst_name: Option<String>,
}

/// Pool plus priority queue.
#[derive(Debug)]
struct Inbox {
    pool: Pool,
    /// Ordered by (priority, arrival); lowest first.
    queue: BTreeMap<(i64, u64), Queued>,
    seq: u64,
}

impl Inbox {
    fn deliver(&mut self, id: u64, delivery: &Delivery, max_queued: usize) -> BusResult<u64> {
        if self.queue.len() >= max_queued {
            return Err(BusError::QueueFull {
                id,
                max: max_queued,
            });
        }

        let mut msg = delivery.message.clone();
        let mut payloads = Vec::new();
        for item in &mut msg.items {
            if let Item::PayloadVec(data) = item {
                let data = std::mem::take(data);
                *item = Item::PayloadOff {
                    offset: 0,
                    size: data.len() as u64,
                };
                payloads.push(data);
            }
        }

        let msg_len = msg.encoded_len();
        let total = align8(msg_len)
            + payloads
                .iter()
                .map(|p| align8(p.len() as u64))
                .sum::<u64>();
        let base = self.pool.allocate(total)?;

        let mut cursor = base + align8(msg_len);
        for item in &mut msg.items {
            if let Item::PayloadOff { offset, size } = item {
                *offset = cursor;
                cursor += align8(*size);
            }
        }

        let written = self.pool.write_vec(base, &msg.encode()).and_then(|()| {
            msg.items
                .iter()
                .filter_map(|item| match item {
                    Item::PayloadOff { offset, .. } => Some(*offset),
                    _ => None,
                })
                .zip(&payloads)
                .try_for_each(|(offset, data)| self.pool.write_vec(offset, data))
        });
        if let Err(err) = written {
            // The slice is ours and was just allocated.
            let _ = self.pool.free(base);
            return Err(err);
        }

        self.seq += 1;
        self.queue.insert(
            (delivery.priority, self.seq),
            Queued {
                offset: base,
                size: msg_len,
                dst_name: delivery.dst_name.clone(),
            },
        );
        Ok(base)
    }

    fn read_message(&self, offset: u64) -> BusResult<Message> {
        Message::decode(&self.pool.read_slice(offset)?, ChainContext::Delivered)
    }

    /// Rewrites `PAYLOAD_OFF` items back into inline bytes.
    fn inline_payloads(&self, msg: &mut Message) -> BusResult<()> {
        for item in &mut msg.items {
            if let Item::PayloadOff { offset, size } = *item {
                *item = Item::PayloadVec(self.pool.read(offset, size)?);
            }
        }
        Ok(())
    }
}

/// One peer on the bus.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    flags: ConnFlags,
    attach: AttachFlags,
    metadata: ProcessMetadata,
    endpoint: String,
    alive: AtomicBool,
    monitor: AtomicBool,
    inbox: Mutex<Inbox>,
    matches: RwLock<MatchDb>,
    memfds: Mutex<MemfdTable>,
}

impl Connection {
    /// Creates a live connection with an empty pool of `pool_size` bytes.
    #[must_use]
    pub fn new(
        id: u64,
        flags: ConnFlags,
        attach: AttachFlags,
        metadata: ProcessMetadata,
        endpoint: impl Into<String>,
        pool_size: u64,
    ) -> Self {
        Self {
            id,
            flags,
            attach,
            metadata,
            endpoint: endpoint.into(),
            alive: AtomicBool::new(true),
            monitor: AtomicBool::new(false),
            inbox: Mutex::new(Inbox {
                pool: Pool::new(pool_size),
                queue: BTreeMap::new(),
                seq: 0,
            }),
            matches: RwLock::new(MatchDb::default()),
            memfds: Mutex::new(MemfdTable::default()),
        }
    }

    /// Unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Hello flags.
    #[must_use]
    pub const fn flags(&self) -> ConnFlags {
        self.flags
    }

    /// Metadata this connection wants attached to its deliveries.
    #[must_use]
    pub const fn attach(&self) -> AttachFlags {
        self.attach
    }

    /// Process metadata captured at hello.
    #[must_use]
    pub const fn metadata(&self) -> &ProcessMetadata {
        &self.metadata
    }

    /// Endpoint this connection came through.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns `true` for an activator.
    #[must_use]
    pub const fn is_starter(&self) -> bool {
        self.flags.contains(ConnFlags::STARTER)
    }

    /// Returns `true` if the connection takes file descriptors.
    #[must_use]
    pub const fn accepts_fds(&self) -> bool {
        self.flags.contains(ConnFlags::ACCEPT_FD)
    }

    /// Returns `true` until [`Connection::mark_disconnected`].
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Marks the connection dead. Returns `false` if it already was.
    pub fn mark_disconnected(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    /// Returns `true` in monitor mode.
    #[must_use]
    pub fn is_monitor(&self) -> bool {
        self.monitor.load(Ordering::Acquire)
    }

    /// Enables or disables monitor mode.
    pub fn set_monitor(&self, enabled: bool) {
        self.monitor.store(enabled, Ordering::Release);
    }

    /// Fails with [`BusError::Disconnected`] once disconnected.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_alive(&self) -> BusResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(BusError::Disconnected { id: self.id })
        }
    }

    // ------------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------------

    /// Copies a message into the pool and queues it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::QueueFull`], [`BusError::PoolExhausted`], or
    /// [`BusError::Disconnected`]. Nothing is queued on error.
    pub fn deliver(&self, delivery: &Delivery, max_queued: usize) -> BusResult<u64> {
        self.ensure_alive()?;
        self.inbox
            .lock()
            .expect("lock poisoned")
            .deliver(self.id, delivery, max_queued)
    }

    /// Dequeues the next message: lowest priority value, oldest first.
    #[must_use]
    pub fn receive(&self) -> Option<Received> {
        let mut inbox = self.inbox.lock().expect("lock poisoned");
        inbox.queue.pop_first().map(|(_, q)| Received {
            offset: q.offset,
            size: q.size,
        })
    }

    /// Releases a received slice.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] for an unknown or already freed
    /// offset, and for a slice that is still queued.
    pub fn free(&self, offset: u64) -> BusResult<()> {
        let mut inbox = self.inbox.lock().expect("lock poisoned");
        if inbox.queue.values().any(|q| q.offset == offset) {
            return Err(BusError::InvalidHandle { handle: offset });
        }
        inbox.pool.free(offset)
    }

    /// Decodes the message at a received offset.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] for a stale offset.
    pub fn read_message(&self, offset: u64) -> BusResult<Message> {
        self.inbox
            .lock()
            .expect("lock poisoned")
            .read_message(offset)
    }

    /// Concatenated payload of the message at `offset`.
    ///
    /// Pool copies and memfd contents are resolved.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] for a stale offset or a memfd this
    /// connection no longer holds.
    pub fn read_payload(&self, offset: u64) -> BusResult<Bytes> {
        let msg = self.read_message(offset)?;
        let mut out = Vec::new();
        for item in &msg.items {
            match item {
                Item::PayloadVec(data) => out.extend_from_slice(data),
                Item::PayloadOff { offset, size } => {
                    out.extend_from_slice(&self.read_pool(*offset, *size)?);
                },
                Item::PayloadMemfd { handle, size } => {
                    let contents = self.memfd(*handle)?.contents();
                    let len = usize::try_from(*size)
                        .unwrap_or(usize::MAX)
                        .min(contents.len());
                    out.extend_from_slice(&contents[..len]);
                },
                _ => {},
            }
        }
        Ok(Bytes::from(out))
    }

    /// Reads bytes from this connection's own pool, for forwarding a
    /// received payload by offset.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] unless the range lies in a live
    /// slice.
    pub fn read_pool(&self, offset: u64, size: u64) -> BusResult<Bytes> {
        self.inbox
            .lock()
            .expect("lock poisoned")
            .pool
            .read(offset, size)
    }

    /// Removes queued messages addressed to `name` and returns them with
    /// their payload inlined, oldest first within each priority.
    ///
    /// # Errors
    ///
    /// Propagates pool errors; the queue is only modified on success.
    pub fn drain_for_name(&self, name: &str) -> BusResult<Vec<Delivery>> {
        let mut inbox = self.inbox.lock().expect("lock poisoned");
        let keys: Vec<(i64, u64)> = inbox
            .queue
            .iter()
            .filter(|(_, q)| q.dst_name.as_deref() == Some(name))
            .map(|(k, _)| *k)
            .collect();

        let mut out = Vec::with_capacity(keys.len());
        for key in &keys {
            let queued = &inbox.queue[key];
            let mut message = inbox.read_message(queued.offset)?;
            inbox.inline_payloads(&mut message)?;
            out.push(Delivery {
                message,
                priority: key.0,
                dst_name: queued.dst_name.clone(),
            });
        }
        for key in keys {
            if let Some(queued) = inbox.queue.remove(&key) {
                inbox.pool.free(queued.offset)?;
            }
        }
        Ok(out)
    }

    /// Number of queued, not yet received messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbox.lock().expect("lock poisoned").queue.len()
    }

    /// Free pool bytes.
    #[must_use]
    pub fn pool_available(&self) -> u64 {
        self.inbox.lock().expect("lock poisoned").pool.available()
    }

    // ------------------------------------------------------------------------
    // Match rules
    // ------------------------------------------------------------------------

    /// Installs a match rule.
    ///
    /// # Errors
    ///
    /// See [`MatchDb::add`].
    pub fn add_match(&self, rule: MatchRule, bloom_size: usize, max: usize) -> BusResult<()> {
        self.matches
            .write()
            .expect("lock poisoned")
            .add(rule, bloom_size, max)
    }

    /// Removes all rules with `cookie`.
    ///
    /// # Errors
    ///
    /// See [`MatchDb::remove`].
    pub fn remove_match(&self, cookie: u64) -> BusResult<usize> {
        self.matches.write().expect("lock poisoned").remove(cookie)
    }

    /// Returns `true` if a rule selects `event`.
    #[must_use]
    pub fn wants(&self, event: &MatchEvent<'_>) -> bool {
        self.matches.read().expect("lock poisoned").matches(event)
    }

    /// Number of installed match rules.
    #[must_use]
    pub fn match_count(&self) -> usize {
        self.matches.read().expect("lock poisoned").len()
    }

    // ------------------------------------------------------------------------
    // Memfds
    // ------------------------------------------------------------------------

    /// Takes a reference to `memfd`.
    pub fn hold_memfd(&self, memfd: Arc<Memfd>) {
        self.memfds.lock().expect("lock poisoned").insert(memfd);
    }

    /// A memfd this connection holds.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn memfd(&self, handle: u32) -> BusResult<Arc<Memfd>> {
        self.memfds.lock().expect("lock poisoned").get(handle)
    }

    /// Drops the reference to a memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn release_memfd(&self, handle: u32) -> BusResult<()> {
        self.memfds.lock().expect("lock poisoned").remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Credentials;

    fn conn(pool_size: u64) -> Connection {
        Connection::new(
            7,
            ConnFlags::empty(),
            AttachFlags::empty(),
            ProcessMetadata::with_creds(Credentials::new(1000, 1000)),
            "bus",
            pool_size,
        )
    }

    fn delivery(cookie: u64, priority: i64, payload: &'static [u8]) -> Delivery {
        let mut message = Message::to_id(7, cookie).with_payload(payload);
        message.src_id = 3;
        Delivery {
            message,
            priority,
            dst_name: None,
        }
    }

    #[test]
    fn test_payload_is_copied_into_pool() {
        let conn = conn(4096);
        conn.deliver(&delivery(1, 0, b"hello"), 16).unwrap();

        let received = conn.receive().unwrap();
        let msg = conn.read_message(received.offset).unwrap();
        assert_eq!(msg.cookie, 1);
        assert!(matches!(msg.items[0], Item::PayloadOff { size: 5, .. }));
        assert_eq!(
            conn.read_payload(received.offset).unwrap(),
            Bytes::from_static(b"hello")
        );

        conn.free(received.offset).unwrap();
        assert!(conn.read_message(received.offset).is_err());
        assert_eq!(conn.pool_available(), 4096);
    }

    #[test]
    fn test_priority_then_fifo() {
        let conn = conn(4096);
        conn.deliver(&delivery(1, 0, b"a"), 16).unwrap();
        conn.deliver(&delivery(2, 5, b"b"), 16).unwrap();
        conn.deliver(&delivery(3, -1, b"c"), 16).unwrap();
        conn.deliver(&delivery(4, 0, b"d"), 16).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| conn.receive())
            .map(|r| conn.read_message(r.offset).unwrap().cookie)
            .collect();
        assert_eq!(order, vec![3, 1, 4, 2]);
    }

    #[test]
    fn test_queue_limit() {
        let conn = conn(4096);
        conn.deliver(&delivery(1, 0, b"a"), 1).unwrap();
        assert_eq!(
            conn.deliver(&delivery(2, 0, b"b"), 1),
            Err(BusError::QueueFull { id: 7, max: 1 })
        );
    }

    #[test]
    fn test_pool_exhaustion_leaves_queue_untouched() {
        let conn = conn(128);
        let err = conn.deliver(&delivery(1, 0, &[0u8; 200]), 16).unwrap_err();
        assert!(matches!(err, BusError::PoolExhausted { .. }));
        assert_eq!(conn.pending(), 0);
        assert!(conn.is_alive());
    }

    #[test]
    fn test_queued_slice_cannot_be_freed() {
        let conn = conn(4096);
        let offset = conn.deliver(&delivery(1, 0, b"a"), 16).unwrap();
        assert!(conn.free(offset).is_err());
        conn.receive().unwrap();
        conn.free(offset).unwrap();
        assert!(conn.free(offset).is_err());
    }

    #[test]
    fn test_drain_for_name() {
        let conn = conn(4096);
        let mut named = delivery(1, 0, b"for-x");
        named.dst_name = Some("org.x".to_string());
        conn.deliver(&named, 16).unwrap();
        conn.deliver(&delivery(2, 0, b"other"), 16).unwrap();

        let drained = conn.drain_for_name("org.x").unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message.inline_payload(), b"for-x");
        assert_eq!(conn.pending(), 1);
    }

    #[test]
    fn test_disconnected_rejects_delivery() {
        let conn = conn(4096);
        assert!(conn.mark_disconnected());
        assert!(!conn.mark_disconnected());
        assert_eq!(
            conn.deliver(&delivery(1, 0, b"a"), 16),
            Err(BusError::Disconnected { id: 7 })
        );
    }
}
