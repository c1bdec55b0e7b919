//! The bus: connection table, message router and control operations.
//!
//! A [`Bus`] is shared by reference between every task serving its
//! connections. Bus-wide state is synchronized per concern:
//!
//! - the connection table behind an `RwLock`, only held to look up or
//!   snapshot connections, never while delivering
//! - names and policy in sharded maps, locked per name
//! - outstanding reply correlations behind a `Mutex`
//!
//! Deliveries lock exactly one recipient inbox at a time. Notifications are
//! built from the events a registry mutation returns, so they are only sent
//! after the mutation is committed.
//!
//! # Routing
//!
//! - **Broadcast** (`dst_id == DST_ID_BROADCAST`): every other connection
//!   whose match rules select the message, plus monitors. Per-recipient
//!   failures are logged and dropped; the sender always succeeds.
//! - **Name** (`dst_id == 0`): the owner of the `DST_NAME` item, or its
//!   activator unless `NO_AUTO_START` is set.
//! - **Unique id**: that connection.
//!
//! Unicast failures (policy, pool, queue) are returned to the sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::{BusConfig, MakeFlags};
use crate::connection::{ConnFlags, Connection, Delivery, Received};
use crate::error::{BusError, BusResult};
use crate::item::{self, ChainContext, IdChange, Item};
use crate::matcher::{MatchEvent, MatchRule};
use crate::memfd::Memfd;
use crate::message::{DST_ID_NAME, Envelope, Message, MessageFlags, Notification, Reply};
use crate::metadata::{AttachFlags, Credentials, ProcessMetadata, Timestamp};
use crate::names::{
    AcquireStatus, ListFlags, NameFlags, NameListEntry, NameRegistry, Resolution, validate_name,
};
use crate::policy::{Access, PolicyAccess, PolicyDb};

/// Name of the endpoint every bus starts with.
pub const DEFAULT_ENDPOINT: &str = "bus";

// ============================================================================
// Request / Reply Types
// ============================================================================

/// Parameters of a hello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hello {
    /// Requested connection flags.
    pub conn_flags: ConnFlags,
    /// Metadata to attach to every delivery.
    pub attach_flags: AttachFlags,
    /// Extra items; `STARTER_NAME` for activators.
    pub items: Vec<Item>,
}

/// What a hello returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Assigned connection id.
    pub id: u64,
    /// The bus's opaque flags.
    pub bus_flags: u64,
    /// Bus-wide bloom size.
    pub bloom_size: usize,
    /// Size of the connection's pool.
    pub pool_size: u64,
    /// Bus identity.
    pub bus_uuid: Uuid,
}

/// Argument of `name-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameQuery {
    /// A unique connection id.
    Id(u64),
    /// A well-known name.
    Name(String),
}

/// Answer to `name-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: u64,
    /// Hello flags.
    pub flags: ConnFlags,
    /// Requested attach flags.
    pub attach_flags: AttachFlags,
    /// Credentials captured at hello.
    pub creds: Credentials,
    /// Owned well-known names.
    pub names: Vec<String>,
    /// Monitor mode.
    pub monitor: bool,
    /// Endpoint the connection came through.
    pub endpoint: String,
}

/// An access point onto the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint name.
    pub name: String,
    /// Creator; may always connect and set policy.
    pub owner: Credentials,
    /// Who else may connect.
    pub flags: MakeFlags,
}

impl Endpoint {
    fn admits(&self, meta: &ProcessMetadata) -> bool {
        meta.creds.is_root()
            || meta.creds.uid == self.owner.uid
            || self.flags.contains(MakeFlags::ACCESS_WORLD)
            || (self.flags.contains(MakeFlags::ACCESS_GROUP) && meta.in_group(self.owner.gid))
    }

    fn is_owned_by(&self, creds: &Credentials) -> bool {
        creds.is_root() || creds.uid == self.owner.uid
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingReply {
    replier: u64,
    deadline: Instant,
}

// ============================================================================
// Bus
// ============================================================================

/// One message bus.
#[derive(Debug)]
pub struct Bus {
    config: BusConfig,
    uuid: Uuid,
    owner: Credentials,
    started: Instant,
    next_id: AtomicU64,
    next_memfd: AtomicU32,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    names: NameRegistry,
    policy: PolicyDb,
    /// (waiter, cookie) -> who must answer and by when.
    replies: Mutex<HashMap<(u64, u64), PendingReply>>,
}

impl Bus {
    /// Creates a bus owned by `owner`, with its default endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] if `config` does not validate.
    pub fn create(config: BusConfig, owner: Credentials) -> BusResult<Self> {
        config
            .validate()
            .map_err(|e| BusError::invalid_argument(e.to_string()))?;

        let default_endpoint = Endpoint {
            name: DEFAULT_ENDPOINT.to_string(),
            owner,
            flags: config.make_flags - MakeFlags::POLICY_OPEN,
        };
        let bus = Self {
            uuid: Uuid::new_v4(),
            owner,
            started: Instant::now(),
            next_id: AtomicU64::new(1),
            next_memfd: AtomicU32::new(1),
            connections: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::from([(
                DEFAULT_ENDPOINT.to_string(),
                default_endpoint,
            )])),
            names: NameRegistry::new(),
            policy: PolicyDb::new(config.policy_open()),
            replies: Mutex::new(HashMap::new()),
            config,
        };
        info!(
            bus = %bus.config.name,
            uuid = %bus.uuid,
            bloom_size = bus.config.bloom_size,
            policy_open = bus.policy.is_open(),
            "bus created"
        );
        Ok(bus)
    }

    /// Bus configuration.
    #[must_use]
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Bus name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Bus identity.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().expect("lock poisoned").len()
    }

    /// Number of outstanding reply correlations.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().expect("lock poisoned").len()
    }

    /// Current entries of `name`'s policy.
    #[must_use]
    pub fn policy_entries(&self, name: &str) -> Vec<PolicyAccess> {
        self.policy.entries(name)
    }

    // ------------------------------------------------------------------------
    // Endpoints and connections
    // ------------------------------------------------------------------------

    /// Adds an endpoint.
    ///
    /// # Errors
    ///
    /// - [`BusError::PermissionDenied`] unless `caller` owns the bus
    /// - [`BusError::InvalidArgument`] for an empty or taken name
    pub fn create_endpoint(
        &self,
        caller: Credentials,
        name: &str,
        flags: MakeFlags,
    ) -> BusResult<()> {
        if !(caller.is_root() || caller.uid == self.owner.uid) {
            return Err(BusError::permission_denied(
                "only the bus owner may create endpoints",
            ));
        }
        if name.is_empty() || name.contains('/') {
            return Err(BusError::invalid_argument(format!(
                "invalid endpoint name '{name}'"
            )));
        }
        let mut endpoints = self.endpoints.write().expect("lock poisoned");
        if endpoints.contains_key(name) {
            return Err(BusError::invalid_argument(format!(
                "endpoint '{name}' already exists"
            )));
        }
        endpoints.insert(
            name.to_string(),
            Endpoint {
                name: name.to_string(),
                owner: caller,
                flags: flags - MakeFlags::POLICY_OPEN,
            },
        );
        info!(bus = %self.config.name, endpoint = name, uid = caller.uid, "endpoint created");
        Ok(())
    }

    /// Registers a connection.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidArgument`] for an unknown endpoint or an
    ///   inconsistent `STARTER` request
    /// - [`BusError::PermissionDenied`] if the endpoint does not admit the
    ///   caller
    /// - [`BusError::ForbiddenItemType`] for items other than
    ///   `STARTER_NAME` and user items
    /// - name and policy errors for an activator's name
    pub fn hello(
        &self,
        endpoint: &str,
        metadata: ProcessMetadata,
        hello: Hello,
    ) -> BusResult<HelloReply> {
        {
            let endpoints = self.endpoints.read().expect("lock poisoned");
            let ep = endpoints.get(endpoint).ok_or_else(|| {
                BusError::invalid_argument(format!("unknown endpoint '{endpoint}'"))
            })?;
            if !ep.admits(&metadata) {
                return Err(BusError::permission_denied(format!(
                    "uid {} may not connect through endpoint '{endpoint}'",
                    metadata.creds.uid
                )));
            }
        }
        item::check_items(&hello.items, ChainContext::Hello)?;

        let starter_name = hello.items.iter().find_map(|item| match item {
            Item::StarterName(name) => Some(name.clone()),
            _ => None,
        });
        let is_starter = hello.conn_flags.contains(ConnFlags::STARTER);
        match (&starter_name, is_starter) {
            (Some(name), true) => {
                validate_name(name)?;
                self.policy.check(&metadata, name, Access::Own)?;
            },
            (None, false) => {},
            (None, true) => {
                return Err(BusError::invalid_argument(
                    "STARTER connection without a STARTER_NAME item",
                ));
            },
            (Some(_), false) => {
                return Err(BusError::invalid_argument(
                    "STARTER_NAME item without the STARTER flag",
                ));
            },
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            id,
            hello.conn_flags,
            hello.attach_flags,
            metadata,
            endpoint,
            self.config.pool_size,
        ));
        self.connections
            .write()
            .expect("lock poisoned")
            .insert(id, Arc::clone(&conn));
        // The activator entry is published only once its connection resolves.
        if let Some(name) = &starter_name
            && let Err(err) = self.names.register_activator(id, name)
        {
            self.connections.write().expect("lock poisoned").remove(&id);
            conn.mark_disconnected();
            return Err(err);
        }
        if starter_name.is_some() && !conn.is_alive() {
            self.notify(self.names.remove_connection(id));
            return Err(BusError::Disconnected { id });
        }

        info!(
            bus = %self.config.name,
            conn_id = id,
            uid = conn.metadata().creds.uid,
            pid = conn.metadata().creds.pid,
            starter = ?starter_name,
            "connection registered"
        );
        self.notify(vec![Notification::IdAdd(IdChange {
            id,
            flags: hello.conn_flags.bits(),
        })]);

        Ok(HelloReply {
            id,
            bus_flags: self.config.bus_flags,
            bloom_size: self.config.bloom_size,
            pool_size: self.config.pool_size,
            bus_uuid: self.uuid,
        })
    }

    /// Tears down a connection.
    ///
    /// Releases its names (promoting queued claimants), cancels the replies
    /// it waits for, turns replies owed by it into `REPLY_DEAD`, and
    /// announces `ID_REMOVE`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionNotFound`] for an unknown id.
    pub fn disconnect(&self, id: u64) -> BusResult<()> {
        let conn = self
            .connections
            .write()
            .expect("lock poisoned")
            .remove(&id)
            .ok_or(BusError::ConnectionNotFound { id })?;
        conn.mark_disconnected();

        let mut events = self.names.remove_connection(id);

        let mut dead = Vec::new();
        self.replies
            .lock()
            .expect("lock poisoned")
            .retain(|&(waiter, cookie), pending| {
                if waiter == id {
                    return false;
                }
                if pending.replier == id {
                    dead.push((waiter, cookie));
                    return false;
                }
                true
            });

        info!(
            bus = %self.config.name,
            conn_id = id,
            names_released = events.len(),
            replies_dead = dead.len(),
            "connection disconnected"
        );

        events.push(Notification::IdRemove(IdChange {
            id,
            flags: conn.flags().bits(),
        }));
        self.notify(events);
        for (waiter, cookie) in dead {
            self.notify_one(waiter, Notification::ReplyDead { cookie });
        }
        Ok(())
    }

    /// Describes a connection, by id or by a name it owns.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionNotFound`] or [`BusError::NameNotFound`].
    pub fn info(&self, query: &NameQuery) -> BusResult<ConnectionInfo> {
        let id = match query {
            NameQuery::Id(id) => *id,
            NameQuery::Name(name) => match self.names.resolve(name) {
                Some(Resolution::Owner(id) | Resolution::Activator(id)) => id,
                None => {
                    return Err(BusError::NameNotFound { name: name.clone() });
                },
            },
        };
        let conn = self.connection(id)?;
        Ok(ConnectionInfo {
            id,
            flags: conn.flags(),
            attach_flags: conn.attach(),
            creds: conn.metadata().creds,
            names: self.names.names_of(id),
            monitor: conn.is_monitor(),
            endpoint: conn.endpoint().to_string(),
        })
    }

    /// Enables or disables monitor mode for `target`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PermissionDenied`] unless `caller` is `target` or
    /// runs as uid 0.
    pub fn monitor_enable(&self, caller: u64, target: u64, enabled: bool) -> BusResult<()> {
        let caller_conn = self.caller(caller)?;
        if caller != target && !caller_conn.metadata().creds.is_root() {
            return Err(BusError::permission_denied(
                "only root may switch other connections to monitor mode",
            ));
        }
        self.connection(target)?.set_monitor(enabled);
        info!(conn_id = target, enabled, "monitor mode changed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Routes a message from `sender`.
    ///
    /// # Errors
    ///
    /// Validation, resolution, policy and unicast delivery errors. Broadcasts
    /// only fail validation.
    pub fn send(&self, sender: u64, message: Message) -> BusResult<()> {
        let sender = self.caller(sender)?;
        let mut message = self.validate_send(&sender, message)?;
        message.src_id = sender.id();

        let mut memfds = Vec::new();
        message.items = self.resolve_payload(&sender, message.items, &mut memfds)?;

        let sender_names = self.names.names_of(sender.id());
        let ctx = SendContext {
            sender: &sender,
            sender_names: &sender_names,
            message: &message,
            memfds: &memfds,
            timestamp: self.timestamp(),
        };

        if message.is_broadcast() {
            self.broadcast(&ctx);
            Ok(())
        } else {
            self.unicast(&ctx)
        }
    }

    /// Decodes and routes an encoded message.
    ///
    /// # Errors
    ///
    /// Codec errors plus everything [`Bus::send`] returns.
    pub fn send_raw(&self, sender: u64, buf: &[u8]) -> BusResult<()> {
        let message = Message::decode(buf, ChainContext::Send)?;
        self.send(sender, message)
    }

    fn validate_send(&self, sender: &Connection, message: Message) -> BusResult<Message> {
        let limits = &self.config.limits;
        let size = message.encoded_len();
        if size > limits.max_msg_size {
            return Err(BusError::MessageTooLarge {
                size,
                max: limits.max_msg_size,
            });
        }
        if message.items.len() > limits.max_items {
            return Err(BusError::invalid_argument(format!(
                "{} items exceed the limit of {}",
                message.items.len(),
                limits.max_items
            )));
        }
        item::check_items(&message.items, ChainContext::Send)?;

        let mut dst_names = 0;
        let mut fds = 0;
        for item in &message.items {
            match item {
                Item::DstName(_) => dst_names += 1,
                Item::Fds(list) if list.is_empty() => {
                    return Err(BusError::invalid_argument("empty FDS item"));
                },
                Item::Fds(list) => fds += list.len(),
                Item::Bloom(bloom) if bloom.len() != self.config.bloom_size => {
                    return Err(BusError::BloomSizeMismatch {
                        actual: bloom.len(),
                        expected: self.config.bloom_size,
                    });
                },
                _ => {},
            }
        }
        if fds > limits.max_fds {
            return Err(BusError::invalid_argument(format!(
                "{fds} file descriptors exceed the limit of {}",
                limits.max_fds
            )));
        }
        match (message.dst_id == DST_ID_NAME, dst_names) {
            (true, 1) | (false, 0) => {},
            (true, 0) => {
                return Err(BusError::malformed(
                    "name-addressed message without DST_NAME",
                ));
            },
            (false, _) => {
                return Err(BusError::invalid_argument(
                    "DST_NAME on a message addressed by id",
                ));
            },
            (true, _) => return Err(BusError::malformed("more than one DST_NAME item")),
        }
        if message.is_broadcast() {
            if fds > 0 {
                return Err(BusError::invalid_argument(
                    "broadcasts cannot carry file descriptors",
                ));
            }
            if matches!(message.reply, Reply::Expect { .. }) {
                return Err(BusError::invalid_argument("broadcasts cannot expect a reply"));
            }
        }
        match message.reply {
            Reply::Expect { timeout_ns: 0 } => {
                return Err(BusError::invalid_argument("reply timeout must be positive"));
            },
            Reply::Expect { .. } if message.cookie == 0 => {
                return Err(BusError::invalid_argument(
                    "cookie 0 is reserved and cannot expect a reply",
                ));
            },
            Reply::To { cookie: 0 } => {
                return Err(BusError::invalid_argument(
                    "cookie 0 is reserved and cannot be replied to",
                ));
            },
            _ => {},
        }
        trace!(conn_id = sender.id(), cookie = message.cookie, size, "send validated");
        Ok(message)
    }

    /// Turns sender-relative payload items into bytes the recipient can own.
    fn resolve_payload(
        &self,
        sender: &Connection,
        items: Vec<Item>,
        memfds: &mut Vec<Arc<Memfd>>,
    ) -> BusResult<Vec<Item>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Item::PayloadOff { offset, size } => {
                    out.push(Item::PayloadVec(sender.read_pool(offset, size)?));
                },
                Item::PayloadMemfd { handle, size } => {
                    let memfd = sender.memfd(handle)?;
                    if !memfd.is_sealed() {
                        return Err(BusError::MemfdNotSealed {
                            handle: u64::from(handle),
                        });
                    }
                    if size > memfd.size() {
                        return Err(BusError::invalid_argument(format!(
                            "payload of {size} bytes exceeds memfd {handle} of {} bytes",
                            memfd.size()
                        )));
                    }
                    memfds.push(memfd);
                    out.push(Item::PayloadMemfd { handle, size });
                },
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn unicast(&self, ctx: &SendContext<'_>) -> BusResult<()> {
        let message = ctx.message;
        let sender = ctx.sender;
        let dst_name = message.dst_name();

        let dst = match dst_name {
            Some(name) => {
                let id = match self.names.resolve(name) {
                    Some(Resolution::Owner(id)) => id,
                    Some(Resolution::Activator(id))
                        if !message.flags.contains(MessageFlags::NO_AUTO_START) =>
                    {
                        trace!(name, activator = id, "routing to activator");
                        id
                    },
                    _ => {
                        return Err(BusError::NameNotFound {
                            name: name.to_string(),
                        });
                    },
                };
                self.connection(id)?
            },
            None => self.connection(message.dst_id)?,
        };

        let answers = match message.reply {
            Reply::To { cookie } => self
                .replies
                .lock()
                .expect("lock poisoned")
                .get(&(dst.id(), cookie))
                .is_some_and(|p| p.replier == sender.id()),
            _ => false,
        };
        if !answers {
            self.authorize_unicast(ctx, &dst, dst_name)?;
        }
        if message.has_fds() && !dst.accepts_fds() {
            return Err(BusError::FdsNotAccepted { id: dst.id() });
        }

        let expect_key = (sender.id(), message.cookie);
        if let Reply::Expect { timeout_ns } = message.reply {
            let deadline = Instant::now()
                .checked_add(Duration::from_nanos(timeout_ns))
                .ok_or_else(|| BusError::invalid_argument("reply timeout out of range"))?;
            self.replies.lock().expect("lock poisoned").insert(
                expect_key,
                PendingReply {
                    replier: dst.id(),
                    deadline,
                },
            );
        }

        let delivery = ctx.delivery_for(&dst, dst_name);
        if let Err(err) = self.deliver(&dst, &delivery, ctx.memfds) {
            if matches!(message.reply, Reply::Expect { .. }) {
                self.replies
                    .lock()
                    .expect("lock poisoned")
                    .remove(&expect_key);
            }
            debug!(
                src_id = sender.id(),
                dst_id = dst.id(),
                cookie = message.cookie,
                error = %err,
                "unicast delivery failed"
            );
            return Err(err);
        }
        if answers && let Reply::To { cookie } = message.reply {
            self.replies
                .lock()
                .expect("lock poisoned")
                .remove(&(dst.id(), cookie));
        }
        trace!(
            src_id = sender.id(),
            dst_id = dst.id(),
            cookie = message.cookie,
            "message delivered"
        );

        for monitor in self.snapshot() {
            if monitor.is_monitor() && monitor.id() != dst.id() && monitor.id() != sender.id() {
                self.deliver_best_effort(
                    &monitor,
                    &ctx.delivery_for(&monitor, dst_name),
                    ctx.memfds,
                );
            }
        }
        Ok(())
    }

    fn authorize_unicast(
        &self,
        ctx: &SendContext<'_>,
        dst: &Connection,
        dst_name: Option<&str>,
    ) -> BusResult<()> {
        let subject = ctx.sender.metadata();
        if let Some(name) = dst_name {
            return self.policy.check(subject, name, Access::Send);
        }
        let owned = self.names.names_of(dst.id());
        if owned.is_empty()
            || self.policy.allows_any(subject, &owned, Access::Send)
            || self
                .policy
                .allows_any(dst.metadata(), ctx.sender_names, Access::Recv)
        {
            return Ok(());
        }
        debug!(
            src_id = ctx.sender.id(),
            dst_id = dst.id(),
            "policy denied send by id"
        );
        Err(BusError::PolicyDenied {
            name: owned[0].clone(),
            access: Access::Send,
        })
    }

    fn broadcast(&self, ctx: &SendContext<'_>) {
        let event = MatchEvent::Message {
            src_id: ctx.sender.id(),
            src_names: ctx.sender_names,
            bloom: ctx.message.bloom(),
        };
        let mut delivered = 0usize;
        for conn in self.snapshot() {
            if conn.id() == ctx.sender.id() {
                continue;
            }
            if !conn.is_monitor() {
                if !conn.wants(&event) {
                    continue;
                }
                if !ctx.sender_names.is_empty()
                    && !self
                        .policy
                        .allows_any(conn.metadata(), ctx.sender_names, Access::Recv)
                {
                    debug!(
                        src_id = ctx.sender.id(),
                        dst_id = conn.id(),
                        "broadcast filtered by policy"
                    );
                    continue;
                }
            }
            if self.deliver_best_effort(&conn, &ctx.delivery_for(&conn, None), ctx.memfds) {
                delivered += 1;
            }
        }
        trace!(
            src_id = ctx.sender.id(),
            cookie = ctx.message.cookie,
            delivered,
            "broadcast routed"
        );
    }

    fn deliver(
        &self,
        conn: &Connection,
        delivery: &Delivery,
        memfds: &[Arc<Memfd>],
    ) -> BusResult<u64> {
        let offset = conn.deliver(delivery, self.config.limits.max_queued)?;
        for memfd in memfds {
            conn.hold_memfd(Arc::clone(memfd));
        }
        Ok(offset)
    }

    /// Delivers without surfacing errors. Returns `true` on success.
    fn deliver_best_effort(
        &self,
        conn: &Connection,
        delivery: &Delivery,
        memfds: &[Arc<Memfd>],
    ) -> bool {
        match self.deliver(conn, delivery, memfds) {
            Ok(_) => true,
            Err(err) => {
                debug!(
                    dst_id = conn.id(),
                    cookie = delivery.message.cookie,
                    error = %err,
                    "delivery dropped"
                );
                false
            },
        }
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Delivers committed notifications to every connection that wants them.
    fn notify(&self, events: Vec<Notification>) {
        if events.is_empty() {
            return;
        }
        let conns = self.snapshot();
        for event in events {
            let match_event = MatchEvent::Notification(&event);
            for conn in &conns {
                if !(conn.is_monitor() || conn.wants(&match_event)) {
                    continue;
                }
                let delivery = Delivery {
                    message: event.clone().into_message(conn.id()),
                    priority: 0,
                    dst_name: None,
                };
                if let Err(err) = conn.deliver(&delivery, self.config.limits.max_queued) {
                    debug!(dst_id = conn.id(), error = %err, "notification dropped");
                }
            }
        }
    }

    fn notify_one(&self, id: u64, note: Notification) {
        let Ok(conn) = self.connection(id) else {
            return;
        };
        let delivery = Delivery {
            message: note.into_message(id),
            priority: 0,
            dst_name: None,
        };
        if let Err(err) = conn.deliver(&delivery, self.config.limits.max_queued) {
            warn!(dst_id = id, error = %err, "reply notification lost");
        }
    }

    /// Sends `REPLY_TIMEOUT` for every correlation whose deadline is at or
    /// before `now`. Returns how many expired.
    pub fn sweep_expired_replies_at(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.replies
            .lock()
            .expect("lock poisoned")
            .retain(|&(waiter, cookie), pending| {
                if pending.deadline <= now {
                    expired.push((waiter, cookie));
                    false
                } else {
                    true
                }
            });
        for &(waiter, cookie) in &expired {
            debug!(conn_id = waiter, cookie, "reply timed out");
            self.notify_one(waiter, Notification::ReplyTimeout { cookie });
        }
        expired.len()
    }

    /// [`Bus::sweep_expired_replies_at`] with the current time.
    pub fn sweep_expired_replies(&self) -> usize {
        self.sweep_expired_replies_at(Instant::now())
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Dequeues the next message for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionNotFound`] for an unknown id.
    pub fn receive(&self, id: u64) -> BusResult<Option<Received>> {
        Ok(self.caller(id)?.receive())
    }

    /// Releases a received pool slice.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] for a stale offset.
    pub fn free(&self, id: u64, offset: u64) -> BusResult<()> {
        self.caller(id)?.free(offset)
    }

    /// Decodes the message at a received offset.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] for a stale offset.
    pub fn read_message(&self, id: u64, offset: u64) -> BusResult<Envelope> {
        Envelope::classify(self.caller(id)?.read_message(offset)?)
    }

    /// Payload bytes of the message at a received offset.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] for a stale offset.
    pub fn read_payload(&self, id: u64, offset: u64) -> BusResult<Bytes> {
        self.caller(id)?.read_payload(offset)
    }

    // ------------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------------

    /// Acquires a well-known name.
    ///
    /// Policy is checked before ownership changes. When the name had only an
    /// activator, messages waiting there for it move to the new owner.
    ///
    /// # Errors
    ///
    /// Policy, limit and registry errors.
    pub fn name_acquire(&self, id: u64, name: &str, flags: NameFlags) -> BusResult<AcquireStatus> {
        let conn = self.caller(id)?;
        validate_name(name)?;
        self.policy.check(conn.metadata(), name, Access::Own)?;
        let max = self.config.limits.max_names;
        if self.names.names_of(id).len() >= max {
            return Err(BusError::TooManyNames { max });
        }

        self.acquire_for(&conn, name, flags)
    }

    fn acquire_for(
        &self,
        conn: &Connection,
        name: &str,
        flags: NameFlags,
    ) -> BusResult<AcquireStatus> {
        let id = conn.id();
        let acquired = self.names.acquire(id, name, flags)?;

        // A concurrent disconnect may have swept the registry before the
        // insert above; its liveness flag is cleared before that sweep.
        if !conn.is_alive() {
            let mut events = acquired.events;
            events.extend(self.names.remove_connection(id));
            self.notify(events);
            debug!(conn_id = id, name, "acquire rolled back after disconnect");
            return Err(BusError::Disconnected { id });
        }

        if let Some(activator) = acquired.handover_from {
            self.hand_over(name, activator, conn);
        }
        self.notify(acquired.events);
        Ok(acquired.status)
    }

    /// Releases a name or leaves its queue.
    ///
    /// # Errors
    ///
    /// Registry errors.
    pub fn name_release(&self, id: u64, name: &str) -> BusResult<()> {
        self.caller(id)?;
        let events = self.names.release(id, name)?;
        self.notify(events);
        Ok(())
    }

    /// Lists connections and names.
    #[must_use]
    pub fn name_list(&self, flags: ListFlags) -> Vec<NameListEntry> {
        let mut out = Vec::new();
        if flags.contains(ListFlags::UNIQUE) {
            out.extend(self.snapshot().iter().map(|conn| NameListEntry {
                id: conn.id(),
                name: None,
                flags: NameFlags::empty(),
                activator: conn.is_starter(),
            }));
        }
        out.extend(self.names.list(flags));
        out
    }

    fn hand_over(&self, name: &str, from: u64, to: &Connection) {
        let Ok(activator) = self.connection(from) else {
            return;
        };
        let deliveries = match activator.drain_for_name(name) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                warn!(name, activator = from, error = %err, "activator queue not handed over");
                return;
            },
        };
        let moved = deliveries.len();
        for delivery in deliveries {
            let memfds: Vec<Arc<Memfd>> = delivery
                .message
                .items
                .iter()
                .filter_map(|item| match item {
                    Item::PayloadMemfd { handle, .. } => activator.memfd(*handle).ok(),
                    _ => None,
                })
                .collect();
            if let Err(err) = self.deliver(to, &delivery, &memfds) {
                warn!(name, dst_id = to.id(), error = %err, "activated message lost");
                continue;
            }
            if matches!(delivery.message.reply, Reply::Expect { .. }) {
                let key = (delivery.message.src_id, delivery.message.cookie);
                if let Some(pending) = self.replies.lock().expect("lock poisoned").get_mut(&key)
                    && pending.replier == from
                {
                    pending.replier = to.id();
                }
            }
        }
        if moved > 0 {
            info!(name, activator = from, owner = to.id(), moved, "activator queue handed over");
        }
    }

    // ------------------------------------------------------------------------
    // Matches and policy
    // ------------------------------------------------------------------------

    /// Installs a match rule for `id`.
    ///
    /// # Errors
    ///
    /// See [`crate::matcher::MatchDb::add`].
    pub fn match_add(&self, id: u64, rule: MatchRule) -> BusResult<()> {
        self.caller(id)?.add_match(
            rule,
            self.config.bloom_size,
            self.config.limits.max_matches,
        )
    }

    /// Removes every rule of `id` with `cookie`.
    ///
    /// # Errors
    ///
    /// See [`crate::matcher::MatchDb::remove`].
    pub fn match_remove(&self, id: u64, cookie: u64) -> BusResult<usize> {
        self.caller(id)?.remove_match(cookie)
    }

    /// Replaces the policy of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PermissionDenied`] unless the caller owns its
    /// endpoint or runs as uid 0, and [`BusError::InvalidName`] for a
    /// malformed name.
    pub fn policy_set(&self, id: u64, name: &str, entries: Vec<PolicyAccess>) -> BusResult<()> {
        let conn = self.caller(id)?;
        let creds = conn.metadata().creds;
        let permitted = self
            .endpoints
            .read()
            .expect("lock poisoned")
            .get(conn.endpoint())
            .is_some_and(|ep| ep.is_owned_by(&creds));
        if !permitted {
            return Err(BusError::permission_denied(
                "policy-set requires the endpoint owner",
            ));
        }
        validate_name(name)?;
        info!(conn_id = id, name, entries = entries.len(), "policy replaced");
        self.policy.set(name, entries);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Memfds
    // ------------------------------------------------------------------------

    /// Creates a memfd held by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] above the memfd size limit.
    pub fn memfd_new(&self, id: u64, size: u64) -> BusResult<u32> {
        let conn = self.caller(id)?;
        let bytes = self.checked_memfd_size(size)?;
        let handle = self.next_memfd.fetch_add(1, Ordering::Relaxed);
        conn.hold_memfd(Arc::new(Memfd::new(handle, bytes)));
        debug!(conn_id = id, handle, size, "memfd created");
        Ok(handle)
    }

    /// Size of a held memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn memfd_size_get(&self, id: u64, handle: u32) -> BusResult<u64> {
        Ok(self.caller(id)?.memfd(handle)?.size())
    }

    /// Resizes a held memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SealedReadOnly`] once sealed.
    pub fn memfd_size_set(&self, id: u64, handle: u32, size: u64) -> BusResult<()> {
        let memfd = self.caller(id)?.memfd(handle)?;
        memfd.set_size(self.checked_memfd_size(size)?)
    }

    /// Seal state of a held memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn memfd_seal_get(&self, id: u64, handle: u32) -> BusResult<bool> {
        Ok(self.caller(id)?.memfd(handle)?.is_sealed())
    }

    /// Seals a held memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn memfd_seal_set(&self, id: u64, handle: u32) -> BusResult<()> {
        self.caller(id)?.memfd(handle)?.seal();
        Ok(())
    }

    /// Writes into an unsealed memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SealedReadOnly`] once sealed and
    /// [`BusError::InvalidArgument`] past the size limit.
    pub fn memfd_write(&self, id: u64, handle: u32, offset: u64, data: &[u8]) -> BusResult<()> {
        let memfd = self.caller(id)?.memfd(handle)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| BusError::invalid_argument("memfd write overflows"))?;
        self.checked_memfd_size(end)?;
        let offset = usize::try_from(offset)
            .map_err(|_| BusError::invalid_argument("memfd offset out of range"))?;
        memfd.write(offset, data)
    }

    /// Contents of a held memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn memfd_read(&self, id: u64, handle: u32) -> BusResult<Bytes> {
        Ok(self.caller(id)?.memfd(handle)?.contents())
    }

    /// Drops `id`'s reference to a memfd.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidHandle`] if not held.
    pub fn memfd_close(&self, id: u64, handle: u32) -> BusResult<()> {
        self.caller(id)?.release_memfd(handle)
    }

    fn checked_memfd_size(&self, size: u64) -> BusResult<usize> {
        let max = self.config.limits.max_memfd_size;
        if size > max {
            return Err(BusError::invalid_argument(format!(
                "memfd size {size} exceeds the limit of {max}"
            )));
        }
        usize::try_from(size).map_err(|_| BusError::invalid_argument("memfd size out of range"))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn connection(&self, id: u64) -> BusResult<Arc<Connection>> {
        self.connections
            .read()
            .expect("lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(BusError::ConnectionNotFound { id })
    }

    fn caller(&self, id: u64) -> BusResult<Arc<Connection>> {
        let conn = self.connection(id)?;
        conn.ensure_alive()?;
        Ok(conn)
    }

    /// Live connections ordered by id.
    fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut conns: Vec<Arc<Connection>> = self
            .connections
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    fn timestamp(&self) -> Timestamp {
        let monotonic_ns = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let realtime_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        Timestamp {
            monotonic_ns,
            realtime_ns,
        }
    }
}

/// Per-send values shared by every recipient.
struct SendContext<'a> {
    sender: &'a Connection,
    sender_names: &'a [String],
    message: &'a Message,
    memfds: &'a [Arc<Memfd>],
    timestamp: Timestamp,
}

impl SendContext<'_> {
    /// The message plus the metadata `recipient` asked for.
    fn delivery_for(&self, recipient: &Connection, dst_name: Option<&str>) -> Delivery {
        let mut message = self.message.clone();
        message.items.extend(self.sender.metadata().attach_items(
            recipient.attach(),
            self.sender_names,
            self.timestamp,
        ));
        Delivery {
            priority: message.priority(),
            message,
            dst_name: dst_name.map(str::to_string),
        }
    }
}
