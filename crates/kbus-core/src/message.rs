//! Message header and delivered envelopes.
//!
//! # Wire Format
//!
//! ```text
//! +------+-------+--------+--------+--------------+--------+----------------------+-------+
//! | size | flags | dst_id | src_id | payload_type | cookie | cookie_reply/timeout | items |
//! +------+-------+--------+--------+--------------+--------+----------------------+-------+
//!   u64     u64     u64      u64        u64          u64            u64
//! ```
//!
//! `size` covers the header and the item chain. The last header word is the
//! reply timeout when [`MessageFlags::EXPECT_REPLY`] is set and the cookie
//! being answered otherwise.

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::{BusError, BusResult};
use crate::item::{self, ChainContext, IdChange, Item, NameChange};

/// Size of the fixed message header.
pub const MESSAGE_HEADER_SIZE: u64 = 56;

/// Source id of bus-synthesized messages.
pub const SRC_ID_KERNEL: u64 = 0;

/// Destination id meaning "resolve the `DST_NAME` item".
pub const DST_ID_NAME: u64 = 0;

/// Destination id for broadcasts.
pub const DST_ID_BROADCAST: u64 = u64::MAX;

/// Payload type of bus-synthesized messages.
pub const PAYLOAD_KERNEL: u64 = 0;

/// Payload type tag `DBusVer1`.
pub const PAYLOAD_DBUS1: u64 = 0x4442_7573_5665_7231;

/// Payload type tag `GVariant`.
pub const PAYLOAD_GVARIANT: u64 = 0x4756_6172_6961_6e74;

bitflags! {
    /// Per-message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u64 {
        /// The sender waits for a reply; the last header word is a timeout.
        const EXPECT_REPLY  = 1 << 0;
        /// Do not hand the message to an activator.
        const NO_AUTO_START = 1 << 1;
    }
}

/// Reply correlation carried in the last header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reply {
    /// Neither a request for nor an answer to a reply.
    #[default]
    None,
    /// The sender expects a reply within `timeout_ns`.
    Expect {
        /// Relative timeout in nanoseconds.
        timeout_ns: u64,
    },
    /// This message answers the message with `cookie`. Cookie 0 encodes as
    /// [`Reply::None`] and is rejected by the router.
    To {
        /// Cookie of the request.
        cookie: u64,
    },
}

/// A message as submitted by a sender or read back from a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message flags. `EXPECT_REPLY` is derived from [`Message::reply`].
    pub flags: MessageFlags,
    /// Destination connection, [`DST_ID_NAME`] or [`DST_ID_BROADCAST`].
    pub dst_id: u64,
    /// Sender; filled in by the bus on send.
    pub src_id: u64,
    /// Opaque payload format tag.
    pub payload_type: u64,
    /// Sender-chosen correlation cookie.
    pub cookie: u64,
    /// Reply correlation.
    pub reply: Reply,
    /// Item chain.
    pub items: Vec<Item>,
}

impl Message {
    /// A unicast message to connection `dst_id`.
    #[must_use]
    pub fn to_id(dst_id: u64, cookie: u64) -> Self {
        Self {
            flags: MessageFlags::empty(),
            dst_id,
            src_id: 0,
            payload_type: PAYLOAD_DBUS1,
            cookie,
            reply: Reply::None,
            items: Vec::new(),
        }
    }

    /// A message addressed to a well-known name.
    #[must_use]
    pub fn to_name(name: impl Into<String>, cookie: u64) -> Self {
        let mut msg = Self::to_id(DST_ID_NAME, cookie);
        msg.items.push(Item::DstName(name.into()));
        msg
    }

    /// A broadcast message.
    #[must_use]
    pub fn broadcast(cookie: u64) -> Self {
        Self::to_id(DST_ID_BROADCAST, cookie)
    }

    /// Adds an item.
    #[must_use]
    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    /// Adds an inline payload.
    #[must_use]
    pub fn with_payload(self, data: impl Into<Bytes>) -> Self {
        self.with_item(Item::PayloadVec(data.into()))
    }

    /// Requests a reply within `timeout_ns`.
    #[must_use]
    pub fn expect_reply(mut self, timeout_ns: u64) -> Self {
        self.reply = Reply::Expect { timeout_ns };
        self
    }

    /// Marks this message as the reply to `cookie`.
    #[must_use]
    pub fn reply_to(mut self, cookie: u64) -> Self {
        self.reply = Reply::To { cookie };
        self
    }

    /// Sets flags.
    #[must_use]
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Returns `true` for broadcasts.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.dst_id == DST_ID_BROADCAST
    }

    /// The `DST_NAME` item, if any.
    #[must_use]
    pub fn dst_name(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            Item::DstName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// The `BLOOM` item, if any.
    #[must_use]
    pub fn bloom(&self) -> Option<&[u8]> {
        self.items.iter().find_map(|item| match item {
            Item::Bloom(bloom) => Some(bloom.as_ref()),
            _ => None,
        })
    }

    /// Queue priority; 0 when no `PRIORITY` item is present.
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.items
            .iter()
            .find_map(|item| match item {
                Item::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// Returns `true` if any `FDS` item is present.
    #[must_use]
    pub fn has_fds(&self) -> bool {
        self.items.iter().any(|item| matches!(item, Item::Fds(_)))
    }

    /// Concatenated inline payload bytes.
    ///
    /// Offsets and memfds are not resolved; use
    /// [`crate::Bus::read_payload`] for delivered messages.
    #[must_use]
    pub fn inline_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for item in &self.items {
            if let Item::PayloadVec(data) = item {
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Total encoded size.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        MESSAGE_HEADER_SIZE + item::chain_len(&self.items)
    }

    /// Encodes header and items.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (flags, last_word) = match self.reply {
            Reply::None => (self.flags - MessageFlags::EXPECT_REPLY, 0),
            Reply::Expect { timeout_ns } => (self.flags | MessageFlags::EXPECT_REPLY, timeout_ns),
            Reply::To { cookie } => (self.flags - MessageFlags::EXPECT_REPLY, cookie),
        };

        let mut out = Vec::with_capacity(usize::try_from(self.encoded_len()).unwrap_or(0));
        for word in [
            self.encoded_len(),
            flags.bits(),
            self.dst_id,
            self.src_id,
            self.payload_type,
            self.cookie,
            last_word,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for item in &self.items {
            item.encode_into(&mut out);
        }
        out
    }

    /// Decodes a message, checking its items against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MalformedChain`] if the header is truncated,
    /// declares a size outside the buffer, or carries unknown flags, and
    /// propagates item chain errors.
    pub fn decode(buf: &[u8], ctx: ChainContext) -> BusResult<Self> {
        if (buf.len() as u64) < MESSAGE_HEADER_SIZE {
            return Err(BusError::malformed(format!(
                "message of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let word = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(bytes)
        };

        let size = word(0);
        if size < MESSAGE_HEADER_SIZE || size > buf.len() as u64 {
            return Err(BusError::malformed(format!(
                "message declares size {size} for a buffer of {} bytes",
                buf.len()
            )));
        }
        let Some(flags) = MessageFlags::from_bits(word(1)) else {
            return Err(BusError::malformed(format!(
                "unknown message flags {:#x}",
                word(1)
            )));
        };
        let last_word = word(6);
        let reply = if flags.contains(MessageFlags::EXPECT_REPLY) {
            Reply::Expect {
                timeout_ns: last_word,
            }
        } else if last_word != 0 {
            Reply::To { cookie: last_word }
        } else {
            Reply::None
        };

        let header = MESSAGE_HEADER_SIZE as usize;
        let items = item::parse_chain(&buf[header..], size - MESSAGE_HEADER_SIZE, ctx)?;

        Ok(Self {
            flags: flags - MessageFlags::EXPECT_REPLY,
            dst_id: word(2),
            src_id: word(3),
            payload_type: word(4),
            cookie: word(5),
            reply,
            items,
        })
    }
}

/// A bus-synthesized notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A name gained its first owner.
    NameAdd(NameChange),
    /// A name lost its last owner.
    NameRemove(NameChange),
    /// A name moved between owners.
    NameChange(NameChange),
    /// A connection appeared.
    IdAdd(IdChange),
    /// A connection disappeared.
    IdRemove(IdChange),
    /// The reply to `cookie` did not arrive in time.
    ReplyTimeout {
        /// Cookie of the unanswered request.
        cookie: u64,
    },
    /// The peer expected to answer `cookie` disconnected.
    ReplyDead {
        /// Cookie of the unanswered request.
        cookie: u64,
    },
}

impl Notification {
    /// Builds the kernel message carrying this notification to `dst_id`.
    #[must_use]
    pub fn into_message(self, dst_id: u64) -> Message {
        let (item, reply) = match self {
            Self::NameAdd(change) => (Item::NameAdd(change), Reply::None),
            Self::NameRemove(change) => (Item::NameRemove(change), Reply::None),
            Self::NameChange(change) => (Item::NameChange(change), Reply::None),
            Self::IdAdd(change) => (Item::IdAdd(change), Reply::None),
            Self::IdRemove(change) => (Item::IdRemove(change), Reply::None),
            Self::ReplyTimeout { cookie } => (Item::ReplyTimeout, Reply::To { cookie }),
            Self::ReplyDead { cookie } => (Item::ReplyDead, Reply::To { cookie }),
        };
        Message {
            flags: MessageFlags::empty(),
            dst_id,
            src_id: SRC_ID_KERNEL,
            payload_type: PAYLOAD_KERNEL,
            cookie: 0,
            reply,
            items: vec![item],
        }
    }
}

/// What a receiver finds in its pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A message from another connection.
    User(Message),
    /// A notification synthesized by the bus.
    Kernel(Notification),
}

impl Envelope {
    /// Classifies a decoded message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MalformedChain`] for a kernel message that does not
    /// carry exactly one notification item.
    pub fn classify(msg: Message) -> BusResult<Self> {
        if msg.src_id != SRC_ID_KERNEL {
            return Ok(Self::User(msg));
        }
        let cookie = match msg.reply {
            Reply::To { cookie } => cookie,
            _ => 0,
        };
        let mut items = msg.items.into_iter();
        let (Some(item), None) = (items.next(), items.next()) else {
            return Err(BusError::malformed(
                "kernel message must carry exactly one notification item",
            ));
        };
        let notification = match item {
            Item::NameAdd(change) => Notification::NameAdd(change),
            Item::NameRemove(change) => Notification::NameRemove(change),
            Item::NameChange(change) => Notification::NameChange(change),
            Item::IdAdd(change) => Notification::IdAdd(change),
            Item::IdRemove(change) => Notification::IdRemove(change),
            Item::ReplyTimeout => Notification::ReplyTimeout { cookie },
            Item::ReplyDead => Notification::ReplyDead { cookie },
            other => {
                return Err(BusError::ForbiddenItemType {
                    item_type: other.item_type().raw(),
                });
            },
        };
        Ok(Self::Kernel(notification))
    }
}
