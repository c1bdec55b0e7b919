//! Item chain codec.
//!
//! Messages and several control commands carry a trailing chain of tagged,
//! length-prefixed items:
//!
//! ```text
//! +-----------+-----------+----------------------+---------+
//! | size (u64)| type (u64)| payload              | padding |
//! +-----------+-----------+----------------------+---------+
//! |<------------- size ------------------------->|
//! |<------------- align8(size) -------------------------->|
//! ```
//!
//! All integers are little-endian. Each item starts on an 8-byte boundary and
//! padding bytes must be zero. The chain ends exactly at the declared outer
//! size.
//!
//! Parsing happens once, into owned [`Item`] values. Nothing downstream
//! reinterprets raw bytes.
//!
//! # Type ranges
//!
//! | Range     | Category                     | Who may produce it         |
//! |-----------|------------------------------|----------------------------|
//! | `0x001..` | [`ItemCategory::User`]         | senders                    |
//! | `0x400..` | [`ItemCategory::Metadata`]     | the bus (plus `STARTER_NAME` in hello) |
//! | `0x800..` | [`ItemCategory::Notification`] | the bus only               |

use bytes::Bytes;

use crate::error::{BusError, BusResult};
use crate::metadata::{Audit, Credentials, Timestamp};

/// Size of the `size` + `type` item header.
pub const ITEM_HEADER_SIZE: u64 = 16;

/// Rounds `n` up to the next multiple of 8.
#[must_use]
pub const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// Broad category of an item type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemCategory {
    /// Supplied by the sender.
    User,
    /// Attached by the bus to describe the sender.
    Metadata,
    /// Synthesized by the bus.
    Notification,
}

/// Known item types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ItemType {
    /// Inline payload bytes.
    PayloadVec   = 0x001,
    /// Payload referenced by offset into a pool.
    PayloadOff   = 0x002,
    /// Payload carried in a sealed memfd.
    PayloadMemfd = 0x003,
    /// File descriptor array.
    Fds          = 0x004,
    /// Bloom filter for broadcast matching.
    Bloom        = 0x005,
    /// Destination well-known name.
    DstName      = 0x006,
    /// Queue priority.
    Priority     = 0x007,

    /// Well-known names of the sender.
    Names        = 0x400,
    /// Name a starter connection activates (hello only).
    StarterName  = 0x401,
    /// Send timestamps.
    Timestamp    = 0x402,
    /// Sender credentials.
    Creds        = 0x403,
    /// Sender process command name.
    PidComm      = 0x404,
    /// Sender thread command name.
    TidComm      = 0x405,
    /// Sender executable.
    Exe          = 0x406,
    /// Sender command line.
    Cmdline      = 0x407,
    /// Sender control group.
    Cgroup       = 0x408,
    /// Sender capabilities.
    Caps         = 0x409,
    /// Sender security label.
    Seclabel     = 0x40a,
    /// Sender audit identity.
    Audit        = 0x40b,

    /// A name gained its first owner.
    NameAdd      = 0x800,
    /// A name lost its last owner.
    NameRemove   = 0x801,
    /// A name moved between owners.
    NameChange   = 0x802,
    /// A connection said hello.
    IdAdd        = 0x803,
    /// A connection went away.
    IdRemove     = 0x804,
    /// An expected reply did not arrive in time.
    ReplyTimeout = 0x805,
    /// The peer expected to reply disconnected.
    ReplyDead    = 0x806,
}

impl ItemType {
    /// Maps a raw type to a known item type.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0x001 => Self::PayloadVec,
            0x002 => Self::PayloadOff,
            0x003 => Self::PayloadMemfd,
            0x004 => Self::Fds,
            0x005 => Self::Bloom,
            0x006 => Self::DstName,
            0x007 => Self::Priority,
            0x400 => Self::Names,
            0x401 => Self::StarterName,
            0x402 => Self::Timestamp,
            0x403 => Self::Creds,
            0x404 => Self::PidComm,
            0x405 => Self::TidComm,
            0x406 => Self::Exe,
            0x407 => Self::Cmdline,
            0x408 => Self::Cgroup,
            0x409 => Self::Caps,
            0x40a => Self::Seclabel,
            0x40b => Self::Audit,
            0x800 => Self::NameAdd,
            0x801 => Self::NameRemove,
            0x802 => Self::NameChange,
            0x803 => Self::IdAdd,
            0x804 => Self::IdRemove,
            0x805 => Self::ReplyTimeout,
            0x806 => Self::ReplyDead,
            _ => return None,
        })
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self as u64
    }

    /// Category of this type.
    #[must_use]
    pub const fn category(self) -> ItemCategory {
        category_of(self.raw())
    }
}

const fn category_of(raw: u64) -> ItemCategory {
    if raw >= 0x800 {
        ItemCategory::Notification
    } else if raw >= 0x400 {
        ItemCategory::Metadata
    } else {
        ItemCategory::User
    }
}

/// Where a chain came from, which decides the item types it may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainContext {
    /// A message submitted by a connection.
    Send,
    /// Items attached to a hello request.
    Hello,
    /// A message read back out of a pool.
    Delivered,
}

impl ChainContext {
    fn check(self, raw: u64) -> BusResult<()> {
        if raw == 0 {
            return Err(BusError::malformed("item type 0 is reserved"));
        }
        let Some(item_type) = ItemType::from_raw(raw) else {
            return Err(BusError::ForbiddenItemType { item_type: raw });
        };
        let allowed = match self {
            Self::Delivered => true,
            Self::Send => item_type.category() == ItemCategory::User,
            Self::Hello => {
                item_type.category() == ItemCategory::User || item_type == ItemType::StarterName
            },
        };
        if allowed {
            Ok(())
        } else {
            Err(BusError::ForbiddenItemType { item_type: raw })
        }
    }
}

/// Payload of a name notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    /// Previous owner, 0 if none.
    pub old_id: u64,
    /// New owner, 0 if none.
    pub new_id: u64,
    /// Name flags of the new owner.
    pub flags: u64,
    /// The name.
    pub name: String,
}

/// Payload of an id notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdChange {
    /// The connection id.
    pub id: u64,
    /// Connection flags from hello.
    pub flags: u64,
}

/// A parsed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Inline payload bytes.
    PayloadVec(Bytes),
    /// Payload bytes at `offset` in a pool (the sender's pool on send, the
    /// recipient's pool on delivery).
    PayloadOff {
        /// Pool offset.
        offset: u64,
        /// Byte count.
        size: u64,
    },
    /// Payload carried in a sealed memfd.
    PayloadMemfd {
        /// Memfd handle.
        handle: u32,
        /// Bytes of the memfd that form the payload.
        size: u64,
    },
    /// File descriptor numbers.
    Fds(Vec<i32>),
    /// Bloom filter bits.
    Bloom(Bytes),
    /// Destination well-known name.
    DstName(String),
    /// Queue priority; lower values are received first.
    Priority(i64),
    /// Well-known names of the sender.
    Names(Vec<String>),
    /// Name activated by a starter connection.
    StarterName(String),
    /// Send timestamps.
    Timestamp(Timestamp),
    /// Sender credentials.
    Creds(Credentials),
    /// Sender process command name.
    PidComm(String),
    /// Sender thread command name.
    TidComm(String),
    /// Sender executable.
    Exe(String),
    /// Sender command line.
    Cmdline(Vec<String>),
    /// Sender control group.
    Cgroup(String),
    /// Sender capabilities.
    Caps(Bytes),
    /// Sender security label.
    Seclabel(String),
    /// Sender audit identity.
    Audit(Audit),
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
    /// An expected reply timed out.
    ReplyTimeout,
    /// The expected replier disconnected.
    ReplyDead,
}

impl Item {
    /// Type tag of this item.
    #[must_use]
    pub const fn item_type(&self) -> ItemType {
        match self {
            Self::PayloadVec(_) => ItemType::PayloadVec,
            Self::PayloadOff { .. } => ItemType::PayloadOff,
            Self::PayloadMemfd { .. } => ItemType::PayloadMemfd,
            Self::Fds(_) => ItemType::Fds,
            Self::Bloom(_) => ItemType::Bloom,
            Self::DstName(_) => ItemType::DstName,
            Self::Priority(_) => ItemType::Priority,
            Self::Names(_) => ItemType::Names,
            Self::StarterName(_) => ItemType::StarterName,
            Self::Timestamp(_) => ItemType::Timestamp,
            Self::Creds(_) => ItemType::Creds,
            Self::PidComm(_) => ItemType::PidComm,
            Self::TidComm(_) => ItemType::TidComm,
            Self::Exe(_) => ItemType::Exe,
            Self::Cmdline(_) => ItemType::Cmdline,
            Self::Cgroup(_) => ItemType::Cgroup,
            Self::Caps(_) => ItemType::Caps,
            Self::Seclabel(_) => ItemType::Seclabel,
            Self::Audit(_) => ItemType::Audit,
            Self::NameAdd(_) => ItemType::NameAdd,
            Self::NameRemove(_) => ItemType::NameRemove,
            Self::NameChange(_) => ItemType::NameChange,
            Self::IdAdd(_) => ItemType::IdAdd,
            Self::IdRemove(_) => ItemType::IdRemove,
            Self::ReplyTimeout => ItemType::ReplyTimeout,
            Self::ReplyDead => ItemType::ReplyDead,
        }
    }

    /// Size of the payload, excluding header and padding.
    #[must_use]
    pub fn payload_len(&self) -> u64 {
        let len = match self {
            Self::PayloadVec(data) | Self::Bloom(data) | Self::Caps(data) => data.len(),
            Self::PayloadOff { .. } | Self::Audit(_) | Self::Timestamp(_) | Self::IdAdd(_)
            | Self::IdRemove(_) => 16,
            Self::PayloadMemfd { .. } => 16,
            Self::Fds(fds) => fds.len() * 4,
            Self::Priority(_) => 8,
            Self::DstName(s)
            | Self::StarterName(s)
            | Self::PidComm(s)
            | Self::TidComm(s)
            | Self::Exe(s)
            | Self::Cgroup(s)
            | Self::Seclabel(s) => s.len() + 1,
            Self::Names(list) | Self::Cmdline(list) => list.iter().map(|s| s.len() + 1).sum(),
            Self::Creds(_) => 40,
            Self::NameAdd(change) | Self::NameRemove(change) | Self::NameChange(change) => {
                24 + change.name.len() + 1
            },
            Self::ReplyTimeout | Self::ReplyDead => 0,
        };
        len as u64
    }

    /// Size of the item including its header, excluding trailing padding.
    #[must_use]
    pub fn size(&self) -> u64 {
        ITEM_HEADER_SIZE + self.payload_len()
    }

    /// Bytes this item occupies in a chain.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        align8(self.size())
    }

    /// Appends the encoded item, including padding, to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.size().to_le_bytes());
        out.extend_from_slice(&self.item_type().raw().to_le_bytes());

        match self {
            Self::PayloadVec(data) | Self::Bloom(data) | Self::Caps(data) => {
                out.extend_from_slice(data);
            },
            Self::PayloadOff { offset, size } => {
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
            },
            Self::PayloadMemfd { handle, size } => {
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&handle.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
            },
            Self::Fds(fds) => {
                for fd in fds {
                    out.extend_from_slice(&fd.to_le_bytes());
                }
            },
            Self::Priority(priority) => out.extend_from_slice(&priority.to_le_bytes()),
            Self::DstName(s)
            | Self::StarterName(s)
            | Self::PidComm(s)
            | Self::TidComm(s)
            | Self::Exe(s)
            | Self::Cgroup(s)
            | Self::Seclabel(s) => put_str(out, s),
            Self::Names(list) | Self::Cmdline(list) => {
                for s in list {
                    put_str(out, s);
                }
            },
            Self::Timestamp(ts) => {
                out.extend_from_slice(&ts.monotonic_ns.to_le_bytes());
                out.extend_from_slice(&ts.realtime_ns.to_le_bytes());
            },
            Self::Creds(creds) => {
                for v in [creds.uid, creds.gid, creds.pid, creds.tid, creds.starttime] {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            },
            Self::Audit(audit) => {
                out.extend_from_slice(&audit.sessionid.to_le_bytes());
                out.extend_from_slice(&audit.loginuid.to_le_bytes());
            },
            Self::NameAdd(change) | Self::NameRemove(change) | Self::NameChange(change) => {
                out.extend_from_slice(&change.old_id.to_le_bytes());
                out.extend_from_slice(&change.new_id.to_le_bytes());
                out.extend_from_slice(&change.flags.to_le_bytes());
                put_str(out, &change.name);
            },
            Self::IdAdd(change) | Self::IdRemove(change) => {
                out.extend_from_slice(&change.id.to_le_bytes());
                out.extend_from_slice(&change.flags.to_le_bytes());
            },
            Self::ReplyTimeout | Self::ReplyDead => {},
        }

        let written = (out.len() - start) as u64;
        debug_assert_eq!(written, self.size());
        out.resize(start + align8(written) as usize, 0);
    }

    /// Decodes the payload of a raw item.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MalformedChain`] if the payload does not have the
    /// layout its type requires and [`BusError::ForbiddenItemType`] for
    /// unknown types.
    pub fn decode(raw: &RawItem<'_>) -> BusResult<Self> {
        let Some(item_type) = ItemType::from_raw(raw.item_type) else {
            return Err(BusError::ForbiddenItemType {
                item_type: raw.item_type,
            });
        };
        let payload = raw.payload;
        let mut r = PayloadReader::new(item_type, payload);

        let item = match item_type {
            ItemType::PayloadVec => Self::PayloadVec(Bytes::copy_from_slice(payload)),
            ItemType::Bloom => {
                if payload.is_empty() || payload.len() % 8 != 0 {
                    return Err(BusError::malformed(format!(
                        "bloom item of {} bytes is not a non-zero multiple of 8",
                        payload.len()
                    )));
                }
                Self::Bloom(Bytes::copy_from_slice(payload))
            },
            ItemType::Caps => Self::Caps(Bytes::copy_from_slice(payload)),
            ItemType::PayloadOff => {
                r.expect_len(16)?;
                let size = r.u64()?;
                let offset = r.u64()?;
                Self::PayloadOff { offset, size }
            },
            ItemType::PayloadMemfd => {
                r.expect_len(16)?;
                let size = r.u64()?;
                let handle = r.u32()?;
                let _pad = r.u32()?;
                Self::PayloadMemfd { handle, size }
            },
            ItemType::Fds => {
                if payload.is_empty() || payload.len() % 4 != 0 {
                    return Err(BusError::malformed("fd array length is not a multiple of 4"));
                }
                Self::Fds(
                    payload
                        .chunks_exact(4)
                        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                )
            },
            ItemType::Priority => {
                r.expect_len(8)?;
                #[allow(clippy::cast_possible_wrap)]
                let priority = r.u64()? as i64;
                Self::Priority(priority)
            },
            ItemType::DstName => Self::DstName(decode_str(item_type, payload)?),
            ItemType::StarterName => Self::StarterName(decode_str(item_type, payload)?),
            ItemType::PidComm => Self::PidComm(decode_str(item_type, payload)?),
            ItemType::TidComm => Self::TidComm(decode_str(item_type, payload)?),
            ItemType::Exe => Self::Exe(decode_str(item_type, payload)?),
            ItemType::Cgroup => Self::Cgroup(decode_str(item_type, payload)?),
            ItemType::Seclabel => Self::Seclabel(decode_str(item_type, payload)?),
            ItemType::Names => Self::Names(decode_str_list(item_type, payload)?),
            ItemType::Cmdline => Self::Cmdline(decode_str_list(item_type, payload)?),
            ItemType::Timestamp => {
                r.expect_len(16)?;
                Self::Timestamp(Timestamp {
                    monotonic_ns: r.u64()?,
                    realtime_ns: r.u64()?,
                })
            },
            ItemType::Creds => {
                r.expect_len(40)?;
                Self::Creds(Credentials {
                    uid: r.u64()?,
                    gid: r.u64()?,
                    pid: r.u64()?,
                    tid: r.u64()?,
                    starttime: r.u64()?,
                })
            },
            ItemType::Audit => {
                r.expect_len(16)?;
                Self::Audit(Audit {
                    sessionid: r.u64()?,
                    loginuid: r.u64()?,
                })
            },
            ItemType::NameAdd | ItemType::NameRemove | ItemType::NameChange => {
                let old_id = r.u64()?;
                let new_id = r.u64()?;
                let flags = r.u64()?;
                let name = decode_str(item_type, r.rest())?;
                let change = NameChange {
                    old_id,
                    new_id,
                    flags,
                    name,
                };
                match item_type {
                    ItemType::NameAdd => Self::NameAdd(change),
                    ItemType::NameRemove => Self::NameRemove(change),
                    _ => Self::NameChange(change),
                }
            },
            ItemType::IdAdd | ItemType::IdRemove => {
                r.expect_len(16)?;
                let change = IdChange {
                    id: r.u64()?,
                    flags: r.u64()?,
                };
                if item_type == ItemType::IdAdd {
                    Self::IdAdd(change)
                } else {
                    Self::IdRemove(change)
                }
            },
            ItemType::ReplyTimeout | ItemType::ReplyDead => {
                r.expect_len(0)?;
                if item_type == ItemType::ReplyTimeout {
                    Self::ReplyTimeout
                } else {
                    Self::ReplyDead
                }
            },
        };

        Ok(item)
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn decode_str(item_type: ItemType, payload: &[u8]) -> BusResult<String> {
    let Some((&0, body)) = payload.split_last() else {
        return Err(BusError::malformed(format!(
            "{item_type:?} string is not NUL-terminated"
        )));
    };
    if body.contains(&0) {
        return Err(BusError::malformed(format!(
            "{item_type:?} string contains an embedded NUL"
        )));
    }
    String::from_utf8(body.to_vec())
        .map_err(|_| BusError::malformed(format!("{item_type:?} string is not UTF-8")))
}

fn decode_str_list(item_type: ItemType, payload: &[u8]) -> BusResult<Vec<String>> {
    if payload.last() != Some(&0) {
        return Err(BusError::malformed(format!(
            "{item_type:?} list is not NUL-terminated"
        )));
    }
    payload[..payload.len() - 1]
        .split(|b| *b == 0)
        .map(|part| {
            String::from_utf8(part.to_vec())
                .map_err(|_| BusError::malformed(format!("{item_type:?} entry is not UTF-8")))
        })
        .collect()
}

/// Cursor over a fixed-layout item payload.
struct PayloadReader<'a> {
    item_type: ItemType,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    const fn new(item_type: ItemType, buf: &'a [u8]) -> Self {
        Self {
            item_type,
            buf,
            pos: 0,
        }
    }

    fn expect_len(&self, len: usize) -> BusResult<()> {
        if self.buf.len() == len {
            Ok(())
        } else {
            Err(BusError::malformed(format!(
                "{:?} payload is {} bytes, expected {len}",
                self.item_type,
                self.buf.len()
            )))
        }
    }

    fn take<const N: usize>(&mut self) -> BusResult<[u8; N]> {
        let end = self.pos + N;
        let Some(bytes) = self.buf.get(self.pos..end) else {
            return Err(BusError::malformed(format!(
                "{:?} payload truncated",
                self.item_type
            )));
        };
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    fn u64(&mut self) -> BusResult<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn u32(&mut self) -> BusResult<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }
}

// ============================================================================
// Raw iteration
// ============================================================================

/// An item header plus a view of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawItem<'a> {
    /// Raw type tag.
    pub item_type: u64,
    /// Declared size including the header.
    pub size: u64,
    /// Offset of the item within the chain.
    pub offset: usize,
    /// Payload bytes (without header or padding).
    pub payload: &'a [u8],
}

/// Single forward pass over an item chain.
///
/// Yields each item or the first error; after an error the iterator is
/// exhausted.
#[derive(Debug, Clone)]
pub struct ItemIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Starts iterating over the first `declared` bytes of `buf`.
///
/// # Errors
///
/// Returns [`BusError::MalformedChain`] if `buf` is shorter than `declared`.
pub fn iter_items(buf: &[u8], declared: u64) -> BusResult<ItemIter<'_>> {
    let declared = usize::try_from(declared)
        .map_err(|_| BusError::malformed("declared chain size does not fit in memory"))?;
    let Some(buf) = buf.get(..declared) else {
        return Err(BusError::malformed(format!(
            "declared chain size {declared} exceeds buffer of {} bytes",
            buf.len()
        )));
    };
    Ok(ItemIter {
        buf,
        pos: 0,
        failed: false,
    })
}

impl<'a> ItemIter<'a> {
    fn step(&mut self) -> BusResult<RawItem<'a>> {
        let remaining = self.buf.len() - self.pos;
        if remaining < ITEM_HEADER_SIZE as usize {
            return Err(BusError::malformed(format!(
                "truncated item header at offset {}: {remaining} bytes left",
                self.pos
            )));
        }

        let header = &self.buf[self.pos..self.pos + ITEM_HEADER_SIZE as usize];
        let size = u64::from_le_bytes(header[..8].try_into().unwrap_or_default());
        let item_type = u64::from_le_bytes(header[8..].try_into().unwrap_or_default());

        if size < ITEM_HEADER_SIZE {
            return Err(BusError::malformed(format!(
                "item at offset {} declares size {size}, smaller than its header",
                self.pos
            )));
        }
        if size > remaining as u64 {
            return Err(BusError::malformed(format!(
                "item at offset {} declares size {size}, overrunning the chain by {} bytes",
                self.pos,
                size - remaining as u64
            )));
        }

        // Bounded by `remaining`, so the casts are lossless.
        let end = self.pos + size as usize;
        let aligned_end = self.pos + align8(size) as usize;
        let padded_end = if aligned_end <= self.buf.len() {
            aligned_end
        } else if end == self.buf.len() {
            // The last item may omit its trailing padding.
            end
        } else {
            return Err(BusError::malformed("chain ends inside item padding"));
        };
        if self.buf[end..padded_end].iter().any(|b| *b != 0) {
            return Err(BusError::malformed(format!(
                "non-zero padding after item at offset {}",
                self.pos
            )));
        }

        let item = RawItem {
            item_type,
            size,
            offset: self.pos,
            payload: &self.buf[self.pos + ITEM_HEADER_SIZE as usize..end],
        };
        self.pos = padded_end;
        Ok(item)
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = BusResult<RawItem<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let result = self.step();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}

/// Parses and type-checks a whole chain.
///
/// Either every item is returned or nothing is.
///
/// # Errors
///
/// Returns [`BusError::MalformedChain`] for structural problems and
/// [`BusError::ForbiddenItemType`] for types `ctx` does not allow.
pub fn parse_chain(buf: &[u8], declared: u64, ctx: ChainContext) -> BusResult<Vec<Item>> {
    let mut items = Vec::new();
    for raw in iter_items(buf, declared)? {
        let raw = raw?;
        ctx.check(raw.item_type)?;
        items.push(Item::decode(&raw)?);
    }
    Ok(items)
}

/// Checks already-typed items against a context.
///
/// # Errors
///
/// Returns [`BusError::ForbiddenItemType`] for the first disallowed item.
pub fn check_items(items: &[Item], ctx: ChainContext) -> BusResult<()> {
    items
        .iter()
        .try_for_each(|item| ctx.check(item.item_type().raw()))
}

/// Encodes items back-to-back.
#[must_use]
pub fn encode_chain(items: &[Item]) -> Vec<u8> {
    let mut out = Vec::with_capacity(usize::try_from(chain_len(items)).unwrap_or(0));
    for item in items {
        item.encode_into(&mut out);
    }
    out
}

/// Encoded length of a chain.
#[must_use]
pub fn chain_len(items: &[Item]) -> u64 {
    items.iter().map(Item::encoded_len).sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn header(size: u64, item_type: u64) -> Vec<u8> {
        let mut out = size.to_le_bytes().to_vec();
        out.extend_from_slice(&item_type.to_le_bytes());
        out
    }

    #[test]
    fn test_parse_dst_name_and_payload() {
        let items = vec![
            Item::DstName("org.example.Service".to_string()),
            Item::PayloadVec(Bytes::from_static(b"hello")),
            Item::Priority(-5),
        ];
        let buf = encode_chain(&items);
        assert_eq!(buf.len() % 8, 0);

        let parsed = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap();
        assert_eq!(parsed, items);
    }

    #[test]
    fn test_size_smaller_than_header_is_malformed() {
        let buf = header(8, ItemType::PayloadVec.raw());
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { .. }));
    }

    #[test]
    fn test_overrun_is_malformed() {
        let mut buf = header(64, ItemType::PayloadVec.raw());
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { reason } if reason.contains("overrun")));
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let mut buf = encode_chain(&[Item::Priority(1)]);
        buf.extend_from_slice(&[0u8; 8]);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { reason } if reason.contains("truncated")));
    }

    #[test]
    fn test_declared_size_beyond_buffer_is_malformed() {
        let buf = encode_chain(&[Item::Priority(1)]);
        let err = iter_items(&buf, buf.len() as u64 + 8).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { .. }));
    }

    #[test]
    fn test_nonzero_padding_is_malformed() {
        let mut buf = encode_chain(&[Item::PayloadVec(Bytes::from_static(b"abc"))]);
        let last = buf.len() - 1;
        buf[last] = 0xaa;
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { reason } if reason.contains("padding")));
    }

    #[test]
    fn test_notification_item_forbidden_on_send() {
        let buf = encode_chain(&[Item::ReplyTimeout]);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert_eq!(err, BusError::ForbiddenItemType { item_type: 0x805 });
    }

    #[test]
    fn test_metadata_item_forbidden_on_send() {
        let buf = encode_chain(&[Item::Creds(Credentials::new(0, 0))]);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert_eq!(err, BusError::ForbiddenItemType { item_type: 0x403 });
    }

    #[test]
    fn test_starter_name_allowed_in_hello_only() {
        let items = [Item::StarterName("org.example.Activatable".to_string())];
        let buf = encode_chain(&items);
        assert!(parse_chain(&buf, buf.len() as u64, ChainContext::Hello).is_ok());
        assert!(parse_chain(&buf, buf.len() as u64, ChainContext::Send).is_err());
    }

    #[test]
    fn test_unknown_type_forbidden() {
        let buf = header(16, 0x3ff);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Delivered).unwrap_err();
        assert_eq!(err, BusError::ForbiddenItemType { item_type: 0x3ff });
    }

    #[test]
    fn test_type_zero_malformed() {
        let buf = header(16, 0);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Delivered).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { .. }));
    }

    #[test]
    fn test_string_without_nul_is_malformed() {
        let mut buf = header(19, ItemType::DstName.raw());
        buf.extend_from_slice(b"abc");
        buf.resize(24, 0);
        let err = parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap_err();
        assert!(matches!(err, BusError::MalformedChain { reason } if reason.contains("NUL")));
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut buf = encode_chain(&[Item::Priority(3)]);
        buf.extend_from_slice(&header(4, ItemType::Priority.raw()));
        buf.extend_from_slice(&encode_chain(&[Item::Priority(4)]));

        let mut iter = iter_items(&buf, buf.len() as u64).unwrap();
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_notification_items_decode_when_delivered() {
        let items = vec![
            Item::NameChange(NameChange {
                old_id: 1,
                new_id: 2,
                flags: 0,
                name: "org.x".to_string(),
            }),
            Item::IdRemove(IdChange { id: 7, flags: 2 }),
            Item::ReplyDead,
        ];
        let buf = encode_chain(&items);
        let parsed = parse_chain(&buf, buf.len() as u64, ChainContext::Delivered).unwrap();
        assert_eq!(parsed, items);
    }

    fn arb_user_item() -> impl Strategy<Value = Item> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..40)
                .prop_map(|v| Item::PayloadVec(Bytes::from(v))),
            (any::<u64>(), any::<u64>())
                .prop_map(|(offset, size)| Item::PayloadOff { offset, size }),
            any::<i64>().prop_map(Item::Priority),
            "[a-z]{1,12}(\\.[a-z]{1,12}){1,3}".prop_map(Item::DstName),
            proptest::collection::vec(any::<i32>(), 1..6).prop_map(Item::Fds),
            (1usize..4)
                .prop_flat_map(|words| proptest::collection::vec(any::<u8>(), words * 8))
                .prop_map(|v| Item::Bloom(Bytes::from(v))),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Property: the items of a valid chain exactly cover the declared size.
        #[test]
        fn prop_valid_chain_covers_declared_size(items in proptest::collection::vec(arb_user_item(), 0..8)) {
            let buf = encode_chain(&items);
            let mut consumed = 0u64;
            for raw in iter_items(&buf, buf.len() as u64).unwrap() {
                consumed += align8(raw.unwrap().size);
            }
            prop_assert_eq!(consumed, buf.len() as u64);
            prop_assert_eq!(parse_chain(&buf, buf.len() as u64, ChainContext::Send).unwrap(), items);
        }

        /// Property: a chain cut short anywhere before its end never parses.
        #[test]
        fn prop_truncated_chain_always_fails(
            items in proptest::collection::vec(arb_user_item(), 1..6),
            cut in 1usize..8,
        ) {
            let buf = encode_chain(&items);
            let keep = buf.len().saturating_sub(cut * 8 - 1).max(1);
            prop_assume!(keep < buf.len());
            // Cutting right at an unpadded item end leaves a shorter valid chain.
            let mut pos = 0u64;
            let mut item_ends = Vec::new();
            for item in &items {
                item_ends.push(pos + item.size());
                pos += item.encoded_len();
            }
            prop_assume!(!item_ends.contains(&(keep as u64)));
            let truncated = &buf[..keep];
            let result = parse_chain(truncated, truncated.len() as u64, ChainContext::Send);
            prop_assert!(matches!(result, Err(BusError::MalformedChain { .. })), "expected MalformedChain, got {:?}", result);
        }
    }
}
