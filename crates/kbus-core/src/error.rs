//! Error types for bus operations.
//!
//! Every control operation returns a [`BusResult`]. Variants are structured
//! so callers can branch on the failure class without string matching:
//!
//! - **Codec errors** ([`BusError::MalformedChain`],
//!   [`BusError::ForbiddenItemType`]): always the caller's fault. The
//!   operation is rejected and the connection is left untouched.
//! - **Authorization** ([`BusError::PolicyDenied`],
//!   [`BusError::PermissionDenied`]): rejected with no state change.
//! - **Registry errors** ([`BusError::NameConflict`],
//!   [`BusError::NameNotFound`], [`BusError::AlreadyQueued`], ...): name
//!   ownership changes are atomic, so these never leave partial mutations.
//! - **Resource errors** ([`BusError::PoolExhausted`],
//!   [`BusError::InvalidHandle`], [`BusError::SealedReadOnly`], ...): local to
//!   one connection and never fatal to others.
//! - **Routing errors** ([`BusError::ConnectionNotFound`]): a stale
//!   destination; the sender is told, nothing else changes.

use thiserror::Error;

use crate::policy::Access;

/// Errors returned by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// An item chain or message header could not be parsed.
    #[error("malformed item chain: {reason}")]
    MalformedChain {
        /// What was wrong with the chain.
        reason: String,
    },

    /// An item type was supplied that the caller is not allowed to send.
    #[error("item type {item_type:#x} is not allowed here")]
    ForbiddenItemType {
        /// The raw item type.
        item_type: u64,
    },

    /// The policy database denied the action.
    #[error("policy denies {access} on '{name}'")]
    PolicyDenied {
        /// The bus name the check was evaluated against.
        name: String,
        /// The denied action.
        access: Access,
    },

    /// The caller lacks the privilege for a control operation.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Which privilege was missing.
        reason: String,
    },

    /// The name is owned and may not be taken over.
    #[error("name '{name}' is owned by another connection")]
    NameConflict {
        /// The contested name.
        name: String,
    },

    /// The name has no owner (and no usable activator).
    #[error("name '{name}' not found")]
    NameNotFound {
        /// The name that failed to resolve.
        name: String,
    },

    /// The caller is already waiting in the name's queue.
    #[error("already queued for name '{name}'")]
    AlreadyQueued {
        /// The name.
        name: String,
    },

    /// The caller already is the primary owner.
    #[error("already the owner of name '{name}'")]
    AlreadyOwner {
        /// The name.
        name: String,
    },

    /// The caller neither owns nor waits for the name.
    #[error("name '{name}' is not owned by the caller")]
    NameNotOwned {
        /// The name.
        name: String,
    },

    /// The string is not a valid well-known name.
    #[error("invalid bus name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The connection's pool has no contiguous region large enough.
    #[error("pool exhausted: {requested} bytes requested, {available} bytes free")]
    PoolExhausted {
        /// Bytes requested.
        requested: u64,
        /// Total free bytes left in the pool (possibly fragmented).
        available: u64,
    },

    /// A pool offset or memfd handle does not refer to a live object.
    #[error("invalid handle {handle:#x}")]
    InvalidHandle {
        /// The stale handle.
        handle: u64,
    },

    /// The memfd is sealed and can no longer change.
    #[error("memfd {handle} is sealed")]
    SealedReadOnly {
        /// The sealed memfd.
        handle: u64,
    },

    /// A memfd was attached to a message before being sealed.
    #[error("memfd {handle} must be sealed before it is sent")]
    MemfdNotSealed {
        /// The unsealed memfd.
        handle: u64,
    },

    /// The addressed connection does not exist (any more).
    #[error("connection {id} not found")]
    ConnectionNotFound {
        /// The stale id.
        id: u64,
    },

    /// The calling connection has been disconnected.
    #[error("connection {id} is disconnected")]
    Disconnected {
        /// The disconnected id.
        id: u64,
    },

    /// Bloom data does not have the bus-wide bloom size.
    #[error("bloom size mismatch: got {actual} bytes, bus uses {expected} bytes")]
    BloomSizeMismatch {
        /// Size attached by the caller.
        actual: usize,
        /// Bus-wide bloom size.
        expected: usize,
    },

    /// File descriptors were sent to a connection that does not accept them.
    #[error("connection {id} does not accept file descriptors")]
    FdsNotAccepted {
        /// The recipient.
        id: u64,
    },

    /// The message exceeds the bus message size limit.
    #[error("message too large: {size} bytes exceeds maximum {max} bytes")]
    MessageTooLarge {
        /// Encoded size.
        size: u64,
        /// Limit.
        max: u64,
    },

    /// The recipient's queue is at its message limit.
    #[error("queue of connection {id} is full ({max} messages)")]
    QueueFull {
        /// The recipient.
        id: u64,
        /// Queue limit.
        max: usize,
    },

    /// The connection holds the maximum number of names.
    #[error("connection owns too many names (maximum {max})")]
    TooManyNames {
        /// Limit.
        max: usize,
    },

    /// The connection has the maximum number of match rules.
    #[error("too many match rules (maximum {max})")]
    TooManyMatches {
        /// Limit.
        max: usize,
    },

    /// A request argument is out of range or inconsistent.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong.
        reason: String,
    },
}

impl BusError {
    /// Create a malformed chain error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedChain {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error.
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a permission denied error.
    #[must_use]
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the request itself was invalid.
    ///
    /// These errors would fail again if retried unchanged.
    #[must_use]
    pub const fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Self::MalformedChain { .. }
                | Self::ForbiddenItemType { .. }
                | Self::InvalidName { .. }
                | Self::InvalidArgument { .. }
                | Self::BloomSizeMismatch { .. }
                | Self::MemfdNotSealed { .. }
                | Self::MessageTooLarge { .. }
        )
    }

    /// Returns `true` for failures scoped to one connection's resources.
    ///
    /// Resource errors may clear up once the recipient drains its queue or
    /// frees pool space.
    #[must_use]
    pub const fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. }
                | Self::InvalidHandle { .. }
                | Self::SealedReadOnly { .. }
                | Self::QueueFull { .. }
                | Self::TooManyNames { .. }
                | Self::TooManyMatches { .. }
        )
    }

    /// Stable identifier of the variant, for control-surface replies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedChain { .. } => "malformed_chain",
            Self::ForbiddenItemType { .. } => "forbidden_item_type",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::NameConflict { .. } => "name_conflict",
            Self::NameNotFound { .. } => "name_not_found",
            Self::AlreadyQueued { .. } => "already_queued",
            Self::AlreadyOwner { .. } => "already_owner",
            Self::NameNotOwned { .. } => "name_not_owned",
            Self::InvalidName { .. } => "invalid_name",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::InvalidHandle { .. } => "invalid_handle",
            Self::SealedReadOnly { .. } => "sealed_read_only",
            Self::MemfdNotSealed { .. } => "memfd_not_sealed",
            Self::ConnectionNotFound { .. } => "connection_not_found",
            Self::Disconnected { .. } => "disconnected",
            Self::BloomSizeMismatch { .. } => "bloom_size_mismatch",
            Self::FdsNotAccepted { .. } => "fds_not_accepted",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::QueueFull { .. } => "queue_full",
            Self::TooManyNames { .. } => "too_many_names",
            Self::TooManyMatches { .. } => "too_many_matches",
            Self::InvalidArgument { .. } => "invalid_argument",
        }
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;
