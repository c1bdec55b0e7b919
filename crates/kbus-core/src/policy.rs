//! Per-name access control.
//!
//! Each well-known name carries a list of [`PolicyAccess`] entries granting
//! OWN, SEND or RECV to a user, a group, or everyone. Evaluation is
//! default-deny: a name without a matching entry grants nothing.
//!
//! # Precedence
//!
//! The most specific class with a matching entry decides, and lower classes
//! are not consulted:
//!
//! 1. USER entries whose id equals the subject's uid
//! 2. GROUP entries whose id is the subject's primary or supplementary gid
//! 3. WORLD entries
//!
//! Within the deciding class the granted bits are the union of all matching
//! entries. A USER entry without SEND therefore denies SEND even when a WORLD
//! entry grants it.
//!
//! A bus created with the open-policy flag allows everything at this layer;
//! OWN is still subject to the name registry's exclusivity rules.
//!
//! Policy is looked up on every check and never cached by connections, so a
//! `policy-set` takes effect for the very next send or acquire.

use std::fmt;

use bitflags::bitflags;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BusError, BusResult};
use crate::metadata::ProcessMetadata;

// ============================================================================
// Access
// ============================================================================

/// A single action checked against policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Acquire the name.
    Own,
    /// Send to the name's owner.
    Send,
    /// Receive from the name's owner.
    Recv,
}

impl Access {
    /// The permission bit granting this action.
    #[must_use]
    pub const fn bit(self) -> PolicyBits {
        match self {
            Self::Own => PolicyBits::OWN,
            Self::Send => PolicyBits::SEND,
            Self::Recv => PolicyBits::RECV,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Own => f.write_str("own"),
            Self::Send => f.write_str("send"),
            Self::Recv => f.write_str("recv"),
        }
    }
}

bitflags! {
    /// Permission bits of a policy entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PolicyBits: u64 {
        /// May own the name.
        const OWN  = 1 << 0;
        /// May send to the owner.
        const SEND = 1 << 1;
        /// May receive from the owner.
        const RECV = 1 << 2;
    }
}

/// Subject class of a policy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    /// Matches one uid.
    User,
    /// Matches one gid.
    Group,
    /// Matches everyone.
    World,
}

/// One grant in a name's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAccess {
    /// Subject class.
    #[serde(rename = "type")]
    pub kind: AccessType,
    /// uid or gid; ignored for WORLD.
    #[serde(default)]
    pub id: u64,
    /// Granted actions.
    pub bits: PolicyBits,
}

impl PolicyAccess {
    /// Grant for one uid.
    #[must_use]
    pub const fn user(uid: u64, bits: PolicyBits) -> Self {
        Self {
            kind: AccessType::User,
            id: uid,
            bits,
        }
    }

    /// Grant for one gid.
    #[must_use]
    pub const fn group(gid: u64, bits: PolicyBits) -> Self {
        Self {
            kind: AccessType::Group,
            id: gid,
            bits,
        }
    }

    /// Grant for everyone.
    #[must_use]
    pub const fn world(bits: PolicyBits) -> Self {
        Self {
            kind: AccessType::World,
            id: 0,
            bits,
        }
    }

    fn applies_to(&self, subject: &ProcessMetadata) -> bool {
        match self.kind {
            AccessType::User => self.id == subject.creds.uid,
            AccessType::Group => subject.in_group(self.id),
            AccessType::World => true,
        }
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Result of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The action is allowed.
    Allow,
    /// The action is denied.
    Deny,
}

impl PolicyDecision {
    /// Returns `true` if this is an Allow decision.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ============================================================================
// Policy Database
// ============================================================================

/// Bus-wide policy table, sharded per name.
#[derive(Debug, Default)]
pub struct PolicyDb {
    open: bool,
    entries: DashMap<String, Vec<PolicyAccess>>,
}

impl PolicyDb {
    /// Creates an empty database. With `open` set every check allows.
    #[must_use]
    pub fn new(open: bool) -> Self {
        Self {
            open,
            entries: DashMap::new(),
        }
    }

    /// Returns `true` for an open-policy bus.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Replaces the entries of `name`. An empty list removes the name.
    pub fn set(&self, name: &str, entries: Vec<PolicyAccess>) {
        if entries.is_empty() {
            self.entries.remove(name);
        } else {
            self.entries.insert(name.to_string(), entries);
        }
    }

    /// Current entries of `name`.
    #[must_use]
    pub fn entries(&self, name: &str) -> Vec<PolicyAccess> {
        self.entries
            .get(name)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Evaluates `access` on `name` for `subject`.
    #[must_use]
    pub fn authorize(
        &self,
        subject: &ProcessMetadata,
        name: &str,
        access: Access,
    ) -> PolicyDecision {
        if self.open {
            return PolicyDecision::Allow;
        }
        let Some(entries) = self.entries.get(name) else {
            return PolicyDecision::Deny;
        };

        let granted = [AccessType::User, AccessType::Group, AccessType::World]
            .into_iter()
            .find_map(|class| {
                let mut matched = false;
                let mut bits = PolicyBits::empty();
                for entry in entries.iter().filter(|e| e.kind == class) {
                    if entry.applies_to(subject) {
                        matched = true;
                        bits |= entry.bits;
                    }
                }
                matched.then_some(bits)
            })
            .unwrap_or_default();

        if granted.contains(access.bit()) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny
        }
    }

    /// Like [`PolicyDb::authorize`], as a result.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PolicyDenied`] on deny.
    pub fn check(&self, subject: &ProcessMetadata, name: &str, access: Access) -> BusResult<()> {
        if self.authorize(subject, name, access).is_allowed() {
            Ok(())
        } else {
            debug!(uid = subject.creds.uid, name, %access, "policy denied");
            Err(BusError::PolicyDenied {
                name: name.to_string(),
                access,
            })
        }
    }

    /// Returns `true` if `access` is allowed on any of `names`.
    #[must_use]
    pub fn allows_any(&self, subject: &ProcessMetadata, names: &[String], access: Access) -> bool {
        names
            .iter()
            .any(|name| self.authorize(subject, name, access).is_allowed())
    }
}
