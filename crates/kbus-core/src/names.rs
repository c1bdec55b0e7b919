//! Well-known name registry.
//!
//! A name has at most one primary owner, an ordered queue of claimants
//! waiting for it, and optionally an activator: a starter connection that
//! receives messages for the name while nobody owns it.
//!
//! Every mutation of one name happens under that name's shard lock, so
//! acquisitions and releases of unrelated names never serialize and no
//! observer ever sees two owners of one name. Mutations return the
//! [`Notification`]s describing them; the caller delivers those only after
//! the mutation has returned, i.e. after it is committed.
//!
//! # Ownership transfer
//!
//! - Acquiring an unowned name grants it (`NAME_ADD`).
//! - `REPLACE_EXISTING` takes a name from an owner that set
//!   `ALLOW_REPLACEMENT` (`NAME_CHANGE`). The displaced owner moves to the
//!   back of the queue if it had asked to queue, and loses the name
//!   otherwise.
//! - Otherwise `QUEUE` appends the caller to the FIFO queue.
//! - Releasing promotes the queue head (`NAME_CHANGE`) or vacates the name
//!   (`NAME_REMOVE`). Leaving the queue is silent.

use std::collections::{BTreeSet, VecDeque};

use bitflags::bitflags;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BusError, BusResult};
use crate::item::NameChange;
use crate::message::Notification;

/// Longest accepted well-known name.
pub const MAX_NAME_LEN: usize = 255;

bitflags! {
    /// Name acquisition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct NameFlags: u64 {
        /// Take the name from an owner that allows replacement.
        const REPLACE_EXISTING  = 1 << 0;
        /// Wait in the queue if the name cannot be taken now.
        const QUEUE             = 1 << 1;
        /// Let later callers take the name with `REPLACE_EXISTING`.
        const ALLOW_REPLACEMENT = 1 << 2;
        /// Reported for queued claimants.
        const IN_QUEUE          = 1 << 16;
    }
}

bitflags! {
    /// What `name-list` enumerates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ListFlags: u64 {
        /// One entry per live connection.
        const UNIQUE   = 1 << 0;
        /// Owned well-known names.
        const NAMES    = 1 << 1;
        /// Activator registrations.
        const STARTERS = 1 << 2;
        /// Queued claimants.
        const QUEUED   = 1 << 3;
    }
}

/// A connection holding or waiting for a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameOwner {
    /// Connection id.
    pub id: u64,
    /// Flags from its acquire call.
    pub flags: NameFlags,
}

#[derive(Debug, Default)]
struct NameEntry {
    owner: Option<NameOwner>,
    activator: Option<u64>,
    queue: VecDeque<NameOwner>,
}

impl NameEntry {
    fn is_vacant(&self) -> bool {
        self.owner.is_none() && self.activator.is_none() && self.queue.is_empty()
    }

    fn dequeue(&mut self, id: u64) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.id != id);
        self.queue.len() != before
    }
}

/// Result status of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireStatus {
    /// The caller is now the primary owner.
    Owned,
    /// The caller waits in the queue.
    Queued,
}

/// Committed effects of an acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Owned or queued.
    pub status: AcquireStatus,
    /// Notifications to deliver.
    pub events: Vec<Notification>,
    /// Activator whose pending messages for this name now belong to the new
    /// owner.
    pub handover_from: Option<u64>,
}

/// Where messages for a name go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The primary owner.
    Owner(u64),
    /// No owner; the activator stands in.
    Activator(u64),
}

/// One `name-list` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameListEntry {
    /// Connection id.
    pub id: u64,
    /// Well-known name; `None` for unique-id entries.
    pub name: Option<String>,
    /// Acquire flags, plus `IN_QUEUE` for claimants.
    pub flags: NameFlags,
    /// `true` for activator registrations.
    pub activator: bool,
}

/// Checks that `name` is a valid well-known name.
///
/// Two or more dot-separated elements of `[A-Za-z_-][A-Za-z0-9_-]*`, at most
/// [`MAX_NAME_LEN`] bytes. Unique names (`:1.42`) are not acquirable.
///
/// # Errors
///
/// Returns [`BusError::InvalidName`] describing the first violation.
pub fn validate_name(name: &str) -> BusResult<()> {
    let invalid = |reason| BusError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("longer than 255 bytes"));
    }
    if name.starts_with(':') {
        return Err(invalid("unique names cannot be acquired"));
    }
    let mut elements = 0;
    for element in name.split('.') {
        let mut chars = element.chars();
        let Some(first) = chars.next() else {
            return Err(invalid("empty element"));
        };
        if !(first.is_ascii_alphabetic() || first == '_' || first == '-') {
            return Err(invalid("element starts with an invalid character"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid("invalid character"));
        }
        elements += 1;
    }
    if elements < 2 {
        return Err(invalid("needs at least two elements"));
    }
    Ok(())
}

/// The bus-wide name table.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: DashMap<String, NameEntry>,
    /// Reverse index: connection -> names it primarily owns.
    owned: DashMap<u64, BTreeSet<String>>,
}

impl NameRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `name` for connection `id`.
    ///
    /// # Errors
    ///
    /// - [`BusError::InvalidName`] for a malformed name
    /// - [`BusError::AlreadyOwner`] if `id` already owns it
    /// - [`BusError::AlreadyQueued`] if `id` already waits for it
    /// - [`BusError::NameConflict`] if it is owned and neither replacement nor
    ///   queueing applies
    pub fn acquire(&self, id: u64, name: &str, flags: NameFlags) -> BusResult<Acquired> {
        validate_name(name)?;
        let flags = flags - NameFlags::IN_QUEUE;
        let mut entry = self.names.entry(name.to_string()).or_default();
        let claimant = NameOwner { id, flags };

        let Some(current) = entry.owner else {
            entry.owner = Some(claimant);
            let handover_from = entry.activator.filter(|&a| a != id);
            self.index_add(id, name);
            debug!(conn_id = id, name, "name acquired");
            return Ok(Acquired {
                status: AcquireStatus::Owned,
                events: vec![Notification::NameAdd(NameChange {
                    old_id: 0,
                    new_id: id,
                    flags: flags.bits(),
                    name: name.to_string(),
                })],
                handover_from,
            });
        };

        if current.id == id {
            return Err(BusError::AlreadyOwner {
                name: name.to_string(),
            });
        }

        if flags.contains(NameFlags::REPLACE_EXISTING)
            && current.flags.contains(NameFlags::ALLOW_REPLACEMENT)
        {
            entry.dequeue(id);
            entry.owner = Some(claimant);
            if current.flags.contains(NameFlags::QUEUE) {
                entry.queue.push_back(current);
            }
            self.index_remove(current.id, name);
            self.index_add(id, name);
            debug!(conn_id = id, old_id = current.id, name, "name replaced");
            return Ok(Acquired {
                status: AcquireStatus::Owned,
                events: vec![Notification::NameChange(NameChange {
                    old_id: current.id,
                    new_id: id,
                    flags: flags.bits(),
                    name: name.to_string(),
                })],
                handover_from: None,
            });
        }

        if entry.queue.iter().any(|q| q.id == id) {
            return Err(BusError::AlreadyQueued {
                name: name.to_string(),
            });
        }

        if flags.contains(NameFlags::QUEUE) {
            entry.queue.push_back(claimant);
            debug!(conn_id = id, name, position = entry.queue.len(), "name queued");
            return Ok(Acquired {
                status: AcquireStatus::Queued,
                events: Vec::new(),
                handover_from: None,
            });
        }

        Err(BusError::NameConflict {
            name: name.to_string(),
        })
    }

    /// Releases `name` held or awaited by `id`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NameNotFound`] for an unknown name and
    /// [`BusError::NameNotOwned`] if `id` neither owns nor waits for it.
    pub fn release(&self, id: u64, name: &str) -> BusResult<Vec<Notification>> {
        let events = {
            let mut entry = self
                .names
                .get_mut(name)
                .ok_or_else(|| BusError::NameNotFound {
                    name: name.to_string(),
                })?;
            if entry.owner.is_some_and(|o| o.id == id) {
                self.vacate_owner(&mut entry, name)
            } else if entry.dequeue(id) {
                Vec::new()
            } else {
                return Err(BusError::NameNotOwned {
                    name: name.to_string(),
                });
            }
        };
        self.names.remove_if(name, |_, e| e.is_vacant());
        Ok(events)
    }

    /// Registers `id` as the activator of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidName`] for a malformed name and
    /// [`BusError::NameConflict`] if another activator is registered.
    pub fn register_activator(&self, id: u64, name: &str) -> BusResult<()> {
        validate_name(name)?;
        let mut entry = self.names.entry(name.to_string()).or_default();
        match entry.activator {
            Some(other) if other != id => Err(BusError::NameConflict {
                name: name.to_string(),
            }),
            _ => {
                entry.activator = Some(id);
                Ok(())
            },
        }
    }

    /// Drops everything `id` holds: ownerships, queue slots, activations.
    ///
    /// Returns the notifications for names that changed owner.
    pub fn remove_connection(&self, id: u64) -> Vec<Notification> {
        let touched: Vec<String> = self
            .names
            .iter()
            .filter(|e| {
                e.owner.is_some_and(|o| o.id == id)
                    || e.activator == Some(id)
                    || e.queue.iter().any(|q| q.id == id)
            })
            .map(|e| e.key().clone())
            .collect();

        let mut events = Vec::new();
        for name in touched {
            if let Some(mut entry) = self.names.get_mut(&name) {
                if entry.activator == Some(id) {
                    entry.activator = None;
                }
                entry.dequeue(id);
                if entry.owner.is_some_and(|o| o.id == id) {
                    events.extend(self.vacate_owner(&mut entry, &name));
                }
            }
            self.names.remove_if(&name, |_, e| e.is_vacant());
        }
        self.owned.remove(&id);
        events
    }

    /// Where a message for `name` should go.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Resolution> {
        let entry = self.names.get(name)?;
        entry
            .owner
            .map(|o| Resolution::Owner(o.id))
            .or_else(|| entry.activator.map(Resolution::Activator))
    }

    /// Primary owner of `name`.
    #[must_use]
    pub fn owner_of(&self, name: &str) -> Option<u64> {
        self.names.get(name).and_then(|e| e.owner.map(|o| o.id))
    }

    /// Names primarily owned by `id`, sorted.
    #[must_use]
    pub fn names_of(&self, id: u64) -> Vec<String> {
        self.owned
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names for which `id` is the activator, sorted.
    #[must_use]
    pub fn activated_by(&self, id: u64) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .iter()
            .filter(|e| e.activator == Some(id))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Lists owners, activators and claimants as selected by `flags`.
    ///
    /// [`ListFlags::UNIQUE`] is answered by the bus, which knows the live
    /// connections; it is ignored here.
    #[must_use]
    pub fn list(&self, flags: ListFlags) -> Vec<NameListEntry> {
        let mut out = Vec::new();
        for entry in &self.names {
            let name = entry.key();
            if flags.contains(ListFlags::NAMES)
                && let Some(owner) = entry.owner
            {
                out.push(NameListEntry {
                    id: owner.id,
                    name: Some(name.clone()),
                    flags: owner.flags,
                    activator: false,
                });
            }
            if flags.contains(ListFlags::STARTERS)
                && let Some(activator) = entry.activator
            {
                out.push(NameListEntry {
                    id: activator,
                    name: Some(name.clone()),
                    flags: NameFlags::empty(),
                    activator: true,
                });
            }
            if flags.contains(ListFlags::QUEUED) {
                out.extend(entry.queue.iter().map(|q| NameListEntry {
                    id: q.id,
                    name: Some(name.clone()),
                    flags: q.flags | NameFlags::IN_QUEUE,
                    activator: false,
                }));
            }
        }
        // Stable: keeps owner, activator, queue order within a name.
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Number of names with an owner, activator or claimant.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if no name is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Removes the owner and promotes the queue head. Caller holds the entry.
    fn vacate_owner(&self, entry: &mut NameEntry, name: &str) -> Vec<Notification> {
        let Some(old) = entry.owner.take() else {
            return Vec::new();
        };
        self.index_remove(old.id, name);

        if let Some(next) = entry.queue.pop_front() {
            entry.owner = Some(next);
            self.index_add(next.id, name);
            debug!(old_id = old.id, new_id = next.id, name, "queued claimant promoted");
            vec![Notification::NameChange(NameChange {
                old_id: old.id,
                new_id: next.id,
                flags: next.flags.bits(),
                name: name.to_string(),
            })]
        } else {
            debug!(old_id = old.id, name, "name vacated");
            vec![Notification::NameRemove(NameChange {
                old_id: old.id,
                new_id: 0,
                flags: old.flags.bits(),
                name: name.to_string(),
            })]
        }
    }

    fn index_add(&self, id: u64, name: &str) {
        self.owned.entry(id).or_default().insert(name.to_string());
    }

    fn index_remove(&self, id: u64, name: &str) {
        if let Some(mut set) = self.owned.get_mut(&id) {
            set.remove(name);
        }
        self.owned.remove_if(&id, |_, set| set.is_empty());
    }
}
