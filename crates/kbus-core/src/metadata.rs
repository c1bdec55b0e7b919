//! Sender metadata and attach flags.
//!
//! The process-level facts about a peer (credentials, audit ids, command
//! line, ...) are looked up by the transport when the peer connects and
//! handed to [`crate::Bus::hello`] as a [`ProcessMetadata`] snapshot. The bus
//! never invents metadata: an item is attached to a delivery only if the
//! recipient asked for it in its [`AttachFlags`] and the sender's snapshot
//! actually has it.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::item::Item;

bitflags! {
    /// Metadata a connection wants attached to every message it receives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AttachFlags: u64 {
        /// Send-time monotonic and realtime timestamps.
        const TIMESTAMP = 1 << 0;
        /// Sender uid/gid/pid/tid/starttime.
        const CREDS     = 1 << 1;
        /// Well-known names the sender owns.
        const NAMES     = 1 << 2;
        /// Process and thread command names.
        const COMM      = 1 << 3;
        /// Executable path.
        const EXE       = 1 << 4;
        /// Command line.
        const CMDLINE   = 1 << 5;
        /// Control group path.
        const CGROUP    = 1 << 6;
        /// Capability sets.
        const CAPS      = 1 << 7;
        /// Security label.
        const SECLABEL  = 1 << 8;
        /// Audit session and login uid.
        const AUDIT     = 1 << 9;
    }
}

/// Process credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// User id.
    pub uid: u64,
    /// Primary group id.
    pub gid: u64,
    /// Process id.
    pub pid: u64,
    /// Thread id.
    pub tid: u64,
    /// Start time of `pid`, used to detect pid reuse.
    pub starttime: u64,
}

impl Credentials {
    /// Credentials for the given uid/gid with no process identity.
    #[must_use]
    pub const fn new(uid: u64, gid: u64) -> Self {
        Self {
            uid,
            gid,
            pid: 0,
            tid: 0,
            starttime: 0,
        }
    }

    /// Returns `true` for the superuser.
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Audit identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Audit {
    /// Audit session id.
    pub sessionid: u64,
    /// Login uid.
    pub loginuid: u64,
}

/// Send-time timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamp {
    /// Nanoseconds on the bus's monotonic clock.
    pub monotonic_ns: u64,
    /// Nanoseconds since the Unix epoch.
    pub realtime_ns: u64,
}

/// Everything the transport knows about a connecting process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetadata {
    /// Process credentials.
    pub creds: Credentials,
    /// Supplementary groups, evaluated by GROUP policy entries.
    #[serde(default)]
    pub groups: Vec<u64>,
    /// Process command name.
    #[serde(default)]
    pub pid_comm: Option<String>,
    /// Thread command name.
    #[serde(default)]
    pub tid_comm: Option<String>,
    /// Executable path.
    #[serde(default)]
    pub exe: Option<String>,
    /// Command line arguments.
    #[serde(default)]
    pub cmdline: Option<Vec<String>>,
    /// Control group.
    #[serde(default)]
    pub cgroup: Option<String>,
    /// Capability blob.
    #[serde(default)]
    pub caps: Option<Vec<u8>>,
    /// Security label.
    #[serde(default)]
    pub seclabel: Option<String>,
    /// Audit identity.
    #[serde(default)]
    pub audit: Option<Audit>,
}

impl ProcessMetadata {
    /// Metadata carrying only credentials.
    #[must_use]
    pub fn with_creds(creds: Credentials) -> Self {
        Self {
            creds,
            ..Self::default()
        }
    }

    /// Returns `true` if `gid` is the primary or a supplementary group.
    #[must_use]
    pub fn in_group(&self, gid: u64) -> bool {
        self.creds.gid == gid || self.groups.contains(&gid)
    }

    /// Builds the metadata items requested by `attach`.
    ///
    /// `names` are the sender's currently owned well-known names. Items the
    /// snapshot does not have are skipped.
    #[must_use]
    pub fn attach_items(
        &self,
        attach: AttachFlags,
        names: &[String],
        timestamp: Timestamp,
    ) -> Vec<Item> {
        let mut items = Vec::new();

        if attach.contains(AttachFlags::TIMESTAMP) {
            items.push(Item::Timestamp(timestamp));
        }
        if attach.contains(AttachFlags::CREDS) {
            items.push(Item::Creds(self.creds));
        }
        if attach.contains(AttachFlags::NAMES) && !names.is_empty() {
            items.push(Item::Names(names.to_vec()));
        }
        if attach.contains(AttachFlags::COMM) {
            if let Some(comm) = &self.pid_comm {
                items.push(Item::PidComm(comm.clone()));
            }
            if let Some(comm) = &self.tid_comm {
                items.push(Item::TidComm(comm.clone()));
            }
        }
        if attach.contains(AttachFlags::EXE)
            && let Some(exe) = &self.exe
        {
            items.push(Item::Exe(exe.clone()));
        }
        if attach.contains(AttachFlags::CMDLINE)
            && let Some(cmdline) = &self.cmdline
        {
            items.push(Item::Cmdline(cmdline.clone()));
        }
        if attach.contains(AttachFlags::CGROUP)
            && let Some(cgroup) = &self.cgroup
        {
            items.push(Item::Cgroup(cgroup.clone()));
        }
        if attach.contains(AttachFlags::CAPS)
            && let Some(caps) = &self.caps
        {
            items.push(Item::Caps(Bytes::from(caps.clone())));
        }
        if attach.contains(AttachFlags::SECLABEL)
            && let Some(label) = &self.seclabel
        {
            items.push(Item::Seclabel(label.clone()));
        }
        if attach.contains(AttachFlags::AUDIT)
            && let Some(audit) = self.audit
        {
            items.push(Item::Audit(audit));
        }

        items
    }
}
