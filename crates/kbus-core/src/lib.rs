//! # kbus-core
//!
//! Broker logic for a kernel-mediated message bus.
//!
//! A [`Bus`] accepts connections, assigns them ids, keeps a registry of
//! well-known names and routes messages between connections. Messages are
//! copied into the recipient's [`pool::Pool`] and read back by offset.
//!
//! - Unicast to a unique id or a well-known name
//! - Broadcast filtered by per-connection [`MatchRule`]s and bloom filters
//! - Name ownership with FIFO queueing, replacement and activators
//! - Per-name access control ([`policy`])
//! - Reply correlation with timeout and dead-peer notifications
//! - Sealed memfds for large payloads
//!
//! The transport that exposes these operations to processes is not part of
//! this crate. It supplies a [`ProcessMetadata`] snapshot at hello and calls
//! the [`Bus`] methods on behalf of its callers.
//!
//! ## Example
//!
//! ```rust
//! use kbus_core::{
//!     Bus, BusConfig, Credentials, Envelope, Hello, Message, NameFlags, ProcessMetadata,
//! };
//!
//! let bus = Bus::create(BusConfig::for_testing(), Credentials::new(0, 0)).unwrap();
//! let meta = ProcessMetadata::with_creds(Credentials::new(1000, 1000));
//!
//! let service = bus.hello("bus", meta.clone(), Hello::default()).unwrap().id;
//! let client = bus.hello("bus", meta, Hello::default()).unwrap().id;
//! bus.name_acquire(service, "org.example.Echo", NameFlags::empty())
//!     .unwrap();
//!
//! bus.send(
//!     client,
//!     Message::to_name("org.example.Echo", 1).with_payload(&b"ping"[..]),
//! )
//! .unwrap();
//!
//! let received = bus.receive(service).unwrap().unwrap();
//! let Envelope::User(msg) = bus.read_message(service, received.offset).unwrap() else {
//!     unreachable!()
//! };
//! assert_eq!(msg.src_id, client);
//! assert_eq!(&bus.read_payload(service, received.offset).unwrap()[..], b"ping");
//! bus.free(service, received.offset).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bloom;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod item;
pub mod matcher;
pub mod memfd;
pub mod message;
pub mod metadata;
pub mod names;
pub mod policy;
pub mod pool;
pub mod sweeper;

pub use bloom::BloomFilter;
pub use bus::{
    Bus, ConnectionInfo, DEFAULT_ENDPOINT, Endpoint, Hello, HelloReply, NameQuery,
};
pub use config::{BusConfig, BusLimits, ConfigError, MakeFlags};
pub use connection::{ConnFlags, Received};
pub use error::{BusError, BusResult};
pub use item::{ChainContext, IdChange, Item, NameChange};
pub use matcher::{MATCH_ID_ANY, MATCH_SRC_ID_ANY, MatchItem, MatchRule};
pub use message::{
    DST_ID_BROADCAST, DST_ID_NAME, Envelope, Message, MessageFlags, Notification, Reply,
};
pub use metadata::{AttachFlags, Credentials, ProcessMetadata, Timestamp};
pub use names::{AcquireStatus, ListFlags, NameFlags, NameListEntry};
pub use policy::{Access, AccessType, PolicyAccess, PolicyBits};
pub use sweeper::{ReplySweep, spawn_reply_sweeper};
