//! Bus configuration.
//!
//! A [`BusConfig`] describes one bus at creation time. Everything in it is
//! fixed for the lifetime of the bus: in particular the bloom size, which
//! every sender and every match rule must agree on.
//!
//! ```toml
//! name = "system"
//! make_flags = "ACCESS_WORLD"
//! bloom_size = 64
//! pool_size = 16777216
//!
//! [limits]
//! max_msg_size = 8388608
//! max_queued = 256
//! ```

use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::message::MESSAGE_HEADER_SIZE;

// ============================================================================
// Defaults
// ============================================================================

/// Default bloom filter size in bytes.
pub const DEFAULT_BLOOM_SIZE: usize = 64;

/// Default per-connection pool capacity.
pub const DEFAULT_POOL_SIZE: u64 = 16 * 1024 * 1024;

/// Default maximum encoded message size.
pub const DEFAULT_MAX_MSG_SIZE: u64 = 8 * 1024 * 1024;

/// Default maximum queued messages per connection.
pub const DEFAULT_MAX_QUEUED: usize = 256;

/// Default maximum owned names per connection.
pub const DEFAULT_MAX_NAMES: usize = 64;

/// Default maximum match rules per connection.
pub const DEFAULT_MAX_MATCHES: usize = 256;

/// Default maximum items per message.
pub const DEFAULT_MAX_ITEMS: usize = 128;

/// Default maximum file descriptors per message.
pub const DEFAULT_MAX_FDS: usize = 253;

/// Default maximum memfd size.
pub const DEFAULT_MAX_MEMFD_SIZE: u64 = 64 * 1024 * 1024;

bitflags! {
    /// Flags given when a bus or endpoint is made.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MakeFlags: u64 {
        /// Members of the creator's group may connect.
        const ACCESS_GROUP = 1 << 0;
        /// Everyone may connect.
        const ACCESS_WORLD = 1 << 1;
        /// Skip policy checks entirely.
        const POLICY_OPEN  = 1 << 2;
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Per-bus resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusLimits {
    /// Maximum encoded message size.
    pub max_msg_size: u64,
    /// Maximum messages waiting in one connection's queue.
    pub max_queued: usize,
    /// Maximum names one connection may own.
    pub max_names: usize,
    /// Maximum match rules per connection.
    pub max_matches: usize,
    /// Maximum items per message.
    pub max_items: usize,
    /// Maximum file descriptors per message.
    pub max_fds: usize,
    /// Maximum memfd size.
    pub max_memfd_size: u64,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_queued: DEFAULT_MAX_QUEUED,
            max_names: DEFAULT_MAX_NAMES,
            max_matches: DEFAULT_MAX_MATCHES,
            max_items: DEFAULT_MAX_ITEMS,
            max_fds: DEFAULT_MAX_FDS,
            max_memfd_size: DEFAULT_MAX_MEMFD_SIZE,
        }
    }
}

impl BusLimits {
    /// Small limits for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_msg_size: 2048,
            max_queued: 16,
            max_names: 8,
            max_matches: 8,
            max_items: 16,
            max_fds: 4,
            max_memfd_size: 4096,
        }
    }
}

// ============================================================================
// Bus Configuration
// ============================================================================

/// Creation parameters of one bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus name, unique within a daemon.
    pub name: String,
    /// Access and policy flags.
    #[serde(default)]
    pub make_flags: MakeFlags,
    /// Opaque flags returned verbatim by hello.
    #[serde(default)]
    pub bus_flags: u64,
    /// Bloom filter size in bytes.
    #[serde(default = "default_bloom_size")]
    pub bloom_size: usize,
    /// Per-connection pool capacity.
    #[serde(default = "default_pool_size")]
    pub pool_size: u64,
    /// Resource limits.
    #[serde(default)]
    pub limits: BusLimits,
}

const fn default_bloom_size() -> usize {
    DEFAULT_BLOOM_SIZE
}

const fn default_pool_size() -> u64 {
    DEFAULT_POOL_SIZE
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::named("bus")
    }
}

impl BusConfig {
    /// Default configuration with the given name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            make_flags: MakeFlags::empty(),
            bus_flags: 0,
            bloom_size: DEFAULT_BLOOM_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            limits: BusLimits::default(),
        }
    }

    /// An open-policy bus with small pools and limits.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            name: "test".to_string(),
            make_flags: MakeFlags::POLICY_OPEN | MakeFlags::ACCESS_WORLD,
            bus_flags: 0,
            bloom_size: 8,
            pool_size: 4096,
            limits: BusLimits::for_testing(),
        }
    }

    /// Returns `true` if policy checks are skipped.
    #[must_use]
    pub const fn policy_open(&self) -> bool {
        self.make_flags.contains(MakeFlags::POLICY_OPEN)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ConfigError::Validation(format!(
                "bus name '{}' must be non-empty [A-Za-z0-9._-]",
                self.name
            )));
        }
        if self.bloom_size == 0 || self.bloom_size % 8 != 0 {
            return Err(ConfigError::Validation(format!(
                "bloom_size {} must be a non-zero multiple of 8",
                self.bloom_size
            )));
        }
        if self.pool_size < MESSAGE_HEADER_SIZE {
            return Err(ConfigError::Validation(format!(
                "pool_size {} cannot hold a message header",
                self.pool_size
            )));
        }
        let limits = &self.limits;
        if limits.max_msg_size < MESSAGE_HEADER_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_msg_size {} cannot hold a message header",
                limits.max_msg_size
            )));
        }
        if limits.max_queued == 0 || limits.max_items == 0 {
            return Err(ConfigError::Validation(
                "max_queued and max_items must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading a configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
