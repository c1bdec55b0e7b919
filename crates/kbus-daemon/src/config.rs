//! Daemon configuration.
//!
//! ```toml
//! [daemon]
//! sweep_interval_ms = 50
//! log_level = "info"
//! owner_uid = 0
//!
//! [[bus]]
//! name = "system"
//! make_flags = "ACCESS_WORLD"
//!
//! [[bus]]
//! name = "user-1000"
//! bloom_size = 32
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kbus_core::{BusConfig, ConfigError, Credentials};
use serde::{Deserialize, Serialize};

/// Default reply sweep period.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 50;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Process-wide settings.
    #[serde(default)]
    pub daemon: DaemonSettings,

    /// Buses created at startup.
    #[serde(default, rename = "bus")]
    pub buses: Vec<BusConfig>,
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Period of the reply-deadline sweep, in milliseconds.
    pub sweep_interval_ms: u64,

    /// Log filter used when no `--log-level` is given.
    pub log_level: String,

    /// Log file used when no `--log-file` is given.
    pub log_file: Option<PathBuf>,

    /// Uid owning the configured buses.
    pub owner_uid: u64,

    /// Gid owning the configured buses.
    pub owner_gid: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            log_level: "info".to_string(),
            log_file: None,
            owner_uid: 0,
            owner_gid: 0,
        }
    }
}

impl DaemonSettings {
    /// Sweep period as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Credentials the configured buses are created with.
    #[must_use]
    pub const fn owner(&self) -> Credentials {
        Credentials::new(self.owner_uid, self.owner_gid)
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, a bus fails validation, two
    /// buses share a name, or the sweep interval is zero.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every bus and the daemon settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.sweep_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "sweep_interval_ms must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for bus in &self.buses {
            bus.validate()?;
            if !seen.insert(bus.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "bus '{}' is configured twice",
                    bus.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use kbus_core::MakeFlags;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert!(config.buses.is_empty());
        assert_eq!(
            config.daemon.sweep_interval(),
            Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS)
        );
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_parse_buses() {
        let config = DaemonConfig::from_toml(
            r#"
            [daemon]
            sweep_interval_ms = 10
            log_file = "/var/log/kbusd.log"
            owner_uid = 1000

            [[bus]]
            name = "system"
            make_flags = "ACCESS_WORLD"

            [[bus]]
            name = "user-1000"
            bloom_size = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.daemon.sweep_interval_ms, 10);
        assert_eq!(
            config.daemon.log_file,
            Some(PathBuf::from("/var/log/kbusd.log"))
        );
        assert_eq!(config.daemon.owner(), Credentials::new(1000, 0));
        assert_eq!(config.buses.len(), 2);
        assert!(config.buses[0].make_flags.contains(MakeFlags::ACCESS_WORLD));
        assert_eq!(config.buses[1].bloom_size, 32);
    }

    #[test]
    fn test_duplicate_bus_rejected() {
        let err = DaemonConfig::from_toml(
            r#"
            [[bus]]
            name = "system"
            [[bus]]
            name = "system"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("twice")));
    }

    #[test]
    fn test_invalid_bus_rejected() {
        assert!(DaemonConfig::from_toml("[[bus]]\nname = \"x\"\nbloom_size = 3").is_err());
        assert!(DaemonConfig::from_toml("[daemon]\nsweep_interval_ms = 0").is_err());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let config = DaemonConfig {
            daemon: DaemonSettings::default(),
            buses: vec![BusConfig::for_testing()],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kbusd.toml");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(DaemonConfig::from_file(&path).unwrap(), config);
    }
}
