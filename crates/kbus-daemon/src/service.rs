//! Multi-bus host.
//!
//! [`BusService`] owns every bus of one daemon, keyed by name. It is shared
//! by reference between the control dispatcher, the reply sweeper and the
//! signal handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use kbus_core::{Bus, BusConfig, Credentials, ReplySweep};
use tracing::info;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

/// Every bus hosted by the daemon.
#[derive(Debug, Default)]
pub struct BusService {
    buses: RwLock<HashMap<String, Arc<Bus>>>,
    shutdown: Arc<AtomicBool>,
}

impl BusService {
    /// An empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the buses listed in `config`, owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns the first bus creation failure.
    pub fn from_config(config: &DaemonConfig, owner: Credentials) -> DaemonResult<Self> {
        let service = Self::new();
        for bus in &config.buses {
            service.create_bus(bus.clone(), owner)?;
        }
        Ok(service)
    }

    /// Creates and hosts a bus.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::BusExists`] for a taken name, or the bus's own
    /// validation error.
    pub fn create_bus(&self, config: BusConfig, owner: Credentials) -> DaemonResult<Arc<Bus>> {
        let mut buses = self.buses.write().expect("lock poisoned");
        if buses.contains_key(&config.name) {
            return Err(DaemonError::BusExists { name: config.name });
        }
        let name = config.name.clone();
        let bus = Arc::new(Bus::create(config, owner)?);
        buses.insert(name, Arc::clone(&bus));
        Ok(bus)
    }

    /// Looks up a hosted bus.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::UnknownBus`] if no bus has that name.
    pub fn bus(&self, name: &str) -> DaemonResult<Arc<Bus>> {
        self.buses
            .read()
            .expect("lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::UnknownBus {
                name: name.to_string(),
            })
    }

    /// Names of hosted buses, sorted.
    #[must_use]
    pub fn bus_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buses
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Flag observed by background tasks.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(buses = self.bus_names().len(), "shutdown requested");
        }
    }
}

impl ReplySweep for BusService {
    fn sweep_expired(&self) -> usize {
        let buses: Vec<Arc<Bus>> = self
            .buses
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect();
        buses.iter().map(|bus| bus.sweep_expired_replies()).sum()
    }
}
