/*!
# Connection List Module

Process-wide registry of transport adapters. Adapters are constructed at
list creation, each guarded so one adapter failing to come up does not
block the rest. Per-adapter settings are loaded from the XML settings file
when the list is built and written back when it is dropped.
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::settings::{self, ConnectionConfig};
use crate::system::System;
use crate::transport::enet::EnetManager;
use crate::transport::serial::SerialManager;
use crate::transport::ConnectionManager;

/// The registry of transport adapters available in this process.
pub struct ConnectionList {
    adapters: Vec<Arc<dyn ConnectionManager>>,
    configs: Mutex<HashMap<String, ConnectionConfig>>,
}

impl ConnectionList {
    /// Builds the adapter registry, bootstraps logging and applies any
    /// persisted per-adapter settings.
    pub fn new() -> ConnectionList {
        settings::init_logging();

        let mut configs = match settings::load_settings(&settings::settings_path()) {
            Ok(configs) => configs,
            Err(e) => {
                error!("could not load connection settings: {e}");
                HashMap::new()
            }
        };

        type AdapterCtor = fn() -> Arc<dyn ConnectionManager>;
        let ctors: [(&str, AdapterCtor); 2] = [
            ("CM_USBLITE", || SerialManager::create() as Arc<dyn ConnectionManager>),
            ("CM_ETH", || EnetManager::create() as Arc<dyn ConnectionManager>),
        ];

        let mut adapters: Vec<Arc<dyn ConnectionManager>> = Vec::new();
        for (ident, ctor) in ctors {
            match std::panic::catch_unwind(ctor) {
                Ok(adapter) => {
                    match configs.get(adapter.ident()) {
                        Some(config) => adapter.set_timeouts(config.timeouts()),
                        None => {
                            configs.insert(
                                adapter.ident().to_string(),
                                ConnectionConfig::from_timeouts(adapter.timeouts(), true),
                            );
                        }
                    }
                    adapters.push(adapter);
                }
                Err(_) => error!("adapter {ident} failed to initialise"),
            }
        }

        ConnectionList {
            adapters,
            configs: Mutex::new(configs),
        }
    }

    /// Idents of the adapters that came up.
    pub fn modules(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.ident()).collect()
    }

    pub fn adapter(&self, ident: &str) -> Option<Arc<dyn ConnectionManager>> {
        self.adapters.iter().find(|a| a.ident() == ident).cloned()
    }

    /// The persisted configuration for one adapter.
    pub fn config(&self, ident: &str) -> ConnectionConfig {
        self.configs
            .lock()
            .unwrap()
            .get(ident)
            .copied()
            .unwrap_or_default()
    }

    /// Updates one adapter's configuration, applying the timeouts
    /// immediately and persisting them on drop.
    pub fn set_config(&self, ident: &str, config: ConnectionConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(ident.to_string(), config);
        if let Some(adapter) = self.adapter(ident) {
            adapter.set_timeouts(config.timeouts());
        }
    }

    /// Discovers devices on every adapter whose configuration enables
    /// scanning.
    pub fn scan(&self) -> Vec<Arc<System>> {
        let mut found = Vec::new();
        for adapter in &self.adapters {
            if !self.config(adapter.ident()).scan {
                info!("scan({}) disabled", adapter.ident());
                continue;
            }
            info!("scan({}) start", adapter.ident());
            let systems = adapter.discover(&[]);
            info!("scan({}) finish: found {}", adapter.ident(), systems.len());
            found.extend(systems);
        }
        found
    }

    /// Discovers devices on a single adapter, regardless of its scan flag.
    pub fn scan_module(&self, ident: &str, port_mask: &[String]) -> Vec<Arc<System>> {
        match self.adapter(ident) {
            Some(adapter) => adapter.discover(port_mask),
            None => Vec::new(),
        }
    }
}

impl Drop for ConnectionList {
    fn drop(&mut self) {
        let configs = self.configs.lock().unwrap();
        if let Err(e) = settings::save_settings(&settings::settings_path(), &configs) {
            error!("could not persist connection settings: {e}");
        }
    }
}

impl Default for ConnectionList {
    fn default() -> Self {
        ConnectionList::new()
    }
}
