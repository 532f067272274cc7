//! Hub registry
//!
//! Owns every configured hub for the lifetime of the process. Built once
//! from configuration, shared as `Arc<HubRegistry>` with services and
//! platforms, and torn down explicitly on shutdown.

use crate::config::HubConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::hub::{Hub, HubState};
use crate::transport::Connector;
use futures::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct HubRegistry {
    /// Hubs keyed by name, in configuration order
    hubs: IndexMap<String, Arc<Hub>>,
}

impl HubRegistry {
    /// Build one hub per config; nothing is connected yet
    pub fn new(configs: Vec<HubConfig>, connector: Arc<dyn Connector>) -> ModbusResult<Self> {
        let mut hubs = IndexMap::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            if hubs.contains_key(&config.name) {
                return Err(ModbusError::config(format!(
                    "duplicate hub name: {}",
                    config.name
                )));
            }
            debug!(hub = %config.name, kind = config.transport.kind(), "Registered hub");
            let name = config.name.clone();
            hubs.insert(name, Arc::new(Hub::new(config, Arc::clone(&connector))));
        }
        Ok(Self { hubs })
    }

    /// Get a hub by name
    pub fn get(&self, name: &str) -> Option<Arc<Hub>> {
        self.hubs.get(name).cloned()
    }

    /// Hub names in configuration order
    pub fn names(&self) -> Vec<String> {
        self.hubs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    /// Connect every hub concurrently
    ///
    /// Returns how many hubs came up. Hubs that failed stay registered and
    /// report `NoTransport` until established again.
    #[instrument(skip(self), fields(hubs = self.hubs.len()))]
    pub async fn setup(&self) -> usize {
        let states = join_all(self.hubs.values().map(|hub| hub.establish())).await;
        let ready = states.iter().filter(|s| **s == HubState::Ready).count();

        if ready < states.len() {
            warn!(ready, total = states.len(), "Some hubs failed to connect");
        } else {
            info!(ready, "All hubs connected");
        }
        ready
    }

    /// Tear every hub down, waiting for in-flight exchanges
    #[instrument(skip(self), fields(hubs = self.hubs.len()))]
    pub async fn shutdown(&self) {
        join_all(self.hubs.values().map(|hub| hub.teardown())).await;
        info!("All hubs closed");
    }
}
