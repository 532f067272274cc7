//! Home Assistant Rust Server
//!
//! Loads configuration.yaml, brings up the configured Modbus hubs, exposes
//! the modbus services, and tears everything down on Ctrl-C.

use anyhow::{Context, Result};
use ha_modbus::{parse_hub_configs, register_modbus_services, HubRegistry, LinkConnector, DOMAIN};
use ha_service_registry::ServiceRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_DIR: &str = "config";

/// The running instance: services plus the hubs they drive
pub struct HomeAssistant {
    pub services: Arc<ServiceRegistry>,
    pub modbus: Arc<HubRegistry>,
}

impl HomeAssistant {
    /// Build hubs from the `modbus:` section; nothing is connected yet
    pub fn from_config(config: &ha_config::Value) -> Result<Self> {
        let hub_configs = parse_hub_configs(ha_config::section(config, DOMAIN))
            .context("invalid modbus configuration")?;
        let modbus = Arc::new(
            HubRegistry::new(hub_configs, Arc::new(LinkConnector))
                .context("invalid modbus configuration")?,
        );

        Ok(Self {
            services: Arc::new(ServiceRegistry::new()),
            modbus,
        })
    }

    /// Connect hubs and register services
    pub async fn start(&self) {
        if self.modbus.is_empty() {
            info!("No modbus hubs configured");
            return;
        }

        let ready = self.modbus.setup().await;
        register_modbus_services(&self.services, Arc::clone(&self.modbus));
        info!(ready, hubs = ?self.modbus.names(), "Modbus hubs started");
    }

    pub async fn stop(&self) {
        let removed = self.services.unregister_domain(DOMAIN);
        self.modbus.shutdown().await;
        info!(services = removed, "Modbus stopped");
    }
}

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("HA_CONFIG_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_dir = config_dir();
    info!(config_dir = %config_dir.display(), "Starting Home Assistant (Rust)");

    let config = ha_config::load_configuration(&config_dir)
        .with_context(|| format!("failed to load {}", config_dir.display()))?;
    let hass = HomeAssistant::from_config(&config)?;
    hass.start().await;

    info!("Home Assistant is running");
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", err);
    }

    info!("Shutting down...");
    hass.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_with_unreachable_hub_and_stop() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "plc_port: 1\n").unwrap();
        fs::write(
            dir.path().join(ha_config::CONFIG_FILE),
            r#"
modbus:
  - name: plc
    type: tcp
    host: 127.0.0.1
    port: !secret plc_port
    timeout: 0.5
"#,
        )
        .unwrap();

        let config = ha_config::load_configuration(dir.path()).unwrap();
        let hass = HomeAssistant::from_config(&config).unwrap();
        assert_eq!(hass.modbus.names(), vec!["plc"]);

        hass.start().await;
        assert!(hass.services.has_service(DOMAIN, "write_register"));

        hass.stop().await;
        assert_eq!(hass.services.service_count(), 0);
    }

    #[test]
    fn test_bad_modbus_section() {
        let config: ha_config::Value = serde_yaml::from_str(
            r#"
modbus:
  - type: tcp
    host: a
    port: 1
  - type: udp
    host: b
    port: 2
"#,
        )
        .unwrap();
        let err = HomeAssistant::from_config(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("duplicate hub name: default"));
    }

    #[test]
    fn test_no_modbus_section() {
        let config: ha_config::Value =
            serde_yaml::from_str("homeassistant:\n  name: Home\n").unwrap();
        let hass = HomeAssistant::from_config(&config).unwrap();
        assert!(hass.modbus.is_empty());
    }
}
