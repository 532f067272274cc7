//! YAML configuration loading for Home Assistant
//!
//! Supports the custom tags integrations rely on:
//!
//! - `!include path` - Include another YAML file, relative to the including one
//! - `!secret key` - Substitute from secrets.yaml, keeping the value's type
//! - `!env_var VAR [default]` - Environment variable substitution
//!
//! ```ignore
//! let config = ha_config::load_configuration("/config")?;
//! let hubs = ha_config::section(&config, "modbus");
//! ```

mod error;
mod loader;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_configuration, section, YamlLoader, CONFIG_FILE};
pub use secrets::{Secrets, SECRETS_FILE};

pub use serde_yaml::Value;
