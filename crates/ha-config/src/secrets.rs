//! Values referenced with `!secret` from secrets.yaml

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const SECRETS_FILE: &str = "secrets.yaml";

/// Scalar secrets keyed by name
///
/// Values keep their YAML type so `port: !secret plc_port` still
/// deserializes as a number.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: HashMap<String, Value>,
}

impl Secrets {
    /// Load `secrets.yaml` from the config directory; a missing file is empty
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let path = config_dir.join(SECRETS_FILE);
        if !path.is_file() {
            debug!(path = %path.display(), "No secrets file");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let parsed: Option<HashMap<String, Value>> =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseYaml {
                path: path.clone(),
                source,
            })?;

        let mut values = HashMap::new();
        for (key, value) in parsed.unwrap_or_default() {
            if matches!(value, Value::Mapping(_) | Value::Sequence(_) | Value::Tagged(_)) {
                return Err(ConfigError::InvalidValue {
                    key,
                    reason: "secrets must be scalar values".to_string(),
                });
            }
            values.insert(key, value);
        }

        debug!(path = %path.display(), count = values.len(), "Loaded secrets");
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> ConfigResult<&Value> {
        self.values.get(key).ok_or_else(|| ConfigError::SecretNotFound {
            key: key.to_string(),
        })
    }
}
