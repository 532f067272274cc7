//! configuration.yaml loading with `!include`, `!secret` and `!env_var`

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Main configuration file inside the config directory
pub const CONFIG_FILE: &str = "configuration.yaml";

pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being loaded, outermost first
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    /// Loader rooted at `config_dir`, with secrets.yaml read from there
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            include_stack: Vec::new(),
        }
    }

    /// Load a file relative to the config directory and resolve its tags
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        self.load_path(path)
    }

    /// Parse YAML text as if it were the file `source`
    pub fn load_str(&mut self, content: &str, source: &Path) -> ConfigResult<Value> {
        let raw: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source.to_path_buf(),
            source: e,
        })?;
        self.resolve(raw, source)
    }

    fn load_path(&mut self, path: PathBuf) -> ConfigResult<Value> {
        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        debug!(path = %path.display(), "Loading YAML");

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::ReadFile {
            path: path.clone(),
            source: e,
        })?;

        self.include_stack.push(path.clone());
        let result = self.load_str(&content, &path);
        self.include_stack.pop();
        result
    }

    fn resolve(&mut self, value: Value, source: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tag(*tagged, source),
            Value::Mapping(map) => {
                let mut resolved = Mapping::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key, self.resolve(value, source)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|item| self.resolve(item, source))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            scalar => Ok(scalar),
        }
    }

    fn resolve_tag(&mut self, tagged: TaggedValue, source: &Path) -> ConfigResult<Value> {
        let TaggedValue { tag, value } = tagged;
        trace!(tag = %tag, "Resolving tag");

        if tag == "include" {
            let target = self.include_target(&value, source)?;
            if !target.is_file() {
                return Err(ConfigError::IncludeNotFound { path: target });
            }
            self.load_path(target)
        } else if tag == "secret" {
            let key = tag_argument("!secret", &value)?;
            let secret = self.secrets.get(key)?.clone();
            debug!(key, "Substituted secret");
            Ok(secret)
        } else if tag == "env_var" {
            resolve_env_var(tag_argument("!env_var", &value)?)
        } else {
            warn!(tag = %tag, source = %source.display(), "Unknown YAML tag left in place");
            let value = self.resolve(value, source)?;
            Ok(Value::Tagged(Box::new(TaggedValue { tag, value })))
        }
    }

    /// Include paths are relative to the including file
    fn include_target(&self, value: &Value, source: &Path) -> ConfigResult<PathBuf> {
        let relative = tag_argument("!include", value)?;
        let base = source.parent().unwrap_or(&self.config_dir);
        Ok(base.join(relative))
    }
}

fn tag_argument<'a>(tag: &str, value: &'a Value) -> ConfigResult<&'a str> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: format!("expected a name, got {:?}", value),
        })
}

/// `!env_var NAME [default]`; the value is read as a YAML scalar
fn resolve_env_var(argument: &str) -> ConfigResult<Value> {
    let (name, default) = match argument.split_once(char::is_whitespace) {
        Some((name, default)) => (name, Some(default.trim())),
        None => (argument, None),
    };

    let raw = match (std::env::var(name), default) {
        (Ok(value), _) => value,
        (Err(_), Some(default)) => default.to_string(),
        (Err(_), None) => {
            return Err(ConfigError::EnvVarNotFound {
                var: name.to_string(),
            })
        }
    };
    debug!(var = name, "Substituted environment variable");

    match serde_yaml::from_str::<Value>(&raw) {
        Ok(scalar @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => Ok(scalar),
        _ => Ok(Value::String(raw)),
    }
}

/// Load `configuration.yaml` from a config directory
pub fn load_configuration(config_dir: impl Into<PathBuf>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(CONFIG_FILE)
}

/// Top-level section of a loaded configuration; `Null` when absent
pub fn section<'a>(config: &'a Value, key: &str) -> &'a Value {
    static ABSENT: Value = Value::Null;
    config.get(key).unwrap_or(&ABSENT)
}
