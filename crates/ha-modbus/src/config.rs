//! Hub configuration from the `modbus:` section of configuration.yaml
//!
//! ```yaml
//! modbus:
//!   - name: boiler
//!     type: tcp
//!     host: 192.168.1.20
//!     port: 502
//!     delay: 2
//!   - name: meters
//!     type: serial
//!     method: rtu
//!     port: /dev/ttyUSB0
//!     baudrate: 9600
//!     bytesize: 8
//!     parity: N
//!     stopbits: 1
//! ```

use crate::error::{ModbusError, ModbusResult};
use crate::DEFAULT_HUB;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const HUB_KEYS: &[&str] = &["name", "type", "timeout"];
const NETWORK_KEYS: &[&str] = &["host", "port", "delay"];
const SERIAL_KEYS: &[&str] = &["port", "baudrate", "bytesize", "parity", "stopbits", "method"];

/// Configuration of one hub
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HubConfig {
    /// Unique hub name, referenced by platforms and services
    #[serde(default = "default_name")]
    pub name: String,

    /// Upper bound for one request/response exchange
    #[serde(default = "default_timeout", deserialize_with = "fractional_seconds")]
    pub timeout: Duration,

    /// Link kind and its addressing
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// Link kind, selected by the `type` key
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Serial(SerialConfig),
    Tcp(NetworkConfig),
    Udp(NetworkConfig),
    #[serde(rename = "rtuovertcp")]
    RtuOverTcp(NetworkConfig),
}

/// Addressing for tcp, udp and rtuovertcp hubs
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    #[serde(deserialize_with = "lenient_number")]
    pub port: u16,
    /// Pause before the first exchange, letting the device settle
    #[serde(default, deserialize_with = "whole_seconds")]
    pub delay: Duration,
}

/// Line settings for serial hubs
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. /dev/ttyUSB0
    pub port: String,
    #[serde(deserialize_with = "lenient_number")]
    pub baudrate: u32,
    pub bytesize: u8,
    pub parity: Parity,
    pub stopbits: u8,
    pub method: SerialMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Parity {
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
    #[serde(rename = "N")]
    None,
}

/// Framing used on a serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMethod {
    Rtu,
    Ascii,
}

impl HubConfig {
    /// A plain Modbus TCP hub with default timeout and no delay
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
            transport: TransportConfig::Tcp(NetworkConfig {
                host: host.into(),
                port,
                delay: Duration::ZERO,
            }),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the post-connect delay; serial hubs have none and ignore it
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if let Some(network) = self.transport.network_mut() {
            network.delay = delay;
        }
        self
    }

    /// Delay to apply once before the first exchange
    pub fn settle_delay(&self) -> Duration {
        match &self.transport {
            TransportConfig::Serial(_) => Duration::ZERO,
            TransportConfig::Tcp(net)
            | TransportConfig::Udp(net)
            | TransportConfig::RtuOverTcp(net) => net.delay,
        }
    }

    /// Reject values serde accepts but the link cannot use
    pub fn validate(&self) -> ModbusResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::config("hub name must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(ModbusError::config(format!(
                "hub {}: timeout must be positive",
                self.name
            )));
        }

        match &self.transport {
            TransportConfig::Serial(serial) => {
                if serial.port.trim().is_empty() {
                    return Err(ModbusError::config(format!(
                        "hub {}: serial port must not be empty",
                        self.name
                    )));
                }
                if serial.baudrate == 0 {
                    return Err(ModbusError::config(format!(
                        "hub {}: baudrate must be positive",
                        self.name
                    )));
                }
                if !(5..=8).contains(&serial.bytesize) {
                    return Err(ModbusError::config(format!(
                        "hub {}: bytesize must be 5, 6, 7 or 8, got {}",
                        self.name, serial.bytesize
                    )));
                }
                if !matches!(serial.stopbits, 1 | 2) {
                    return Err(ModbusError::config(format!(
                        "hub {}: stopbits must be 1 or 2, got {}",
                        self.name, serial.stopbits
                    )));
                }
            }
            TransportConfig::Tcp(net)
            | TransportConfig::Udp(net)
            | TransportConfig::RtuOverTcp(net) => {
                if net.host.trim().is_empty() {
                    return Err(ModbusError::config(format!(
                        "hub {}: host must not be empty",
                        self.name
                    )));
                }
                if net.port == 0 {
                    return Err(ModbusError::config(format!(
                        "hub {}: port must be between 1 and 65535",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl TransportConfig {
    /// The `type` value this variant is configured with
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
            Self::RtuOverTcp(_) => "rtuovertcp",
        }
    }

    fn network_mut(&mut self) -> Option<&mut NetworkConfig> {
        match self {
            Self::Serial(_) => None,
            Self::Tcp(net) | Self::Udp(net) | Self::RtuOverTcp(net) => Some(net),
        }
    }
}

/// Parse and validate the `modbus:` section
///
/// Accepts a single hub mapping or a list of them; a missing section yields
/// no hubs.
pub fn parse_hub_configs(section: &Value) -> ModbusResult<Vec<HubConfig>> {
    let entries = match section {
        Value::Null => return Ok(Vec::new()),
        Value::Sequence(seq) => seq.clone(),
        Value::Mapping(_) => vec![section.clone()],
        other => {
            return Err(ModbusError::config(format!(
                "expected a hub mapping or a list of hubs, got {:?}",
                other
            )))
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            reject_unknown_keys(&entry)
                .map_err(|e| ModbusError::config(format!("hub #{}: {}", index + 1, e)))?;
            let config: HubConfig = serde_yaml::from_value(entry)
                .map_err(|e| ModbusError::config(format!("hub #{}: {}", index + 1, e)))?;
            config.validate()?;
            debug!(hub = %config.name, kind = config.transport.kind(), "Parsed hub config");
            Ok(config)
        })
        .collect()
}

/// Keys outside the schema of the hub's `type` are configuration mistakes
///
/// A missing or unknown `type` is left for deserialization to report.
fn reject_unknown_keys(entry: &Value) -> Result<(), String> {
    let Value::Mapping(map) = entry else {
        return Ok(());
    };
    let allowed = match map.get("type").and_then(Value::as_str) {
        Some("serial") => SERIAL_KEYS,
        Some("tcp" | "udp" | "rtuovertcp") => NETWORK_KEYS,
        _ => return Ok(()),
    };

    for key in map.keys() {
        match key.as_str() {
            Some(key) if HUB_KEYS.contains(&key) || allowed.contains(&key) => {}
            Some(key) => return Err(format!("unknown key '{}'", key)),
            None => return Err(format!("non-string key {:?}", key)),
        }
    }
    Ok(())
}

fn default_name() -> String {
    DEFAULT_HUB.to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn fractional_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(serde::de::Error::custom(format!(
            "expected a positive number of seconds, got {}",
            secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// A number, or a string holding one (`port: "502"`)
fn lenient_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText<T> {
        Number(T),
        Text(String),
    }

    match NumberOrText::<T>::deserialize(deserializer)? {
        NumberOrText::Number(number) => Ok(number),
        NumberOrText::Text(text) => text.trim().parse().map_err(|e| {
            serde::de::Error::custom(format!("expected a number, got {:?}: {}", text, e))
        }),
    }
}

fn whole_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}
