//! Modbus integration: shared transport hubs
//!
//! A [`Hub`] multiplexes register and coil operations from any number of
//! concurrent callers onto one half-duplex link (serial line, TCP, UDP or
//! RTU over TCP). At most one request/response exchange is in flight per
//! hub, each bounded by the hub timeout.
//!
//! ```ignore
//! let configs = parse_hub_configs(&config["modbus"])?;
//! let hubs = Arc::new(HubRegistry::new(configs, Arc::new(LinkConnector))?);
//! hubs.setup().await;
//! register_modbus_services(&services, Arc::clone(&hubs));
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod pdu;
pub mod registry;
pub mod services;
pub mod transport;

pub use config::{
    parse_hub_configs, HubConfig, NetworkConfig, Parity, SerialConfig, SerialMethod,
    TransportConfig,
};
pub use error::{ExceptionCode, ModbusError, ModbusResult, ProtocolError};
pub use hub::{Hub, HubState};
pub use pdu::{Address, Quantity, Request, Response};
pub use registry::HubRegistry;
pub use services::register_modbus_services;
pub use transport::{Connector, LinkConnector, Transport};

/// Integration domain, also the configuration key
pub const DOMAIN: &str = "modbus";

/// Hub name used when neither the config nor a service call names one
pub const DEFAULT_HUB: &str = "default";

pub const SERVICE_WRITE_REGISTER: &str = "write_register";
pub const SERVICE_WRITE_COIL: &str = "write_coil";
