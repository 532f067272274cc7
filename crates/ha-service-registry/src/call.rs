//! A single service invocation

use serde_json::Value;

/// Service invocation routed to a registered handler
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    /// Domain the service belongs to (e.g. "modbus")
    pub domain: String,

    /// Service name (e.g. "write_register")
    pub service: String,

    /// Data passed by the caller, usually a JSON object
    pub service_data: Value,
}

impl ServiceCall {
    pub fn new(domain: impl Into<String>, service: impl Into<String>, service_data: Value) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data,
        }
    }

    /// Raw value of a field, if present and not null
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.service_data.get(key).filter(|v| !v.is_null())
    }
}
