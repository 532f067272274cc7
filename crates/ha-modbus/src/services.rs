//! `modbus.write_register` and `modbus.write_coil`

use crate::error::ModbusError;
use crate::hub::Hub;
use crate::registry::HubRegistry;
use crate::{DEFAULT_HUB, DOMAIN, SERVICE_WRITE_COIL, SERVICE_WRITE_REGISTER};
use ha_service_registry::{
    ServiceCall, ServiceDescription, ServiceError, ServiceRegistry, ServiceResult,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument};

const ATTR_HUB: &str = "hub";
const ATTR_UNIT: &str = "unit";
const ATTR_ADDRESS: &str = "address";
const ATTR_VALUE: &str = "value";
const ATTR_STATE: &str = "state";

/// Register the modbus domain services against `hubs`
pub fn register_modbus_services(services: &ServiceRegistry, hubs: Arc<HubRegistry>) {
    let registry = Arc::clone(&hubs);
    services.register(
        ServiceDescription::new(DOMAIN, SERVICE_WRITE_REGISTER)
            .with_name("Write register")
            .with_description("Write one holding register, or consecutive ones from a list")
            .with_fields([ATTR_HUB, ATTR_UNIT, ATTR_ADDRESS, ATTR_VALUE]),
        move |call: ServiceCall| {
            let hubs = Arc::clone(&registry);
            async move { write_register(&hubs, &call).await }
        },
    );

    services.register(
        ServiceDescription::new(DOMAIN, SERVICE_WRITE_COIL)
            .with_name("Write coil")
            .with_description("Switch a single coil on or off")
            .with_fields([ATTR_HUB, ATTR_UNIT, ATTR_ADDRESS, ATTR_STATE]),
        move |call: ServiceCall| {
            let hubs = Arc::clone(&hubs);
            async move { write_coil(&hubs, &call).await }
        },
    );

    debug!(domain = DOMAIN, "Registered modbus services");
}

#[instrument(skip(hubs, call), fields(data = %call.service_data))]
async fn write_register(hubs: &HubRegistry, call: &ServiceCall) -> ServiceResult {
    let hub = resolve_hub(hubs, call)?;
    let unit = unit_field(call)?;
    let address = u16_field(call, ATTR_ADDRESS)?;

    let result = match required(call, ATTR_VALUE)? {
        Value::Array(items) => {
            let values = items
                .iter()
                .map(|item| to_u16(item, ATTR_VALUE))
                .collect::<Result<Vec<_>, _>>()?;
            hub.write_registers(Some(unit), address, &values).await
        }
        scalar => hub.write_register(Some(unit), address, to_u16(scalar, ATTR_VALUE)?).await,
    };

    result.map(|_| None).map_err(|e| hub_failure(&hub, e))
}

#[instrument(skip(hubs, call), fields(data = %call.service_data))]
async fn write_coil(hubs: &HubRegistry, call: &ServiceCall) -> ServiceResult {
    let hub = resolve_hub(hubs, call)?;
    let unit = unit_field(call)?;
    let address = u16_field(call, ATTR_ADDRESS)?;
    let state = to_bool(required(call, ATTR_STATE)?, ATTR_STATE)?;

    hub.write_coil(Some(unit), address, state)
        .await
        .map(|_| None)
        .map_err(|e| hub_failure(&hub, e))
}

/// Contract violations are the caller's data; everything else is the hub's
fn hub_failure(hub: &Hub, err: ModbusError) -> ServiceError {
    match err {
        ModbusError::InvalidRequest(reason) => ServiceError::InvalidData(reason),
        other => ServiceError::CallFailed(format!("hub {}: {}", hub.name(), other)),
    }
}

fn resolve_hub(hubs: &HubRegistry, call: &ServiceCall) -> Result<Arc<Hub>, ServiceError> {
    let name = match call.field(ATTR_HUB) {
        None => DEFAULT_HUB.to_string(),
        Some(Value::String(name)) => name.clone(),
        Some(other) => {
            return Err(ServiceError::InvalidData(format!(
                "{} must be a string, got {}",
                ATTR_HUB, other
            )))
        }
    };
    hubs.get(&name)
        .ok_or_else(|| ServiceError::InvalidData(format!("unknown hub: {}", name)))
}

fn required<'a>(call: &'a ServiceCall, key: &str) -> Result<&'a Value, ServiceError> {
    call.field(key)
        .ok_or_else(|| ServiceError::InvalidData(format!("missing required field: {}", key)))
}

fn unit_field(call: &ServiceCall) -> Result<u8, ServiceError> {
    let unit = to_integer(required(call, ATTR_UNIT)?, ATTR_UNIT)?;
    u8::try_from(unit).map_err(|_| {
        ServiceError::InvalidData(format!("{} must be between 0 and 255, got {}", ATTR_UNIT, unit))
    })
}

fn u16_field(call: &ServiceCall, key: &str) -> Result<u16, ServiceError> {
    to_u16(required(call, key)?, key)
}

fn to_u16(value: &Value, key: &str) -> Result<u16, ServiceError> {
    let number = to_integer(value, key)?;
    u16::try_from(number).map_err(|_| {
        ServiceError::InvalidData(format!("{} must be between 0 and 65535, got {}", key, number))
    })
}

/// Integer coercion: numbers and numeric strings, fractions truncated toward zero
fn to_integer(value: &Value, key: &str) -> Result<i64, ServiceError> {
    let float = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            n.as_f64()
        }
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match float {
        Some(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Ok(f.trunc() as i64),
        _ => Err(ServiceError::InvalidData(format!(
            "{} must be a number, got {}",
            key, value
        ))),
    }
}

fn to_bool(value: &Value, key: &str) -> Result<bool, ServiceError> {
    let parsed = match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "enable" => Some(true),
            "0" | "false" | "no" | "off" | "disable" => Some(false),
            _ => None,
        },
        _ => None,
    };
    parsed.ok_or_else(|| ServiceError::InvalidData(format!("{} is not a boolean: {}", key, value)))
}
