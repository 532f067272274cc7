//! Modbus hub: one shared link, many callers
//!
//! Every read and write goes through the same path: contract check, a
//! `NoTransport` short-circuit when the link is not up, the one-time settle
//! delay, then a single gated exchange bounded by the hub timeout.

mod gate;
mod guard;

pub use guard::HubState;

use crate::config::HubConfig;
use crate::error::{ModbusError, ModbusResult, ProtocolError};
use crate::pdu::{Address, Quantity, Request, Response};
use crate::transport::Connector;
use guard::ConnectionGuard;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// A named hub multiplexing operations onto one transport
pub struct Hub {
    config: HubConfig,
    guard: ConnectionGuard,
}

impl Hub {
    pub fn new(config: HubConfig, connector: Arc<dyn Connector>) -> Self {
        let guard = ConnectionGuard::new(&config, connector);
        Self { config, guard }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn state(&self) -> HubState {
        self.guard.state()
    }

    /// Open the link; a no-op when already open or opening
    pub async fn establish(&self) -> HubState {
        self.guard.establish(&self.config).await
    }

    /// Close the link for good; later operations report `NoTransport`
    pub async fn teardown(&self) {
        self.guard.teardown(&self.config.name).await
    }

    // ===== Reads =====

    pub async fn read_coils(
        &self,
        unit: Option<u8>,
        address: Address,
        count: Quantity,
    ) -> ModbusResult<Vec<bool>> {
        let request = Request::ReadCoils(address, count);
        self.execute(unit, request, |response| match response {
            Response::ReadCoils(bits) => Ok(bits),
            other => Err(other),
        })
        .await
    }

    pub async fn read_discrete_inputs(
        &self,
        unit: Option<u8>,
        address: Address,
        count: Quantity,
    ) -> ModbusResult<Vec<bool>> {
        let request = Request::ReadDiscreteInputs(address, count);
        self.execute(unit, request, |response| match response {
            Response::ReadDiscreteInputs(bits) => Ok(bits),
            other => Err(other),
        })
        .await
    }

    pub async fn read_input_registers(
        &self,
        unit: Option<u8>,
        address: Address,
        count: Quantity,
    ) -> ModbusResult<Vec<u16>> {
        let request = Request::ReadInputRegisters(address, count);
        self.execute(unit, request, |response| match response {
            Response::ReadInputRegisters(words) => Ok(words),
            other => Err(other),
        })
        .await
    }

    pub async fn read_holding_registers(
        &self,
        unit: Option<u8>,
        address: Address,
        count: Quantity,
    ) -> ModbusResult<Vec<u16>> {
        let request = Request::ReadHoldingRegisters(address, count);
        self.execute(unit, request, |response| match response {
            Response::ReadHoldingRegisters(words) => Ok(words),
            other => Err(other),
        })
        .await
    }

    // ===== Writes =====

    pub async fn write_coil(
        &self,
        unit: Option<u8>,
        address: Address,
        value: bool,
    ) -> ModbusResult<()> {
        let request = Request::WriteSingleCoil(address, value);
        self.execute(unit, request, |response| match response {
            Response::WriteSingleCoil(..) => Ok(()),
            other => Err(other),
        })
        .await
    }

    pub async fn write_register(
        &self,
        unit: Option<u8>,
        address: Address,
        value: u16,
    ) -> ModbusResult<()> {
        let request = Request::WriteSingleRegister(address, value);
        self.execute(unit, request, |response| match response {
            Response::WriteSingleRegister(..) => Ok(()),
            other => Err(other),
        })
        .await
    }

    /// Write consecutive holding registers in one exchange
    pub async fn write_registers(
        &self,
        unit: Option<u8>,
        address: Address,
        values: &[u16],
    ) -> ModbusResult<()> {
        let request = Request::WriteMultipleRegisters(address, values.to_vec());
        self.execute(unit, request, |response| match response {
            Response::WriteMultipleRegisters(..) => Ok(()),
            other => Err(other),
        })
        .await
    }

    /// Run one request and pick its payload out of the matching response
    #[instrument(
        level = "debug",
        skip(self, request, extract),
        fields(hub = %self.config.name, function = request.function_code())
    )]
    async fn execute<T>(
        &self,
        unit: Option<u8>,
        request: Request,
        extract: fn(Response) -> Result<T, Response>,
    ) -> ModbusResult<T> {
        request.validate()?;

        if !self.guard.is_ready() {
            debug!(state = %self.guard.state(), "No transport, skipping exchange");
            return Err(ModbusError::NoTransport);
        }

        self.guard.settle().await;
        let result = self
            .guard
            .gate()
            .exchange(unit, &request)
            .await
            .and_then(|response| extract(response).map_err(unexpected));

        match &result {
            Err(ModbusError::Protocol(err)) => {
                error!(
                    hub = %self.config.name,
                    unit = ?unit,
                    write = request.is_write(),
                    "Function 0x{:02X} failed: {}",
                    request.function_code(),
                    err
                );
            }
            Err(err @ (ModbusError::Timeout(_) | ModbusError::NoTransport)) => {
                debug!(unit = ?unit, "Exchange not completed: {}", err);
            }
            _ => {}
        }
        result
    }
}

fn unexpected(response: Response) -> ModbusError {
    ProtocolError::malformed(format!("response does not match request: {:?}", response))
        .into()
}
