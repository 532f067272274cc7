//! Error types for Modbus hubs

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for hub operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Failures a hub operation can report
///
/// None of these are raised for expected link conditions; every façade
/// operation returns them as values so callers can mark a reading
/// unavailable or log a failed write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    /// The transport was never connected, or has been torn down
    #[error("no transport available")]
    NoTransport,

    /// The exchange did not complete within the hub timeout
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    /// The far end answered with an exception, garbage, or the link failed
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Hub configuration was rejected before a hub was built
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller broke the operation contract (count, value range)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ModbusError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    /// Whether repeating the same call later might succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Protocol(ProtocolError::Link(_))
        )
    }
}

/// Failures reported by a transport binding for a single exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The device answered with a Modbus exception response
    #[error("device exception {0}")]
    Exception(ExceptionCode),

    /// The response could not be decoded or did not match the request
    #[error("malformed response: {0}")]
    Malformed(String),

    /// I/O failure on the underlying link
    #[error("link failure: {0}")]
    Link(String),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Exception code sent by the device, if any
    pub fn code(&self) -> Option<u8> {
        match self {
            Self::Exception(code) => Some(code.value()),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        Self::Link(format!("{:?}: {}", err.kind(), err))
    }
}

/// Exception codes defined by the Modbus application protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDevice,
    /// Vendor specific or unassigned code
    Other(u8),
}

impl ExceptionCode {
    /// Raw code as sent on the wire
    pub fn value(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::ServerDeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetDevice => 0x0B,
            Self::Other(code) => code,
        }
    }
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::ServerDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDevice,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetDevice => "gateway target device failed to respond",
            Self::Other(_) => "unknown exception",
        };
        write!(f, "0x{:02X} ({})", self.value(), name)
    }
}
