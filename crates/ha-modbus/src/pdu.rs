//! Modbus protocol data units
//!
//! Encodes the requests a hub can issue and decodes the matching responses.
//! Framing (MBAP, RTU, ASCII) wraps these bytes and lives in `transport`.

use crate::error::{ExceptionCode, ModbusError, ModbusResult, ProtocolError};
use bytes::{BufMut, BytesMut};

/// Register or coil address
pub type Address = u16;

/// Number of coils or registers in a read
pub type Quantity = u16;

/// Largest coil/discrete-input read allowed by the protocol
pub const MAX_READ_BITS: Quantity = 2000;

/// Largest register read allowed by the protocol
pub const MAX_READ_REGISTERS: Quantity = 125;

/// Largest write-multiple-registers request allowed by the protocol
pub const MAX_WRITE_REGISTERS: usize = 123;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;
const EXCEPTION_FLAG: u8 = 0x80;

/// Function codes used by the hub
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// A single request/response exchange issued through a hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    WriteSingleCoil(Address, bool),
    WriteSingleRegister(Address, u16),
    WriteMultipleRegisters(Address, Vec<u16>),
}

impl Request {
    /// Function code sent on the wire
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils(..) => function::READ_COILS,
            Self::ReadDiscreteInputs(..) => function::READ_DISCRETE_INPUTS,
            Self::ReadInputRegisters(..) => function::READ_INPUT_REGISTERS,
            Self::ReadHoldingRegisters(..) => function::READ_HOLDING_REGISTERS,
            Self::WriteSingleCoil(..) => function::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister(..) => function::WRITE_SINGLE_REGISTER,
            Self::WriteMultipleRegisters(..) => function::WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Whether the request modifies the device
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil(..)
                | Self::WriteSingleRegister(..)
                | Self::WriteMultipleRegisters(..)
        )
    }

    /// Check protocol limits before anything is put on the wire
    pub fn validate(&self) -> ModbusResult<()> {
        let (address, span, limit) = match self {
            Self::ReadCoils(addr, cnt) | Self::ReadDiscreteInputs(addr, cnt) => {
                (*addr, *cnt as usize, MAX_READ_BITS as usize)
            }
            Self::ReadInputRegisters(addr, cnt) | Self::ReadHoldingRegisters(addr, cnt) => {
                (*addr, *cnt as usize, MAX_READ_REGISTERS as usize)
            }
            Self::WriteMultipleRegisters(addr, words) => (*addr, words.len(), MAX_WRITE_REGISTERS),
            Self::WriteSingleCoil(..) | Self::WriteSingleRegister(..) => return Ok(()),
        };

        if span == 0 {
            return Err(ModbusError::invalid(format!(
                "function 0x{:02X} needs at least one item",
                self.function_code()
            )));
        }
        if span > limit {
            return Err(ModbusError::invalid(format!(
                "function 0x{:02X} allows at most {} items, got {}",
                self.function_code(),
                limit,
                span
            )));
        }
        if address as usize + span > 0x1_0000 {
            return Err(ModbusError::invalid(format!(
                "address range {}..{} exceeds the 16-bit address space",
                address,
                address as usize + span
            )));
        }
        Ok(())
    }

    /// Append the PDU (function code and data) to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code());
        match self {
            Self::ReadCoils(addr, cnt)
            | Self::ReadDiscreteInputs(addr, cnt)
            | Self::ReadInputRegisters(addr, cnt)
            | Self::ReadHoldingRegisters(addr, cnt) => {
                buf.put_u16(*addr);
                buf.put_u16(*cnt);
            }
            Self::WriteSingleCoil(addr, on) => {
                buf.put_u16(*addr);
                buf.put_u16(if *on { COIL_ON } else { COIL_OFF });
            }
            Self::WriteSingleRegister(addr, word) => {
                buf.put_u16(*addr);
                buf.put_u16(*word);
            }
            Self::WriteMultipleRegisters(addr, words) => {
                buf.put_u16(*addr);
                buf.put_u16(words.len() as u16);
                buf.put_u8((words.len() * 2) as u8);
                for word in words {
                    buf.put_u16(*word);
                }
            }
        }
    }

    /// Parse a request PDU, as a server or gateway would receive it
    pub fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        let (&code, data) = pdu
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty request"))?;
        if data.len() < 4 {
            return Err(ProtocolError::malformed("request shorter than 5 bytes"));
        }
        let addr = be_u16(data, 0);
        let arg = be_u16(data, 2);

        let request = match code {
            function::READ_COILS => Self::ReadCoils(addr, arg),
            function::READ_DISCRETE_INPUTS => Self::ReadDiscreteInputs(addr, arg),
            function::READ_HOLDING_REGISTERS => Self::ReadHoldingRegisters(addr, arg),
            function::READ_INPUT_REGISTERS => Self::ReadInputRegisters(addr, arg),
            function::WRITE_SINGLE_COIL => match arg {
                COIL_ON => Self::WriteSingleCoil(addr, true),
                COIL_OFF => Self::WriteSingleCoil(addr, false),
                other => {
                    return Err(ProtocolError::malformed(format!(
                        "invalid coil value 0x{:04X}",
                        other
                    )))
                }
            },
            function::WRITE_SINGLE_REGISTER => Self::WriteSingleRegister(addr, arg),
            function::WRITE_MULTIPLE_REGISTERS => {
                let byte_count = *data
                    .get(4)
                    .ok_or_else(|| ProtocolError::malformed("missing byte count"))?
                    as usize;
                let payload = &data[5..];
                if byte_count != arg as usize * 2 || payload.len() != byte_count {
                    return Err(ProtocolError::malformed("register payload length mismatch"));
                }
                Self::WriteMultipleRegisters(addr, words(payload))
            }
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unsupported function 0x{:02X}",
                    other
                )))
            }
        };
        Ok(request)
    }
}

/// Decoded answer to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadInputRegisters(Vec<u16>),
    ReadHoldingRegisters(Vec<u16>),
    WriteSingleCoil(Address, bool),
    WriteSingleRegister(Address, u16),
    WriteMultipleRegisters(Address, Quantity),
}

impl Response {
    /// Decode a response PDU, checking it answers `request`
    ///
    /// Exception responses come back as `ProtocolError::Exception`.
    pub fn decode(request: &Request, pdu: &[u8]) -> Result<Self, ProtocolError> {
        let (&code, data) = pdu
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty response"))?;

        if code & EXCEPTION_FLAG != 0 {
            if code & !EXCEPTION_FLAG != request.function_code() {
                return Err(ProtocolError::malformed(format!(
                    "exception for function 0x{:02X}, expected 0x{:02X}",
                    code & !EXCEPTION_FLAG,
                    request.function_code()
                )));
            }
            let exception = data
                .first()
                .ok_or_else(|| ProtocolError::malformed("exception without code"))?;
            return Err(ProtocolError::Exception(ExceptionCode::from(*exception)));
        }

        if code != request.function_code() {
            return Err(ProtocolError::malformed(format!(
                "function 0x{:02X} in response, expected 0x{:02X}",
                code,
                request.function_code()
            )));
        }

        match request {
            Request::ReadCoils(_, cnt) => Ok(Self::ReadCoils(bits(byte_counted(data)?, *cnt)?)),
            Request::ReadDiscreteInputs(_, cnt) => {
                Ok(Self::ReadDiscreteInputs(bits(byte_counted(data)?, *cnt)?))
            }
            Request::ReadInputRegisters(_, cnt) => {
                Ok(Self::ReadInputRegisters(registers(byte_counted(data)?, *cnt)?))
            }
            Request::ReadHoldingRegisters(_, cnt) => {
                Ok(Self::ReadHoldingRegisters(registers(byte_counted(data)?, *cnt)?))
            }
            Request::WriteSingleCoil(addr, on) => {
                let (echo_addr, value) = echo(data)?;
                let echoed = value == COIL_ON;
                if echo_addr != *addr || echoed != *on {
                    return Err(ProtocolError::malformed("coil write echo mismatch"));
                }
                Ok(Self::WriteSingleCoil(echo_addr, echoed))
            }
            Request::WriteSingleRegister(addr, word) => {
                let (echo_addr, value) = echo(data)?;
                if echo_addr != *addr || value != *word {
                    return Err(ProtocolError::malformed("register write echo mismatch"));
                }
                Ok(Self::WriteSingleRegister(echo_addr, value))
            }
            Request::WriteMultipleRegisters(addr, words) => {
                let (echo_addr, quantity) = echo(data)?;
                if echo_addr != *addr || quantity as usize != words.len() {
                    return Err(ProtocolError::malformed("multi-register write echo mismatch"));
                }
                Ok(Self::WriteMultipleRegisters(echo_addr, quantity))
            }
        }
    }

    /// Append the response PDU to `buf`, as a server would send it
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::ReadCoils(values) | Self::ReadDiscreteInputs(values) => {
                buf.put_u8(if matches!(self, Self::ReadCoils(_)) {
                    function::READ_COILS
                } else {
                    function::READ_DISCRETE_INPUTS
                });
                let packed = pack_bits(values);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            Self::ReadInputRegisters(values) | Self::ReadHoldingRegisters(values) => {
                buf.put_u8(if matches!(self, Self::ReadInputRegisters(_)) {
                    function::READ_INPUT_REGISTERS
                } else {
                    function::READ_HOLDING_REGISTERS
                });
                buf.put_u8((values.len() * 2) as u8);
                for value in values {
                    buf.put_u16(*value);
                }
            }
            Self::WriteSingleCoil(addr, on) => {
                buf.put_u8(function::WRITE_SINGLE_COIL);
                buf.put_u16(*addr);
                buf.put_u16(if *on { COIL_ON } else { COIL_OFF });
            }
            Self::WriteSingleRegister(addr, word) => {
                buf.put_u8(function::WRITE_SINGLE_REGISTER);
                buf.put_u16(*addr);
                buf.put_u16(*word);
            }
            Self::WriteMultipleRegisters(addr, quantity) => {
                buf.put_u8(function::WRITE_MULTIPLE_REGISTERS);
                buf.put_u16(*addr);
                buf.put_u16(*quantity);
            }
        }
    }
}

/// Append an exception response PDU for `function` to `buf`
pub fn encode_exception(function: u8, code: ExceptionCode, buf: &mut BytesMut) {
    buf.put_u8(function | EXCEPTION_FLAG);
    buf.put_u8(code.value());
}

/// Total response PDU length once enough of its head is known
///
/// `head` starts at the function code. Returns `Ok(None)` when more bytes
/// are needed to tell (reads carry a byte count after the function code).
pub(crate) fn response_pdu_len(head: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(&code) = head.first() else {
        return Ok(None);
    };
    if code & EXCEPTION_FLAG != 0 {
        return Ok(Some(2));
    }
    match code {
        function::READ_COILS
        | function::READ_DISCRETE_INPUTS
        | function::READ_HOLDING_REGISTERS
        | function::READ_INPUT_REGISTERS => Ok(head.get(1).map(|count| 2 + *count as usize)),
        function::WRITE_SINGLE_COIL
        | function::WRITE_SINGLE_REGISTER
        | function::WRITE_MULTIPLE_REGISTERS => Ok(Some(5)),
        other => Err(ProtocolError::malformed(format!(
            "unexpected function 0x{:02X} in response",
            other
        ))),
    }
}

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn words(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn byte_counted(data: &[u8]) -> Result<&[u8], ProtocolError> {
    let (&count, payload) = data
        .split_first()
        .ok_or_else(|| ProtocolError::malformed("missing byte count"))?;
    if payload.len() != count as usize {
        return Err(ProtocolError::malformed(format!(
            "byte count {} but {} bytes follow",
            count,
            payload.len()
        )));
    }
    Ok(payload)
}

fn bits(payload: &[u8], count: Quantity) -> Result<Vec<bool>, ProtocolError> {
    let count = count as usize;
    if payload.len() != count.div_ceil(8) {
        return Err(ProtocolError::malformed(format!(
            "{} bytes cannot hold exactly {} bits",
            payload.len(),
            count
        )));
    }
    Ok((0..count)
        .map(|i| payload[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

fn registers(payload: &[u8], count: Quantity) -> Result<Vec<u16>, ProtocolError> {
    if payload.len() != count as usize * 2 {
        return Err(ProtocolError::malformed(format!(
            "{} bytes for {} registers",
            payload.len(),
            count
        )));
    }
    Ok(words(payload))
}

fn echo(data: &[u8]) -> Result<(u16, u16), ProtocolError> {
    if data.len() != 4 {
        return Err(ProtocolError::malformed("write echo must be 4 bytes"));
    }
    Ok((be_u16(data, 0), be_u16(data, 2)))
}

fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (i, on) in values.iter().enumerate() {
        if *on {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}
