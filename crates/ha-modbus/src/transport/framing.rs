//! MBAP, RTU and ASCII framing over byte streams

use super::Transport;
use crate::error::{ModbusError, ModbusResult, ProtocolError};
use crate::pdu::{response_pdu_len, Request, Response};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use futures::FutureExt;
use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, trace};

pub(crate) const MBAP_HEADER_LEN: usize = 7;
const MAX_PDU_LEN: usize = 253;
const MAX_ASCII_LINE: usize = 1 + 2 * (1 + MAX_PDU_LEN + 1) + 2;

/// Unit 0 addresses every device on a serial line; nobody answers it
pub(crate) const BROADCAST_UNIT: u8 = 0;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Silence required on a bus after an abandoned exchange before sending again
pub(crate) const ABANDONED_QUIET: Duration = Duration::from_millis(100);

/// How request and response PDUs are wrapped on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Modbus application header, used by TCP and UDP
    Mbap { last_transaction: u16 },
    /// Binary serial framing with CRC-16, also tunnelled over TCP
    Rtu,
    /// Hex text framing with LRC, serial only
    Ascii,
}

impl Framing {
    pub fn mbap() -> Self {
        Self::Mbap {
            last_transaction: 0,
        }
    }

    /// Unit used on the wire when the caller did not name one
    pub fn default_unit(&self) -> u8 {
        match self {
            Self::Mbap { .. } => 0,
            Self::Rtu | Self::Ascii => 1,
        }
    }

    fn addresses_a_bus(&self) -> bool {
        matches!(self, Self::Rtu | Self::Ascii)
    }
}

pub(crate) fn next_transaction(last: &mut u16) -> u16 {
    *last = last.wrapping_add(1);
    *last
}

pub(crate) fn encode_mbap(transaction: u16, unit: u8, request: &Request) -> BytesMut {
    let mut pdu = BytesMut::with_capacity(MAX_PDU_LEN);
    request.encode(&mut pdu);

    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit);
    frame.put_slice(&pdu);
    frame
}

/// Transaction id and remaining length (unit excluded) from an MBAP header
pub(crate) fn parse_mbap_header(header: &[u8]) -> Result<(u16, usize), ProtocolError> {
    if header.len() < MBAP_HEADER_LEN {
        return Err(ProtocolError::malformed("MBAP header shorter than 7 bytes"));
    }
    let transaction = u16::from_be_bytes([header[0], header[1]]);
    let protocol = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;

    if protocol != 0 {
        return Err(ProtocolError::malformed(format!(
            "MBAP protocol id {} is not Modbus",
            protocol
        )));
    }
    if !(2..=MAX_PDU_LEN + 1).contains(&length) {
        return Err(ProtocolError::malformed(format!(
            "MBAP length {} out of range",
            length
        )));
    }
    Ok((transaction, length - 1))
}

pub(crate) fn encode_rtu(unit: u8, request: &Request) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MAX_PDU_LEN + 3);
    frame.put_u8(unit);
    request.encode(&mut frame);
    let crc = CRC_MODBUS.checksum(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Verify the CRC of a complete RTU frame, returning unit and PDU
pub(crate) fn check_rtu(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::malformed("RTU frame shorter than 4 bytes"));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let expected = CRC_MODBUS.checksum(body);
    if received != expected {
        return Err(ProtocolError::malformed(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            expected, received
        )));
    }
    Ok((body[0], &body[1..]))
}

fn lrc(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

pub(crate) fn encode_ascii(unit: u8, request: &Request) -> BytesMut {
    let mut body = BytesMut::with_capacity(MAX_PDU_LEN + 2);
    body.put_u8(unit);
    request.encode(&mut body);
    body.put_u8(lrc(&body));

    let mut frame = BytesMut::with_capacity(body.len() * 2 + 3);
    frame.put_u8(b':');
    for byte in body.iter() {
        frame.put_slice(format!("{:02X}", byte).as_bytes());
    }
    frame.put_slice(b"\r\n");
    frame
}

/// Decode one ASCII line, returning unit and PDU
pub(crate) fn decode_ascii(line: &[u8]) -> Result<(u8, Vec<u8>), ProtocolError> {
    let start = line
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| ProtocolError::malformed("ASCII frame without ':'"))?;
    let text = line[start + 1..]
        .strip_suffix(b"\r\n")
        .ok_or_else(|| ProtocolError::malformed("ASCII frame without CRLF"))?;
    if text.len() % 2 != 0 || text.len() < 6 {
        return Err(ProtocolError::malformed("ASCII frame has odd or short hex body"));
    }

    let bytes = text
        .chunks_exact(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| ProtocolError::malformed("invalid hex in ASCII frame"))
        })
        .collect::<Result<Vec<u8>, _>>()?;

    let (body, check) = bytes.split_at(bytes.len() - 1);
    if lrc(body) != check[0] {
        return Err(ProtocolError::malformed(format!(
            "LRC mismatch: expected 0x{:02X}, got 0x{:02X}",
            lrc(body),
            check[0]
        )));
    }
    Ok((body[0], body[1..].to_vec()))
}

/// The response a broadcast write would have produced; reads have none
fn assumed_echo(request: &Request) -> Option<Response> {
    match request {
        Request::WriteSingleCoil(addr, on) => Some(Response::WriteSingleCoil(*addr, *on)),
        Request::WriteSingleRegister(addr, word) => {
            Some(Response::WriteSingleRegister(*addr, *word))
        }
        Request::WriteMultipleRegisters(addr, words) => {
            Some(Response::WriteMultipleRegisters(*addr, words.len() as u16))
        }
        Request::ReadCoils(..)
        | Request::ReadDiscreteInputs(..)
        | Request::ReadInputRegisters(..)
        | Request::ReadHoldingRegisters(..) => None,
    }
}

pub(crate) fn hex_frame(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A transport speaking one framing over a byte stream (TCP socket or serial port)
pub struct StreamTransport<S> {
    stream: BufReader<S>,
    framing: Framing,
    peer: String,
    /// Silent interval kept before each request (RTU on a real serial line)
    turnaround: Duration,
    /// A reply to a cancelled call may still be on its way
    abandoned: bool,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, framing: Framing, peer: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            framing,
            peer: peer.into(),
            turnaround: Duration::ZERO,
            abandoned: false,
        }
    }

    pub fn with_turnaround(mut self, turnaround: Duration) -> Self {
        self.turnaround = turnaround;
        self
    }

    fn advance_transaction(&mut self) -> u16 {
        match &mut self.framing {
            Framing::Mbap { last_transaction } => next_transaction(last_transaction),
            Framing::Rtu | Framing::Ascii => 0,
        }
    }

    fn discard_buffered(&mut self) -> usize {
        let buffered = self.stream.buffer().len();
        if buffered > 0 {
            self.stream.consume(buffered);
        }
        buffered
    }

    /// Drop bytes already waiting on the link
    fn drain_stale(&mut self) {
        let mut scratch = [0u8; 256];
        let mut dropped = self.discard_buffered();
        while let Some(Ok(n)) = self.stream.get_mut().read(&mut scratch).now_or_never() {
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            debug!(peer = %self.peer, bytes = dropped, "Discarded stale input");
        }
    }

    /// Drop input until the line has been silent for a full quiet period
    ///
    /// RTU and ASCII answers carry no transaction id, so a late answer to a
    /// cancelled call must be gone before the next request goes out.
    async fn drain_until_quiet(&mut self) {
        let quiet = self.turnaround.max(ABANDONED_QUIET);
        let mut scratch = [0u8; 256];
        let mut dropped = self.discard_buffered();
        loop {
            let read = self.stream.get_mut().read(&mut scratch);
            match tokio::time::timeout(quiet, read).await {
                Ok(Ok(n)) if n > 0 => dropped += n,
                _ => break,
            }
        }
        debug!(peer = %self.peer, bytes = dropped, "Line quiet after abandoned exchange");
    }

    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        trace!(peer = %self.peer, frame = %hex_frame(frame), "TX");
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    async fn read_mbap(&mut self, transaction: u16) -> Result<Vec<u8>, ProtocolError> {
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            self.stream.read_exact(&mut header).await?;
            let (received, pdu_len) = parse_mbap_header(&header)?;

            let mut pdu = vec![0u8; pdu_len];
            self.stream.read_exact(&mut pdu).await?;
            trace!(peer = %self.peer, header = %hex_frame(&header), pdu = %hex_frame(&pdu), "RX");

            if received == transaction {
                return Ok(pdu);
            }
            debug!(
                peer = %self.peer,
                expected = transaction,
                received,
                "Skipping response to an abandoned transaction"
            );
        }
    }

    async fn read_rtu(&mut self, unit: u8) -> Result<Vec<u8>, ProtocolError> {
        let mut frame = vec![0u8; 2];
        self.stream.read_exact(&mut frame).await?;

        let pdu_len = loop {
            if let Some(len) = response_pdu_len(&frame[1..])? {
                break len;
            }
            let mut next = [0u8; 1];
            self.stream.read_exact(&mut next).await?;
            frame.push(next[0]);
        };

        let have = frame.len();
        frame.resize(1 + pdu_len + 2, 0);
        self.stream.read_exact(&mut frame[have..]).await?;
        trace!(peer = %self.peer, frame = %hex_frame(&frame), "RX");

        let (responder, pdu) = check_rtu(&frame)?;
        if responder != unit {
            return Err(ProtocolError::malformed(format!(
                "answer from unit {}, expected {}",
                responder, unit
            )));
        }
        Ok(pdu.to_vec())
    }

    async fn read_ascii(&mut self, unit: u8) -> Result<Vec<u8>, ProtocolError> {
        let mut line = Vec::with_capacity(MAX_ASCII_LINE);
        let read = (&mut self.stream)
            .take(MAX_ASCII_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            return Err(ProtocolError::Link("link closed by peer".to_string()));
        }
        trace!(peer = %self.peer, frame = %String::from_utf8_lossy(&line).trim_end(), "RX");

        let (responder, pdu) = decode_ascii(&line)?;
        if responder != unit {
            return Err(ProtocolError::malformed(format!(
                "answer from unit {}, expected {}",
                responder, unit
            )));
        }
        Ok(pdu)
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn call(&mut self, unit: Option<u8>, request: &Request) -> ModbusResult<Response> {
        let unit = unit.unwrap_or_else(|| self.framing.default_unit());
        let broadcast = if unit == BROADCAST_UNIT && self.framing.addresses_a_bus() {
            let echo = assumed_echo(request)
                .ok_or_else(|| ModbusError::invalid("reads cannot be broadcast to unit 0"))?;
            Some(echo)
        } else {
            None
        };

        if self.abandoned && self.framing.addresses_a_bus() {
            self.drain_until_quiet().await;
        } else {
            self.drain_stale();
        }
        self.abandoned = false;
        if !self.turnaround.is_zero() {
            tokio::time::sleep(self.turnaround).await;
        }

        let pdu = match self.framing {
            Framing::Mbap { .. } => {
                let transaction = self.advance_transaction();
                let frame = encode_mbap(transaction, unit, request);
                self.send(&frame).await.map_err(ProtocolError::from)?;
                self.read_mbap(transaction).await?
            }
            Framing::Rtu => {
                let frame = encode_rtu(unit, request);
                self.send(&frame).await.map_err(ProtocolError::from)?;
                if let Some(echo) = broadcast {
                    return Ok(echo);
                }
                self.read_rtu(unit).await?
            }
            Framing::Ascii => {
                let frame = encode_ascii(unit, request);
                self.send(&frame).await.map_err(ProtocolError::from)?;
                if let Some(echo) = broadcast {
                    return Ok(echo);
                }
                self.read_ascii(unit).await?
            }
        };

        Ok(Response::decode(request, &pdu)?)
    }

    fn abandon(&mut self) {
        self.abandoned = true;
    }

    async fn close(&mut self) -> io::Result<()> {
        debug!(peer = %self.peer, "Closing link");
        self.stream.get_mut().shutdown().await
    }
}
