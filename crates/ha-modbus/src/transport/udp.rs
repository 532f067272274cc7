//! Modbus over UDP datagrams, one MBAP frame per datagram

use super::framing::{encode_mbap, hex_frame, next_transaction, parse_mbap_header, MBAP_HEADER_LEN};
use super::Transport;
use crate::error::{ModbusResult, ProtocolError};
use crate::pdu::{Request, Response};
use async_trait::async_trait;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};

const MAX_DATAGRAM: usize = 260;

pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    last_transaction: u16,
}

impl UdpTransport {
    /// Bind an ephemeral local port and fix the peer address
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let peer = lookup_host((host, port)).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}:{} did not resolve", host, port),
            )
        })?;

        let local = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;

        Ok(Self {
            socket,
            peer,
            last_transaction: 0,
        })
    }

    fn drain_stale(&self) {
        let mut scratch = [0u8; MAX_DATAGRAM];
        while let Ok(n) = self.socket.try_recv(&mut scratch) {
            debug!(peer = %self.peer, bytes = n, "Discarded stale datagram");
        }
    }

    async fn exchange(&mut self, unit: u8, request: &Request) -> Result<Vec<u8>, ProtocolError> {
        let transaction = next_transaction(&mut self.last_transaction);
        let frame = encode_mbap(transaction, unit, request);
        trace!(peer = %self.peer, frame = %hex_frame(&frame), "TX");
        self.socket.send(&frame).await?;

        let mut datagram = [0u8; MAX_DATAGRAM];
        loop {
            let n = self.socket.recv(&mut datagram).await?;
            let received = &datagram[..n];
            trace!(peer = %self.peer, frame = %hex_frame(received), "RX");

            let (answered, pdu_len) = parse_mbap_header(received)?;
            if answered != transaction {
                debug!(
                    peer = %self.peer,
                    expected = transaction,
                    received = answered,
                    "Skipping datagram for an abandoned transaction"
                );
                continue;
            }
            let pdu = &received[MBAP_HEADER_LEN..];
            if pdu.len() != pdu_len {
                return Err(ProtocolError::malformed(format!(
                    "datagram carries {} PDU bytes, header announces {}",
                    pdu.len(),
                    pdu_len
                )));
            }
            return Ok(pdu.to_vec());
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn call(&mut self, unit: Option<u8>, request: &Request) -> ModbusResult<Response> {
        self.drain_stale();
        let pdu = self.exchange(unit.unwrap_or(0), request).await?;
        Ok(Response::decode(request, &pdu)?)
    }

    async fn close(&mut self) -> io::Result<()> {
        debug!(peer = %self.peer, "Releasing UDP socket");
        Ok(())
    }
}
