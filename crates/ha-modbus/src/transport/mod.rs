//! Links to Modbus devices
//!
//! A [`Transport`] performs one request/response exchange at a time and is
//! only ever driven by the hub holding it. A [`Connector`] opens transports
//! from a [`HubConfig`]; tests substitute their own.

mod framing;
mod serial;
mod udp;

pub use framing::{Framing, StreamTransport};
pub use udp::UdpTransport;

use crate::config::{HubConfig, TransportConfig};
use crate::error::ModbusResult;
use crate::pdu::{Request, Response};
use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// An open link to one or more devices
#[async_trait]
pub trait Transport: Send {
    /// Send one request to `unit` and wait for its answer
    ///
    /// `None` selects the framing's default unit. No timeout is applied
    /// here; the hub bounds every call.
    async fn call(&mut self, unit: Option<u8>, request: &Request) -> ModbusResult<Response>;

    /// The last call was cancelled before its answer arrived
    ///
    /// Links without transaction ids must not hand that late answer to the
    /// next caller.
    fn abandon(&mut self) {}

    /// Release the underlying socket or port
    async fn close(&mut self) -> io::Result<()>;
}

/// Opens transports for hub configurations
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &HubConfig) -> io::Result<Box<dyn Transport>>;
}

/// Opens real sockets and serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkConnector;

#[async_trait]
impl Connector for LinkConnector {
    #[instrument(
        skip(self, config),
        fields(hub = %config.name, kind = config.transport.kind())
    )]
    async fn connect(&self, config: &HubConfig) -> io::Result<Box<dyn Transport>> {
        let transport: Box<dyn Transport> = match &config.transport {
            TransportConfig::Tcp(net) => {
                let stream = TcpStream::connect((net.host.as_str(), net.port)).await?;
                stream.set_nodelay(true)?;
                let peer = format!("{}:{}", net.host, net.port);
                Box::new(StreamTransport::new(stream, Framing::mbap(), peer))
            }
            TransportConfig::RtuOverTcp(net) => {
                let stream = TcpStream::connect((net.host.as_str(), net.port)).await?;
                stream.set_nodelay(true)?;
                let peer = format!("{}:{}", net.host, net.port);
                Box::new(StreamTransport::new(stream, Framing::Rtu, peer))
            }
            TransportConfig::Udp(net) => {
                Box::new(UdpTransport::connect(&net.host, net.port).await?)
            }
            TransportConfig::Serial(line) => {
                debug!(method = ?line.method, port = %line.port, "Opening serial line");
                Box::new(serial::open(line)?)
            }
        };
        debug!("Link open");
        Ok(transport)
    }
}
