//! Stub link for hub tests
//!
//! `StubDevice` behaves like an echoing register bank and records every
//! exchange that reaches it. It counts overlapping exchanges and can be told
//! to hang or to answer with an exception.

#![allow(dead_code)]

use async_trait::async_trait;
use ha_modbus::{
    Connector, ExceptionCode, HubConfig, ModbusResult, ProtocolError, Request, Response,
    Transport,
};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct StubDevice {
    registers: Mutex<HashMap<u16, u16>>,
    coils: Mutex<HashMap<u16, bool>>,
    exchanges: Mutex<Vec<(Option<u8>, Request)>>,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
    latency: Mutex<Duration>,
    hang: AtomicBool,
    /// Addresses at or above this answer with IllegalDataAddress
    limit: Mutex<Option<u16>>,
    closed: AtomicBool,
    abandoned: AtomicUsize,
    /// Answer with a response of the wrong kind
    mismatch: AtomicBool,
}

impl StubDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_limit(&self, limit: u16) {
        *self.limit.lock().unwrap() = Some(limit);
    }

    pub fn set_mismatch(&self, mismatch: bool) {
        self.mismatch.store(mismatch, Ordering::SeqCst);
    }

    /// Calls the hub gave up on
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn exchanges(&self) -> Vec<(Option<u8>, Request)> {
        self.exchanges.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.exchanges().into_iter().map(|(_, r)| r).collect()
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn register(&self, address: u16) -> u16 {
        self.registers
            .lock()
            .unwrap()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    fn address_of(request: &Request) -> u16 {
        match request {
            Request::ReadCoils(a, _)
            | Request::ReadDiscreteInputs(a, _)
            | Request::ReadInputRegisters(a, _)
            | Request::ReadHoldingRegisters(a, _)
            | Request::WriteSingleCoil(a, _)
            | Request::WriteSingleRegister(a, _)
            | Request::WriteMultipleRegisters(a, _) => *a,
        }
    }

    fn apply(&self, request: &Request) -> ModbusResult<Response> {
        if let Some(limit) = *self.limit.lock().unwrap() {
            if Self::address_of(request) >= limit {
                return Err(ProtocolError::Exception(ExceptionCode::IllegalDataAddress).into());
            }
        }

        let mut registers = self.registers.lock().unwrap();
        let mut coils = self.coils.lock().unwrap();
        let response = match request {
            Request::ReadCoils(a, n) => Response::ReadCoils(
                (0..*n).map(|i| coils.get(&(a + i)).copied().unwrap_or(false)).collect(),
            ),
            Request::ReadDiscreteInputs(a, n) => Response::ReadDiscreteInputs(
                (0..*n).map(|i| (a + i) % 2 == 1).collect(),
            ),
            Request::ReadInputRegisters(a, n) => {
                Response::ReadInputRegisters((0..*n).map(|i| a + i).collect())
            }
            Request::ReadHoldingRegisters(a, n) => Response::ReadHoldingRegisters(
                (0..*n)
                    .map(|i| registers.get(&(a + i)).copied().unwrap_or(0))
                    .collect(),
            ),
            Request::WriteSingleCoil(a, on) => {
                coils.insert(*a, *on);
                Response::WriteSingleCoil(*a, *on)
            }
            Request::WriteSingleRegister(a, v) => {
                registers.insert(*a, *v);
                Response::WriteSingleRegister(*a, *v)
            }
            Request::WriteMultipleRegisters(a, values) => {
                for (i, v) in values.iter().enumerate() {
                    registers.insert(a + i as u16, *v);
                }
                Response::WriteMultipleRegisters(*a, values.len() as u16)
            }
        };
        Ok(response)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct StubTransport {
    device: Arc<StubDevice>,
}

#[async_trait]
impl Transport for StubTransport {
    async fn call(&mut self, unit: Option<u8>, request: &Request) -> ModbusResult<Response> {
        let device = &self.device;
        if device.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            device.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let _in_flight = InFlight(&device.in_flight);

        device
            .exchanges
            .lock()
            .unwrap()
            .push((unit, request.clone()));

        let latency = *device.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if device.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if device.mismatch.load(Ordering::SeqCst) {
            return Ok(Response::WriteMultipleRegisters(0, 0));
        }
        device.apply(request)
    }

    fn abandon(&mut self) {
        self.device.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    async fn close(&mut self) -> io::Result<()> {
        self.device.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out transports bound to one shared device
#[derive(Default)]
pub struct StubConnector {
    device: Arc<StubDevice>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl StubConnector {
    pub fn new(device: Arc<StubDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            ..Default::default()
        })
    }

    pub fn refusing(device: Arc<StubDevice>) -> Arc<Self> {
        let connector = Self::new(device);
        connector.set_refuse(true);
        connector
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, _config: &HubConfig) -> io::Result<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "stub refused",
            ));
        }
        Ok(Box::new(StubTransport {
            device: Arc::clone(&self.device),
        }))
    }
}

pub fn stub_config(name: &str) -> HubConfig {
    HubConfig::tcp(name, "stub", 502).with_timeout(Duration::from_secs(1))
}
