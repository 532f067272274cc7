//! Transaction gate
//!
//! The transport slot lives behind a FIFO mutex. Holding the lock is the
//! right to run exactly one exchange; the guard drops on every exit path,
//! including when the calling future is cancelled.

use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{Request, Response};
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::Mutex;

pub(crate) struct TransactionGate {
    slot: Mutex<Option<Box<dyn Transport>>>,
    timeout: Duration,
}

impl TransactionGate {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            timeout,
        }
    }

    /// Put a freshly opened transport in the slot
    pub(crate) async fn install(&self, transport: Box<dyn Transport>) {
        *self.slot.lock().await = Some(transport);
    }

    /// Take the transport out once the in-flight exchange, if any, is done
    pub(crate) async fn release(&self) -> Option<Box<dyn Transport>> {
        self.slot.lock().await.take()
    }

    /// Run one exchange, bounded by the hub timeout
    ///
    /// On expiry the exchange is abandoned and the transport stays in the
    /// slot for the next caller, told to discard the late answer.
    pub(crate) async fn exchange(
        &self,
        unit: Option<u8>,
        request: &Request,
    ) -> ModbusResult<Response> {
        let mut slot = self.slot.lock().await;
        let transport = slot.as_mut().ok_or(ModbusError::NoTransport)?;

        let outcome = tokio::time::timeout(self.timeout, transport.call(unit, request)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                transport.abandon();
                Err(ModbusError::Timeout(self.timeout))
            }
        }
    }
}
