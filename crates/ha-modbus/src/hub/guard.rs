//! Connection guard: lifecycle of the single transport a hub owns

use super::gate::TransactionGate;
use crate::config::HubConfig;
use crate::transport::Connector;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Lifecycle of a hub's link
///
/// `Uninitialized -> Connecting -> Ready`, back to `Uninitialized` when the
/// open fails, and `Closed` from anywhere. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HubState {
    Uninitialized = 0,
    Connecting = 1,
    Ready = 2,
    Closed = 3,
}

impl HubState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Connecting,
            2 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

pub(crate) struct ConnectionGuard {
    connector: Arc<dyn Connector>,
    state: AtomicU8,
    delay: Duration,
    settled: OnceCell<()>,
    gate: TransactionGate,
}

impl ConnectionGuard {
    pub(crate) fn new(config: &HubConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            state: AtomicU8::new(HubState::Uninitialized as u8),
            delay: config.settle_delay(),
            settled: OnceCell::new(),
            gate: TransactionGate::new(config.timeout),
        }
    }

    pub(crate) fn state(&self) -> HubState {
        HubState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state() == HubState::Ready
    }

    pub(crate) fn gate(&self) -> &TransactionGate {
        &self.gate
    }

    fn transition(&self, from: HubState, to: HubState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Open the transport unless one is open or being opened
    ///
    /// Failures are logged, never returned; the hub stays `Uninitialized`
    /// and its operations report `NoTransport`.
    pub(crate) async fn establish(&self, config: &HubConfig) -> HubState {
        if !self.transition(HubState::Uninitialized, HubState::Connecting) {
            debug!(hub = %config.name, state = %self.state(), "Establish skipped");
            return self.state();
        }

        let opened = tokio::time::timeout(config.timeout, self.connector.connect(config)).await;
        let transport = match opened {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => {
                error!(
                    hub = %config.name,
                    kind = config.transport.kind(),
                    "Connect failed: {}",
                    err
                );
                self.transition(HubState::Connecting, HubState::Uninitialized);
                return self.state();
            }
            Err(_) => {
                error!(
                    hub = %config.name,
                    kind = config.transport.kind(),
                    "Connect timed out after {:?}",
                    config.timeout
                );
                self.transition(HubState::Connecting, HubState::Uninitialized);
                return self.state();
            }
        };

        self.gate.install(transport).await;
        if self.transition(HubState::Connecting, HubState::Ready) {
            info!(hub = %config.name, kind = config.transport.kind(), "Hub connected");
        } else if let Some(mut transport) = self.gate.release().await {
            // torn down while the link was opening
            warn!(hub = %config.name, "Hub closed during connect, dropping link");
            if let Err(err) = transport.close().await {
                debug!(hub = %config.name, "Close after late connect failed: {}", err);
            }
        }
        self.state()
    }

    /// Sleep out the post-connect delay once; later callers pass straight through
    pub(crate) async fn settle(&self) {
        if self.delay.is_zero() {
            return;
        }
        let delay = self.delay;
        self.settled
            .get_or_init(|| async move {
                debug!(delay = ?delay, "Waiting for device to settle");
                tokio::time::sleep(delay).await;
            })
            .await;
    }

    /// Close the transport after any in-flight exchange and enter `Closed`
    pub(crate) async fn teardown(&self, name: &str) {
        let previous = HubState::from_u8(self.state.swap(HubState::Closed as u8, Ordering::AcqRel));
        if previous == HubState::Closed {
            return;
        }

        if let Some(mut transport) = self.gate.release().await {
            match transport.close().await {
                Ok(()) => info!(hub = %name, "Hub closed"),
                Err(err) => warn!(hub = %name, "Error closing link: {}", err),
            }
        } else {
            debug!(hub = %name, previous = %previous, "Hub closed without a link");
        }
    }
}
