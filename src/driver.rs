//! Host facing driver handle.
//!
//! # Example
//!
//! ```no_run
//! use bluetti_lib::{DomainValue, Driver, DriverConfig, DriverEvent, Transport};
//! use std::sync::Arc;
//!
//! # async fn run(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let (driver, mut events) = Driver::start(DriverConfig::new("AA:BB:CC:DD:EE:FF"), transport)?;
//!
//! while let Some(event) = events.recv().await {
//!     if let DriverEvent::Snapshot(snapshot) = event {
//!         println!("{:?}", snapshot.value("total_battery_percent"));
//!         driver.submit_control("ac_output_on", DomainValue::Switch(true)).await?;
//!         break;
//!     }
//! }
//! driver.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::DriverConfig;
use crate::connection::{ConnectionManager, ControlRequest};
use crate::dispatcher::Dispatcher;
use crate::poller::{Poller, Snapshot};
use crate::registers::{DomainValue, RegisterMap};
use crate::session::{ConnectionState, DeviceSession, SharedSession};
use crate::transport::Transport;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_QUEUE: usize = 64;
const CONTROL_QUEUE: usize = 8;

/// Notifications published by the driver task.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Result of one poll cycle.
    Snapshot(Snapshot),
    StateChanged(ConnectionState),
    /// Another client holds the device's only connection slot.
    ExclusiveLock { address: String },
    /// A session or connection attempt failed; the driver keeps retrying.
    ConnectionDown { reason: String },
    ControlResult { field: String, outcome: Result<()> },
}

/// Receiving side of the driver's events.
#[derive(Debug)]
pub struct DriverEvents {
    receiver: mpsc::Receiver<DriverEvent>,
}

impl DriverEvents {
    /// Next event, `None` once the driver task has ended.
    pub async fn recv(&mut self) -> Option<DriverEvent> {
        self.receiver.recv().await
    }
}

pub struct Driver {
    session: SharedSession,
    map: Arc<RegisterMap>,
    controls: mpsc::Sender<ControlRequest>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Driver {
    /// Validates `config` and spawns the connection manager task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        mut config: DriverConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, DriverEvents)> {
        config.validate()?;
        let map = Arc::new(RegisterMap::device(config.schedule_layout.clone())?);
        let session = DeviceSession::shared(config.address.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            session.clone(),
            transport.clone(),
            config.request_timeout,
            config.retries,
        ));
        let poller = Poller::new(
            map.clone(),
            config.pack_slots.clone(),
            config.pack_select_delay,
        );
        let (events, receiver) = mpsc::channel(EVENT_QUEUE);
        let (controls, control_receiver) = mpsc::channel(CONTROL_QUEUE);
        let shutdown = CancellationToken::new();
        log::debug!(
            "Starting driver for {}, polling every {}",
            config.address,
            humantime::format_duration(config.poll_interval)
        );
        let manager = ConnectionManager::new(
            config,
            transport,
            session.clone(),
            dispatcher,
            poller,
            events,
            control_receiver,
            shutdown.clone(),
        );
        let task = tokio::spawn(manager.run());
        Ok((
            Self {
                session,
                map,
                controls,
                shutdown,
                task: Some(task),
            },
            DriverEvents { receiver },
        ))
    }

    pub fn state(&self) -> ConnectionState {
        self.session.lock().state()
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    /// Writes `value` to the writable field `field`.
    ///
    /// Field and value are checked before anything is queued, so
    /// [`Error::UnknownField`], [`Error::ReadOnlyField`] and
    /// [`Error::ValueOutOfRange`] return without touching the device.
    pub async fn submit_control(&self, field: &str, value: DomainValue) -> Result<()> {
        self.map.encode_field(field, &value)?;
        if self.state() != ConnectionState::Ready {
            return Err(Error::NotConnected);
        }
        let (reply, outcome) = oneshot::channel();
        self.controls
            .send(ControlRequest {
                field: field.to_string(),
                value,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        outcome.await.map_err(|_| Error::Cancelled)?
    }

    /// Cancels any in-flight exchange, disconnects and waits for the task.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                log::error!("Driver task failed: {err}");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
