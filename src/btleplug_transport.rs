//! [`Transport`] over a local Bluetooth adapter using `btleplug`.

use crate::transport::{NotificationSink, Transport, TransportError};
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Characteristic the request frames are written to.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);
/// Characteristic the device answers on.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_POLL: Duration = Duration::from_millis(500);

fn io_error(err: btleplug::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

/// Finishes setting up a connected peripheral. A failed setup disconnects it
/// again, otherwise the device would stay held by this host.
async fn setup_or_release<T, E: Display>(
    setup: impl Future<Output = Result<T, TransportError>>,
    release: impl Future<Output = Result<(), E>>,
) -> Result<T, TransportError> {
    let result = setup.await;
    if let Err(err) = &result {
        log::warn!("Setting up the connection failed: {err}");
        if let Err(err) = release.await {
            log::debug!("Disconnect after failed setup failed: {err}");
        }
    }
    result
}

struct Link {
    peripheral: Peripheral,
    write: Characteristic,
    notify: Characteristic,
    forwarder: Option<JoinHandle<()>>,
}

pub struct BtleplugTransport {
    adapter: Adapter,
    link: Mutex<Option<Link>>,
}

impl BtleplugTransport {
    /// Opens the adapter whose name starts with `adapter_name` (e.g. `hci0`),
    /// or the first adapter.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(io_error)?;
        let adapters = manager.adapters().await.map_err(io_error)?;
        let mut selected = None;
        for adapter in adapters {
            let info = adapter.adapter_info().await.map_err(io_error)?;
            log::debug!("Found Bluetooth adapter {info}");
            match adapter_name {
                Some(name) if !info.starts_with(name) => continue,
                _ => {
                    selected = Some(adapter);
                    break;
                }
            }
        }
        let adapter = selected.ok_or_else(|| {
            TransportError::NotFound(format!(
                "Bluetooth adapter {}",
                adapter_name.unwrap_or("(any)")
            ))
        })?;
        Ok(Self {
            adapter,
            link: Mutex::new(None),
        })
    }

    async fn find(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(io_error)?;
        let deadline = tokio::time::Instant::now() + SCAN_TIMEOUT;
        let found = loop {
            let peripherals = self.adapter.peripherals().await.map_err(io_error)?;
            if let Some(peripheral) = peripherals
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            {
                break Some(peripheral);
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };
        if let Err(err) = self.adapter.stop_scan().await {
            log::debug!("Stopping scan failed: {err}");
        }
        Ok(found)
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| TransportError::NotFound(format!("characteristic {uuid}")))
    }

    fn peripheral(&self) -> Result<(Peripheral, Characteristic, Characteristic), TransportError> {
        self.link
            .lock()
            .as_ref()
            .map(|link| (link.peripheral.clone(), link.write.clone(), link.notify.clone()))
            .ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        // The device stops advertising while another client is connected.
        let Some(peripheral) = self.find(address).await? else {
            log::warn!("{address} is not advertising");
            return Err(TransportError::ExclusiveLock);
        };
        if let Err(err) = peripheral.connect().await {
            log::warn!("Connecting to {address} failed: {err}");
            return Err(TransportError::ExclusiveLock);
        }
        let (write, notify) = setup_or_release(
            async {
                peripheral.discover_services().await.map_err(io_error)?;
                let write = Self::characteristic(&peripheral, WRITE_CHARACTERISTIC)?;
                let notify = Self::characteristic(&peripheral, NOTIFY_CHARACTERISTIC)?;
                Ok((write, notify))
            },
            peripheral.disconnect(),
        )
        .await?;
        log::debug!("Connected to {address}");
        *self.link.lock() = Some(Link {
            peripheral,
            write,
            notify,
            forwarder: None,
        });
        Ok(())
    }

    async fn subscribe_notifications(&self, sink: NotificationSink) -> Result<(), TransportError> {
        let (peripheral, _, notify) = self.peripheral()?;
        let mut notifications = peripheral.notifications().await.map_err(io_error)?;
        peripheral.subscribe(&notify).await.map_err(io_error)?;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != NOTIFY_CHARACTERISTIC {
                    continue;
                }
                if sink.send(notification.value).await.is_err() {
                    break;
                }
            }
            log::debug!("Notification stream ended");
        });
        if let Some(link) = self.link.lock().as_mut() {
            if let Some(previous) = link.forwarder.replace(forwarder) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let (peripheral, write, _) = self.peripheral()?;
        peripheral
            .write(&write, bytes, WriteType::WithResponse)
            .await
            .map_err(|err| {
                log::debug!("Write failed: {err}");
                TransportError::Disconnected
            })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return Ok(());
        };
        if let Some(forwarder) = link.forwarder {
            forwarder.abort();
        }
        if let Err(err) = link.peripheral.unsubscribe(&link.notify).await {
            log::debug!("Unsubscribe failed: {err}");
        }
        link.peripheral.disconnect().await.map_err(io_error)
    }
}
