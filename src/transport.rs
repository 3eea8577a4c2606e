//! The transport boundary consumed by the driver.
//!
//! The driver never talks to a BLE stack directly. It needs exactly four
//! operations from the link to the device, and relies on notifications being
//! delivered in the order the device sent them.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound notification payloads, one entry per GATT notification.
pub type NotificationSink = mpsc::Sender<Vec<u8>>;

/// Failures reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The device refused the connection because another client holds it.
    #[error("device is held by another client")]
    ExclusiveLock,
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("link dropped")]
    Disconnected,
    #[error("{0}")]
    Io(String),
}

/// Abstract link to the device: one write characteristic, one notify characteristic.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the link to the device with the given MAC address.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Forward every notification of the response characteristic to `sink`.
    ///
    /// Dropping the sender side signals that the link is gone.
    async fn subscribe_notifications(&self, sink: NotificationSink)
        -> Result<(), TransportError>;

    /// Write one request frame to the request characteristic.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
