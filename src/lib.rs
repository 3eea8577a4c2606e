#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bluetti_lib
//!
//! This crate provides a driver for Bluetti power stations speaking a
//! Modbus-style register protocol over Bluetooth Low Energy.
//!
//! The library is layered the way data flows through it: the [`protocol`]
//! frame codec, the [`registers`] map turning register words into domain
//! values, the single in-flight [`dispatcher`], the [`connection`] state
//! machine and the [`poller`] producing snapshots. [`Driver`] ties them
//! together behind an event stream.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bluetti` command-line tool.
//! - `btleplug`: Enables [`BtleplugTransport`], the Bluetooth transport using the `btleplug` crate.
//! - `bin-dependencies`: Enables all features required by the `bluetti` binary executable (currently `btleplug`).

/// Contains error types for the library.
mod error;

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod driver;
pub mod poller;
/// Frame codec of the wire protocol.
pub mod protocol;
pub mod registers;
pub mod schedule;
pub mod session;
pub mod transport;

/// Bluetooth transport using `btleplug`.
#[cfg_attr(docsrs, doc(cfg(feature = "btleplug")))]
#[cfg(feature = "btleplug")]
pub mod btleplug_transport;

pub use config::{DebugLevel, DriverConfig};
pub use driver::{Driver, DriverEvent, DriverEvents};
pub use error::{Error, Result};
pub use poller::{Reading, Snapshot};
pub use registers::{DomainValue, RegisterMap};
pub use session::ConnectionState;
pub use transport::{NotificationSink, Transport, TransportError};

#[cfg(feature = "btleplug")]
pub use btleplug_transport::BtleplugTransport;
