//! Per-device session record shared by the connection manager and the
//! dispatcher.

use crate::protocol::{Command, Response};
use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    /// The dispatcher only operates while the link is up.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ConnectionState::Handshaking | ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{name}")
    }
}

/// The single outstanding request.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub tag: u64,
    pub command: Command,
    pub issued_at: Instant,
    pub reply: oneshot::Sender<Result<Response>>,
}

#[derive(Debug)]
pub struct DeviceSession {
    pub address: String,
    pub(crate) state: ConnectionState,
    pub retry_count: u32,
    pub last_success: Option<Instant>,
    pub consecutive_timeouts: u32,
    pub(crate) pending: Option<PendingRequest>,
    next_tag: u64,
}

pub type SharedSession = Arc<Mutex<DeviceSession>>;

impl DeviceSession {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_success: None,
            consecutive_timeouts: 0,
            pending: None,
            next_tag: 0,
        }
    }

    pub fn shared(address: impl Into<String>) -> SharedSession {
        Arc::new(Mutex::new(Self::new(address)))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Correlation tag of the pending request, if any.
    pub fn pending_tag(&self) -> Option<u64> {
        self.pending.as_ref().map(|pending| pending.tag)
    }

    pub(crate) fn next_tag(&mut self) -> u64 {
        self.next_tag = self.next_tag.wrapping_add(1);
        self.next_tag
    }

    /// Any matched reply proves the link is alive.
    pub(crate) fn record_success(&mut self) {
        self.last_success = Some(Instant::now());
        self.consecutive_timeouts = 0;
    }

    /// Switches to `state` and returns the previous one.
    pub(crate) fn transition(&mut self, state: ConnectionState) -> ConnectionState {
        let previous = std::mem::replace(&mut self.state, state);
        if previous != state {
            log::info!("Connection to {} {previous} -> {state}", self.address);
        }
        previous
    }
}
