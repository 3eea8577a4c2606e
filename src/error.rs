use crate::transport::TransportError;

/// Errors produced by the protocol, register map and driver layers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The outbound payload cannot be framed.
    #[error("cannot encode frame: {0}")]
    Encoding(String),
    /// CRC16 of an inbound frame does not match its trailer.
    #[error("checksum mismatch - calculated={calculated:04X} received={received:04X}")]
    Checksum { calculated: u16, received: u16 },
    /// Fewer bytes than address + function + CRC.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },
    #[error("unknown function code: 0x{0:02X}")]
    UnknownFunction(u8),
    /// The device answered with a Modbus exception.
    #[error("device exception 0x{code:02X} for function 0x{function:02X}")]
    DeviceException { function: u8, code: u8 },
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    /// A request is already in flight.
    #[error("a request is already pending")]
    Busy,
    #[error("connection refused, the device is held by another client")]
    ExclusiveLock,
    #[error("not connected")]
    NotConnected,
    /// The pending request was discarded by a disconnect or stop.
    #[error("request cancelled")]
    Cancelled,
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{0}' is read-only")]
    ReadOnlyField(String),
    #[error("field '{field}': raw value {raw} has no mapping")]
    UnknownEnumValue { field: String, raw: u16 },
    #[error("field '{field}': value {value} out of range")]
    ValueOutOfRange { field: String, value: String },
    #[error("field '{field}': expected {expected} value")]
    TypeMismatch { field: String, expected: &'static str },
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Inbound frame rejections. These never resolve or fail a pending request.
    pub fn is_frame_noise(&self) -> bool {
        matches!(
            self,
            Error::Checksum { .. } | Error::FrameTooShort { .. } | Error::UnknownFunction(_)
        )
    }

    /// Only timeouts are retried by the dispatcher.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Field-scoped data errors. The poll cycle degrades the field and carries on.
    pub fn is_field_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownEnumValue { .. } | Error::ValueOutOfRange { .. }
        )
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ExclusiveLock => Error::ExclusiveLock,
            other => Error::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
