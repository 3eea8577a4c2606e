//! Modbus-style frame codec used over the BLE request/notify characteristics.
//!
//! ```text
//! +---------+----------+-------------+--------+--------+
//! | address | function | payload[N]  | crc_lo | crc_hi |
//! +---------+----------+-------------+--------+--------+
//! ```
//!
//! The CRC16 is the Modbus variant (reflected polynomial 0xA001, initial value
//! 0xFFFF) computed over every preceding byte and appended little-endian.
//! Register values inside payloads are big-endian.

use crate::{Error, Result};
use crc16::{State, MODBUS};

/// The device always answers as unit 1.
pub const DEVICE_ADDRESS: u8 = 0x01;
/// Largest Modbus RTU application data unit.
pub const MAX_FRAME_LENGTH: usize = 256;
/// Smallest decodable frame: address, function, one payload byte and the CRC.
pub const MIN_FRAME_LENGTH: usize = 5;
pub const MAX_PAYLOAD_LENGTH: usize = MAX_FRAME_LENGTH - HEADER_LENGTH - CRC_LENGTH;
/// Protocol limit for a single holding register read.
pub const MAX_READ_REGISTERS: u16 = 125;

const HEADER_LENGTH: usize = 2;
const CRC_LENGTH: usize = 2;
const EXCEPTION_FLAG: u8 = 0x80;
const WRITE_RESPONSE_LENGTH: usize = 8;
const EXCEPTION_RESPONSE_LENGTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteSingleRegister,
    WriteMultipleRegisters,
    /// Exception reply to the wrapped function.
    Exception(u8),
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleRegisters => 0x10,
            FunctionCode::Exception(function) => function | EXCEPTION_FLAG,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            c if c & EXCEPTION_FLAG != 0 => {
                let function = c & !EXCEPTION_FLAG;
                match Self::from_code(function) {
                    Ok(_) => Ok(FunctionCode::Exception(function)),
                    Err(_) => Err(Error::UnknownFunction(code)),
                }
            }
            _ => Err(Error::UnknownFunction(code)),
        }
    }
}

/// One complete, CRC-validated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub function: FunctionCode,
    pub payload: Vec<u8>,
}

pub fn crc(data: &[u8]) -> u16 {
    State::<MODBUS>::calculate(data)
}

/// Builds a frame and appends its CRC.
pub fn encode(address: u8, function: FunctionCode, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(Error::Encoding("empty payload".into()));
    }
    if payload.len() > MAX_PAYLOAD_LENGTH {
        return Err(Error::Encoding(format!(
            "payload of {} bytes exceeds {MAX_PAYLOAD_LENGTH}",
            payload.len()
        )));
    }
    let mut tx_buffer = Vec::with_capacity(HEADER_LENGTH + payload.len() + CRC_LENGTH);
    tx_buffer.push(address);
    tx_buffer.push(function.code());
    tx_buffer.extend_from_slice(payload);
    let checksum = crc(&tx_buffer);
    tx_buffer.extend_from_slice(&checksum.to_le_bytes());
    Ok(tx_buffer)
}

fn validate_len(buffer: &[u8]) -> Result<()> {
    if buffer.len() < MIN_FRAME_LENGTH {
        log::debug!(
            "Invalid frame size - required={} received={}",
            MIN_FRAME_LENGTH,
            buffer.len()
        );
        return Err(Error::FrameTooShort {
            expected: MIN_FRAME_LENGTH,
            actual: buffer.len(),
        });
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8]) -> Result<()> {
    let (body, trailer) = buffer.split_at(buffer.len() - CRC_LENGTH);
    let calculated = crc(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} buffer={buffer:02X?}"
        );
        return Err(Error::Checksum {
            calculated,
            received,
        });
    }
    Ok(())
}

/// Validates and splits a frame. Never partially trusts a frame: any failure
/// rejects it as a whole.
pub fn decode(rx_buffer: &[u8]) -> Result<Frame> {
    validate_len(rx_buffer)?;
    validate_checksum(rx_buffer)?;
    let function = FunctionCode::from_code(rx_buffer[1])?;
    Ok(Frame {
        address: rx_buffer[0],
        function,
        payload: rx_buffer[HEADER_LENGTH..rx_buffer.len() - CRC_LENGTH].to_vec(),
    })
}

/// Register words carried by a matched reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub words: Vec<u16>,
}

fn words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// The operations this driver issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadHoldingRegisters { start: u16, count: u16 },
    WriteSingleRegister { register: u16, value: u16 },
}

impl Command {
    pub fn read_holding_registers(start: u16, count: u16) -> Self {
        Command::ReadHoldingRegisters { start, count }
    }

    pub fn write_single_register(register: u16, value: u16) -> Self {
        Command::WriteSingleRegister { register, value }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Command::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Command::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
        }
    }

    pub fn request(&self) -> Result<Vec<u8>> {
        let (first, second) = match *self {
            Command::ReadHoldingRegisters { start, count } => {
                if count == 0 || count > MAX_READ_REGISTERS {
                    return Err(Error::Encoding(format!(
                        "register count {count} outside 1..={MAX_READ_REGISTERS}"
                    )));
                }
                (start, count)
            }
            Command::WriteSingleRegister { register, value } => (register, value),
        };
        let mut payload = [0u8; 4];
        payload[..2].copy_from_slice(&first.to_be_bytes());
        payload[2..].copy_from_slice(&second.to_be_bytes());
        encode(DEVICE_ADDRESS, self.function(), &payload)
    }

    pub fn reply_size(&self) -> usize {
        match self {
            Command::ReadHoldingRegisters { count, .. } => {
                HEADER_LENGTH + 1 + 2 * usize::from(*count) + CRC_LENGTH
            }
            Command::WriteSingleRegister { .. } => WRITE_RESPONSE_LENGTH,
        }
    }

    /// Whether `frame` has the shape of the reply to this command.
    /// Exception replies for the same function match too.
    pub fn matches(&self, frame: &Frame) -> bool {
        if frame.address != DEVICE_ADDRESS {
            return false;
        }
        if frame.function == FunctionCode::Exception(self.function().code()) {
            return frame.payload.len() == 1;
        }
        match *self {
            Command::ReadHoldingRegisters { count, .. } => {
                let byte_count = 2 * usize::from(count);
                frame.function == FunctionCode::ReadHoldingRegisters
                    && frame.payload.len() == 1 + byte_count
                    && usize::from(frame.payload[0]) == byte_count
            }
            Command::WriteSingleRegister { register, value } => {
                frame.function == FunctionCode::WriteSingleRegister
                    && words(&frame.payload) == [register, value]
            }
        }
    }

    /// Converts a matching reply into register words.
    pub fn decode(&self, frame: &Frame) -> Result<Response> {
        if let FunctionCode::Exception(function) = frame.function {
            return Err(Error::DeviceException {
                function,
                code: frame.payload.first().copied().unwrap_or_default(),
            });
        }
        let data = match self {
            Command::ReadHoldingRegisters { .. } => &frame.payload[1..],
            Command::WriteSingleRegister { .. } => &frame.payload[..],
        };
        Ok(Response { words: words(data) })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::ReadHoldingRegisters { start, count } => {
                write!(f, "ReadHoldingRegisters(start={start}, count={count})")
            }
            Command::WriteSingleRegister { register, value } => {
                write!(f, "WriteSingleRegister(register={register}, value={value})")
            }
        }
    }
}

/// Reassembles frames from BLE notifications.
///
/// A reply may be split across several notifications, and notifications may
/// carry leftovers of an earlier exchange. The expected length is derived from
/// the function code; bytes that cannot start a frame are dropped one at a time.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_LENGTH),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() > 2 * MAX_FRAME_LENGTH {
            log::warn!("Dropping {} unframed bytes", self.buffer.len());
            self.buffer.clear();
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn expected_len(&self) -> Option<std::result::Result<usize, u8>> {
        let function = *self.buffer.get(1)?;
        let len = match FunctionCode::from_code(function) {
            Ok(FunctionCode::ReadHoldingRegisters) => {
                HEADER_LENGTH + 1 + usize::from(*self.buffer.get(2)?) + CRC_LENGTH
            }
            Ok(FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters) => {
                WRITE_RESPONSE_LENGTH
            }
            Ok(FunctionCode::Exception(_)) => EXCEPTION_RESPONSE_LENGTH,
            Err(_) => return Some(Err(function)),
        };
        Some(Ok(len))
    }

    /// Returns the next complete frame, a rejected candidate, or `None` when
    /// more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            if self.buffer.first()? != &DEVICE_ADDRESS {
                self.buffer.remove(0);
                continue;
            }
            let expected = match self.expected_len()? {
                Ok(len) if len <= MAX_FRAME_LENGTH => len,
                Ok(_) => {
                    self.buffer.remove(0);
                    continue;
                }
                Err(function) => {
                    self.buffer.remove(0);
                    return Some(Err(Error::UnknownFunction(function)));
                }
            };
            if self.buffer.len() < expected {
                return None;
            }
            return match decode(&self.buffer[..expected]) {
                Ok(frame) => {
                    self.buffer.drain(..expected);
                    Some(Ok(frame))
                }
                Err(err) => {
                    self.buffer.remove(0);
                    Some(Err(err))
                }
            };
        }
    }
}
