//! Modbus-TCP protocol types: function codes, the MBAP header, register
//! requests and interpreted replies.
//!
//! Every frame on the wire is an *ADU* (Application Data Unit):
//!
//! ```text
//! [transaction_id:2][protocol_id:2 = 0x0000][length:2][unit_id:1][pdu:length-1]
//! ```
//!
//! The PDU (Protocol Data Unit) always starts with the function code.  All
//! multi-byte integers are big-endian.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of the MBAP header in bytes.
pub const MBAP_HEADER_SIZE: usize = 7;

/// The protocol id field is always zero for Modbus.
pub const MODBUS_PROTOCOL_ID: u16 = 0x0000;

/// Largest ADU allowed by the Modbus-TCP specification.
pub const MAX_ADU_SIZE: usize = 260;

/// Smallest declared length a reply may carry: unit id + function code.
/// Anything shorter cannot hold a PDU.
pub const MIN_DECLARED_LENGTH: u16 = 2;

/// Maximum registers a single 0x03 request may read.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Maximum registers a single 0x10 request may write.
pub const MAX_WRITE_QUANTITY: u16 = 123;

/// Bit set on the function code of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Device identifier carried in the last header byte (the Modbus "unit id").
pub type UnitId = u8;

// ── Function codes ────────────────────────────────────────────────────────────

/// Function codes the gateway knows how to frame.
///
/// Any other raw value is rejected before a frame is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Returns the raw wire byte.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(()),
        }
    }
}

// ── Exception codes ───────────────────────────────────────────────────────────

/// Modbus exception codes returned by devices in `[function | 0x80, code]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl TryFrom<u8> for ExceptionCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ExceptionCode::IllegalFunction),
            0x02 => Ok(ExceptionCode::IllegalDataAddress),
            0x03 => Ok(ExceptionCode::IllegalDataValue),
            0x04 => Ok(ExceptionCode::ServerDeviceFailure),
            _ => Err(()),
        }
    }
}

// ── MBAP header ───────────────────────────────────────────────────────────────

/// The 7-byte header prepended to every ADU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MbapHeader {
    /// Echoed back by the device in its reply.
    pub transaction_id: u16,
    /// Always [`MODBUS_PROTOCOL_ID`] on frames we build.
    pub protocol_id: u16,
    /// Number of bytes that follow the length field (unit id + PDU).
    pub length: u16,
    /// Addressed device.
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Number of PDU bytes that follow the header on the wire.
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// A register read or write as handed to the codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub function: FunctionCode,
    /// First register address.
    pub address: u16,
    /// Number of registers to read or write.
    pub quantity: u16,
    /// Values to write; ignored for reads.
    #[serde(default)]
    pub values: Vec<u16>,
}

impl RegisterRequest {
    /// Builds a Read Holding Registers request.
    pub fn read_holding_registers(address: u16, quantity: u16) -> Self {
        Self {
            function: FunctionCode::ReadHoldingRegisters,
            address,
            quantity,
            values: Vec::new(),
        }
    }

    /// Builds a Write Multiple Registers request; the quantity is taken from
    /// the number of values.
    pub fn write_multiple_registers(address: u16, values: Vec<u16>) -> Self {
        Self {
            function: FunctionCode::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            values,
        }
    }
}

// ── Interpreted replies ───────────────────────────────────────────────────────

/// A device reply, interpreted for callers that want more than raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Register values returned by a 0x03 read.
    Registers(Vec<u16>),
    /// Acknowledgement of a 0x10 write.
    WriteAck { address: u16, quantity: u16 },
    /// The device refused the request.
    Exception { function: u8, code: u8 },
}

impl Reply {
    /// Returns `true` when the device answered with an exception PDU.
    pub fn is_exception(&self) -> bool {
        matches!(self, Reply::Exception { .. })
    }
}
