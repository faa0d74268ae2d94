//! Binary codec for Modbus-TCP application data units.
//!
//! Wire format:
//! ```text
//! [transaction_id:2][protocol_id:2][length:2][unit_id:1][function:1][data:length-2]
//! ```
//! Header size: 7 bytes. All multi-byte integers are big-endian.
//!
//! The codec is pure: no I/O and no state.  The gateway uses the request side
//! ([`encode_request`], [`decode_header`], [`decode_body`]); the device
//! simulator uses the server side ([`decode_request`], [`encode_response`],
//! [`encode_exception`]).  [`parse_reply`] is an optional helper for callers
//! that want register values instead of raw reply bytes.

use std::fmt::Write as _;

use crate::protocol::messages::{
    ExceptionCode, FunctionCode, MbapHeader, RegisterRequest, Reply, UnitId, EXCEPTION_FLAG,
    MBAP_HEADER_SIZE, MIN_DECLARED_LENGTH, MODBUS_PROTOCOL_ID,
};
use thiserror::Error;

/// Errors that can occur while building or parsing a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame requires.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The frame is structurally inconsistent (bad declared length, byte count, …).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The function code is outside the supported set.
    #[error("unsupported function code: 0x{0:02X}")]
    UnsupportedFunction(u8),

    /// The request cannot be framed as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RegisterRequest {
    /// Checks that the request can be framed.
    ///
    /// Reads are always framable.  A write must carry exactly `quantity`
    /// values and its byte count (`2 × quantity`) must fit in one byte.
    /// Address and quantity ranges are left for the device to judge.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidRequest`] for an unframable write.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.function != FunctionCode::WriteMultipleRegisters {
            return Ok(());
        }
        if self.values.len() != usize::from(self.quantity) {
            return Err(ProtocolError::InvalidRequest(format!(
                "write quantity is {} but {} value(s) were supplied",
                self.quantity,
                self.values.len()
            )));
        }
        if usize::from(self.quantity) * 2 > usize::from(u8::MAX) {
            return Err(ProtocolError::InvalidRequest(format!(
                "write of {} registers does not fit a one-byte byte count",
                self.quantity
            )));
        }
        Ok(())
    }
}

// ── Request side ──────────────────────────────────────────────────────────────

/// Encodes a request ADU addressed to `unit_id`.
///
/// The transaction id is **not** generated here – pass the value obtained
/// from the device's [`crate::protocol::TransactionCounter`].
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidRequest`] if [`RegisterRequest::validate`]
/// fails.
///
/// # Examples
///
/// ```rust
/// use mbgw_core::protocol::{encode_request, RegisterRequest};
///
/// let req = RegisterRequest::read_holding_registers(0, 1);
/// let adu = encode_request(1, 1, &req).unwrap();
/// assert_eq!(adu, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
/// ```
pub fn encode_request(
    unit_id: UnitId,
    transaction_id: u16,
    request: &RegisterRequest,
) -> Result<Vec<u8>, ProtocolError> {
    request.validate()?;

    let mut pdu = Vec::with_capacity(6 + request.values.len() * 2);
    pdu.push(request.function.code());
    pdu.extend_from_slice(&request.address.to_be_bytes());
    pdu.extend_from_slice(&request.quantity.to_be_bytes());

    if request.function == FunctionCode::WriteMultipleRegisters {
        // validate() guarantees this fits in a byte.
        pdu.push((request.quantity * 2) as u8);
        for value in &request.values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
    }

    Ok(frame(transaction_id, unit_id, &pdu))
}

/// Decodes the 7-byte MBAP header at the start of `bytes`.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] if fewer than 7 bytes are available.
/// - [`ProtocolError::MalformedFrame`] if the declared length is below 2; a
///   valid reply always carries the unit id plus at least a function code.
pub fn decode_header(bytes: &[u8]) -> Result<MbapHeader, ProtocolError> {
    if bytes.len() < MBAP_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: MBAP_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let header = MbapHeader {
        transaction_id: read_u16(bytes, 0),
        protocol_id: read_u16(bytes, 2),
        length: read_u16(bytes, 4),
        unit_id: bytes[6],
    };

    if header.length < MIN_DECLARED_LENGTH {
        return Err(ProtocolError::MalformedFrame(format!(
            "declared length {} is below the minimum of {MIN_DECLARED_LENGTH}",
            header.length
        )));
    }

    Ok(header)
}

/// Rebuilds the full reply ADU from a decoded header and the bytes that
/// followed it.
///
/// Exactly `length − 1` bytes of `body` are used; the reply is returned
/// unmodified and is not interpreted further.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `body` is too short.
pub fn decode_body(header: &MbapHeader, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let pdu_len = header.pdu_len();
    if body.len() < pdu_len {
        return Err(ProtocolError::InsufficientData {
            needed: pdu_len,
            available: body.len(),
        });
    }

    let mut adu = Vec::with_capacity(MBAP_HEADER_SIZE + pdu_len);
    write_header(&mut adu, header);
    adu.extend_from_slice(&body[..pdu_len]);
    Ok(adu)
}

/// Interprets a complete reply ADU.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the ADU is truncated, internally inconsistent,
/// or carries a function code this codec does not understand.
pub fn parse_reply(adu: &[u8]) -> Result<Reply, ProtocolError> {
    let header = decode_header(adu)?;
    let pdu = pdu_slice(&header, adu)?;

    let function = pdu[0];
    if function & EXCEPTION_FLAG != 0 {
        require_len(pdu, 2, "exception reply")?;
        return Ok(Reply::Exception {
            function: function & !EXCEPTION_FLAG,
            code: pdu[1],
        });
    }

    match FunctionCode::try_from(function) {
        Ok(FunctionCode::ReadHoldingRegisters) => {
            require_len(pdu, 2, "read reply")?;
            let byte_count = usize::from(pdu[1]);
            if byte_count % 2 != 0 {
                return Err(ProtocolError::MalformedFrame(format!(
                    "odd register byte count {byte_count}"
                )));
            }
            require_len(pdu, 2 + byte_count, "read reply values")?;
            let values = pdu[2..2 + byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(Reply::Registers(values))
        }
        Ok(FunctionCode::WriteMultipleRegisters) => {
            require_len(pdu, 5, "write reply")?;
            Ok(Reply::WriteAck {
                address: read_u16(pdu, 1),
                quantity: read_u16(pdu, 3),
            })
        }
        Err(()) => Err(ProtocolError::UnsupportedFunction(function)),
    }
}

// ── Device side ───────────────────────────────────────────────────────────────

/// Decodes a complete request ADU, the inverse of [`encode_request`].
///
/// # Errors
///
/// - [`ProtocolError::UnsupportedFunction`] for function codes other than
///   0x03 and 0x10.
/// - [`ProtocolError::MalformedFrame`] when a write's byte count disagrees
///   with its quantity.
/// - [`ProtocolError::InsufficientData`] for truncated frames.
pub fn decode_request(adu: &[u8]) -> Result<(MbapHeader, RegisterRequest), ProtocolError> {
    let header = decode_header(adu)?;
    let pdu = pdu_slice(&header, adu)?;

    let function =
        FunctionCode::try_from(pdu[0]).map_err(|_| ProtocolError::UnsupportedFunction(pdu[0]))?;
    require_len(pdu, 5, "request")?;
    let address = read_u16(pdu, 1);
    let quantity = read_u16(pdu, 3);

    let values = match function {
        FunctionCode::ReadHoldingRegisters => Vec::new(),
        FunctionCode::WriteMultipleRegisters => {
            require_len(pdu, 6, "write request")?;
            let byte_count = usize::from(pdu[5]);
            if byte_count != usize::from(quantity) * 2 {
                return Err(ProtocolError::MalformedFrame(format!(
                    "byte count {byte_count} does not match quantity {quantity}"
                )));
            }
            require_len(pdu, 6 + byte_count, "write request values")?;
            pdu[6..6 + byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect()
        }
    };

    Ok((
        header,
        RegisterRequest {
            function,
            address,
            quantity,
            values,
        },
    ))
}

/// Frames a reply PDU, echoing the request's transaction id and unit id.
pub fn encode_response(request_header: &MbapHeader, pdu: &[u8]) -> Vec<u8> {
    frame(request_header.transaction_id, request_header.unit_id, pdu)
}

/// Frames an exception reply `[function | 0x80, code]`.
pub fn encode_exception(request_header: &MbapHeader, function: u8, code: ExceptionCode) -> Vec<u8> {
    encode_response(request_header, &[function | EXCEPTION_FLAG, code as u8])
}

/// Formats bytes as space-separated upper-case hex, e.g. `"00 01 00 00"`.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{b:02X}");
    }
    out
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn frame(transaction_id: u16, unit_id: UnitId, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader {
        transaction_id,
        protocol_id: MODBUS_PROTOCOL_ID,
        length: (pdu.len() + 1) as u16,
        unit_id,
    };
    let mut buf = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
    write_header(&mut buf, &header);
    buf.extend_from_slice(pdu);
    buf
}

fn write_header(buf: &mut Vec<u8>, header: &MbapHeader) {
    buf.extend_from_slice(&header.transaction_id.to_be_bytes());
    buf.extend_from_slice(&header.protocol_id.to_be_bytes());
    buf.extend_from_slice(&header.length.to_be_bytes());
    buf.push(header.unit_id);
}

/// Returns the PDU that follows the header, checking it is fully present.
fn pdu_slice<'a>(header: &MbapHeader, adu: &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let end = MBAP_HEADER_SIZE + header.pdu_len();
    if adu.len() < end {
        return Err(ProtocolError::InsufficientData {
            needed: end,
            available: adu.len(),
        });
    }
    Ok(&adu[MBAP_HEADER_SIZE..end])
}

fn require_len(bytes: &[u8], needed: usize, what: &str) -> Result<(), ProtocolError> {
    if bytes.len() < needed {
        return Err(ProtocolError::MalformedFrame(format!(
            "{what}: need {needed} PDU bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
