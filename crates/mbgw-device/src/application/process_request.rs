//! ProcessRequestUseCase: answer one Modbus-TCP request frame.
//!
//! | Situation                                   | Reply                   |
//! |---------------------------------------------|-------------------------|
//! | fewer than 8 bytes, or unreadable header    | none (frame ignored)    |
//! | function other than 0x03 / 0x10            | exception 0x01          |
//! | quantity 0 or above the function's maximum  | exception 0x03          |
//! | byte count disagrees with quantity          | exception 0x03          |
//! | registers outside the bank                  | exception 0x02          |
//! | read                                        | `[0x03, n*2, values…]`  |
//! | write                                       | `[0x10, addr, qty]`     |
//!
//! Every reply echoes the request's transaction id and unit id.

use mbgw_core::protocol::messages::{
    ExceptionCode, MAX_READ_QUANTITY, MAX_WRITE_QUANTITY, MBAP_HEADER_SIZE,
};
use mbgw_core::protocol::{encode_exception, encode_response};
use mbgw_core::{decode_header, decode_request, FunctionCode, ProtocolError, RegisterRequest};
use tracing::debug;

use crate::domain::RegisterBank;

/// Smallest frame worth answering: header plus a function code.
const MIN_REQUEST_LEN: usize = MBAP_HEADER_SIZE + 1;

/// Processes `adu` against `bank` and returns the reply frame, if any.
pub fn process_request(bank: &mut RegisterBank, adu: &[u8]) -> Option<Vec<u8>> {
    if adu.len() < MIN_REQUEST_LEN {
        debug!(len = adu.len(), "ignoring short frame");
        return None;
    }
    let header = match decode_header(adu) {
        Ok(header) => header,
        Err(e) => {
            debug!("ignoring frame: {e}");
            return None;
        }
    };
    let function = adu[MBAP_HEADER_SIZE];

    let request = match decode_request(adu) {
        Ok((_, request)) => request,
        Err(ProtocolError::UnsupportedFunction(code)) => {
            return Some(encode_exception(&header, code, ExceptionCode::IllegalFunction));
        }
        Err(e) => {
            debug!("rejecting malformed request: {e}");
            return Some(encode_exception(&header, function, ExceptionCode::IllegalDataValue));
        }
    };

    let pdu = match request.function {
        FunctionCode::ReadHoldingRegisters => read_registers(bank, &request),
        FunctionCode::WriteMultipleRegisters => write_registers(bank, &request),
    };
    Some(match pdu {
        Ok(pdu) => encode_response(&header, &pdu),
        Err(code) => encode_exception(&header, function, code),
    })
}

fn read_registers(bank: &RegisterBank, request: &RegisterRequest) -> Result<Vec<u8>, ExceptionCode> {
    if request.quantity == 0 || request.quantity > MAX_READ_QUANTITY {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let values = bank.read(request.address, request.quantity)?;

    let mut pdu = Vec::with_capacity(2 + values.len() * 2);
    pdu.push(FunctionCode::ReadHoldingRegisters.code());
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(pdu)
}

fn write_registers(
    bank: &mut RegisterBank,
    request: &RegisterRequest,
) -> Result<Vec<u8>, ExceptionCode> {
    if request.quantity == 0 || request.quantity > MAX_WRITE_QUANTITY {
        return Err(ExceptionCode::IllegalDataValue);
    }
    bank.write(request.address, &request.values)?;

    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteMultipleRegisters.code());
    pdu.extend_from_slice(&request.address.to_be_bytes());
    pdu.extend_from_slice(&request.quantity.to_be_bytes());
    Ok(pdu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbgw_core::{encode_request, parse_reply, Reply};

    fn ask(bank: &mut RegisterBank, request: &RegisterRequest) -> Vec<u8> {
        let adu = encode_request(1, 42, request).unwrap();
        process_request(bank, &adu).expect("a reply")
    }

    #[test]
    fn test_read_first_register_matches_wire_example() {
        let mut bank = RegisterBank::default();
        let adu = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];

        let reply = process_request(&mut bank, &adu).unwrap();

        assert_eq!(
            reply,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_read_returns_initial_values() {
        let mut bank = RegisterBank::default();

        let reply = ask(&mut bank, &RegisterRequest::read_holding_registers(5, 3));

        assert_eq!(parse_reply(&reply), Ok(Reply::Registers(vec![5, 6, 7])));
        assert_eq!(&reply[..2], &[0x00, 42], "transaction id echoed");
    }

    #[test]
    fn test_write_echoes_address_and_quantity_then_read_sees_it() {
        // Arrange
        let mut bank = RegisterBank::default();

        // Act
        let ack = ask(
            &mut bank,
            &RegisterRequest::write_multiple_registers(20, vec![0x1234, 0x5678]),
        );
        let read = ask(&mut bank, &RegisterRequest::read_holding_registers(20, 2));

        // Assert
        assert_eq!(
            parse_reply(&ack),
            Ok(Reply::WriteAck {
                address: 20,
                quantity: 2
            })
        );
        assert_eq!(parse_reply(&read), Ok(Reply::Registers(vec![0x1234, 0x5678])));
    }

    #[test]
    fn test_out_of_range_read_is_illegal_address() {
        let mut bank = RegisterBank::default();

        let reply = ask(&mut bank, &RegisterRequest::read_holding_registers(500, 10));

        assert_eq!(
            parse_reply(&reply),
            Ok(Reply::Exception {
                function: 0x03,
                code: 0x02
            })
        );
    }

    #[test]
    fn test_zero_and_oversized_quantities_are_illegal_value() {
        let mut bank = RegisterBank::new(1000);

        for quantity in [0u16, 126] {
            let reply = ask(&mut bank, &RegisterRequest::read_holding_registers(0, quantity));
            assert_eq!(
                parse_reply(&reply),
                Ok(Reply::Exception {
                    function: 0x03,
                    code: 0x03
                })
            );
        }

        let reply = ask(
            &mut bank,
            &RegisterRequest::write_multiple_registers(0, vec![0; 124]),
        );
        assert_eq!(
            parse_reply(&reply),
            Ok(Reply::Exception {
                function: 0x10,
                code: 0x03
            })
        );
    }

    #[test]
    fn test_unknown_function_is_illegal_function() {
        let mut bank = RegisterBank::default();
        // Write Single Register (0x06) is not implemented.
        let adu = [0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x01, 0x00, 0x05];

        let reply = process_request(&mut bank, &adu).unwrap();

        assert_eq!(reply, vec![0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0x86, 0x01]);
    }

    #[test]
    fn test_byte_count_mismatch_is_illegal_value() {
        let mut bank = RegisterBank::default();
        // Quantity 2 but byte count 2 (should be 4).
        let adu = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x0B, 0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0x00,
            0x01, 0x00, 0x02,
        ];

        let reply = process_request(&mut bank, &adu).unwrap();

        assert_eq!(
            parse_reply(&reply),
            Ok(Reply::Exception {
                function: 0x10,
                code: 0x03
            })
        );
    }

    #[test]
    fn test_short_frame_is_ignored() {
        let mut bank = RegisterBank::default();
        assert_eq!(process_request(&mut bank, &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01]), None);
        assert_eq!(process_request(&mut bank, &[]), None);
    }
}
