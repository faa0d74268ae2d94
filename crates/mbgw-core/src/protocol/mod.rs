//! Protocol module containing Modbus-TCP frame types and the binary codec.

pub mod codec;
pub mod messages;
pub mod transaction;

pub use codec::{
    decode_body, decode_header, decode_request, encode_exception, encode_request,
    encode_response, hex_dump, parse_reply, ProtocolError,
};
pub use messages::*;
pub use transaction::TransactionCounter;
