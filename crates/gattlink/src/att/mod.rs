//! Attribute Protocol (ATT) codec
//!
//! Encoding and decoding of the ATT PDUs a GATT client exchanges with a
//! peripheral. All multi-byte fields are little-endian per the Bluetooth
//! core specification.

pub mod codec;
pub mod constants;
pub mod error;


pub use codec::AttPdu;
pub use constants::{ATT_DEFAULT_MTU, ATT_MAX_MTU};
pub use error::{AttErrorCode, DecodeError, EncodeError};
