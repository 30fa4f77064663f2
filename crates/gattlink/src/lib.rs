//! GattLink - a minimal BLE GATT client core
//!
//! This library implements the client side of the Bluetooth Attribute
//! Protocol (ATT) over a single connection-oriented link: it encodes and
//! decodes ATT PDUs, runs one sequential request/response exchange at a
//! time, and delivers peer-initiated notifications and indications through
//! a bounded, ordered event queue. Transport access is abstracted behind
//! the [`transport::Transport`] trait; a BlueZ L2CAP socket implementation
//! over the ATT fixed channel is provided for Linux.

pub mod addr;
pub mod att;
pub mod client;
pub mod error;
pub mod session;
pub mod transport;

// Re-export common types for convenience
pub use addr::{AddressType, BdAddr};
pub use att::{AttErrorCode, AttPdu, DecodeError, EncodeError};
pub use client::GattClient;
pub use error::GattError;
pub use session::{
    GattSession, Listener, NotificationEvent, NotificationKind, OverflowPolicy, SessionConfig,
    SessionState,
};
pub use transport::{Connector, Transport};
