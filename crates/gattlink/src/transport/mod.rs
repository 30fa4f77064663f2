//! Transport channel abstraction
//!
//! One ordered, reliable, bidirectional PDU channel to a single peer
//! device. The session layer drives a [`Transport`] from two threads at
//! once (the receive loop blocks in [`Transport::recv`] while callers
//! send), so implementations take `&self` and synchronize internally.

use std::time::Duration;

use crate::addr::{AddressType, BdAddr};
use crate::error::GattResult;

pub mod socket;

pub use socket::{L2capConnector, L2capSocket};

/// A raw duplex PDU channel to one peer.
pub trait Transport: Send + Sync {
    /// Sends one PDU to the peer.
    fn send(&self, pdu: &[u8]) -> std::io::Result<()>;

    /// Blocks until the peer sends a PDU.
    ///
    /// Returns `Ok(None)` once the channel is closed in an orderly way,
    /// either by the peer or by [`Transport::close`]. PDUs are returned in
    /// the peer's send order. The sequence is not restartable: after
    /// `Ok(None)` or an error, every later call reports the channel closed.
    fn recv(&self) -> std::io::Result<Option<Vec<u8>>>;

    /// Closes the channel and unblocks any blocked `recv`. Idempotent.
    fn close(&self) -> std::io::Result<()>;
}

/// Opens transport channels to peers by address.
///
/// The seam between the session layer and the platform BLE capability.
/// `open` attempts exactly one connection handshake bounded by `timeout`
/// and fails fast on expiry or peer rejection; retry policy belongs to the
/// caller.
pub trait Connector {
    type Channel: Transport + 'static;

    fn open(
        &self,
        addr: &BdAddr,
        addr_type: AddressType,
        timeout: Duration,
    ) -> GattResult<Self::Channel>;
}
