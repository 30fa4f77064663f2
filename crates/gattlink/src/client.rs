//! GATT client facade
//!
//! Thin composition over [`GattSession`] for the common case: connect to a
//! peripheral by address, wait for it to push a value, read and write
//! attributes, disconnect. The facade subscribes to the notification
//! stream at connect time, so nothing the peer sends after the link is up
//! can be missed.

use std::time::Duration;

use crate::addr::{AddressType, BdAddr};
use crate::error::GattResult;
use crate::session::{GattSession, Listener, NotificationEvent, SessionConfig};
use crate::transport::{Connector, L2capConnector};

/// A connected GATT client.
pub struct GattClient {
    session: GattSession,
    events: Listener,
}

impl GattClient {
    /// Connects over the BlueZ L2CAP ATT channel.
    ///
    /// The address type must be supplied by the caller; peripherals
    /// advertise with either a public or a random address and the stack
    /// cannot guess which.
    pub fn connect(
        addr: &BdAddr,
        addr_type: AddressType,
        config: SessionConfig,
    ) -> GattResult<Self> {
        Self::connect_with(&L2capConnector, addr, addr_type, config)
    }

    /// Connects through any [`Connector`], for tests and alternative
    /// platform transports.
    pub fn connect_with<C: Connector>(
        connector: &C,
        addr: &BdAddr,
        addr_type: AddressType,
        config: SessionConfig,
    ) -> GattResult<Self> {
        let session = GattSession::new(config);
        // Subscribe before the receive loop starts so the very first
        // inbound notification is captured.
        let events = session.subscribe();
        session.connect(connector, addr, addr_type)?;
        Ok(Self { session, events })
    }

    /// Blocks until the peer pushes a value (notification or indication),
    /// bounded by `timeout`.
    pub fn wait_for_first_notification(&self, timeout: Duration) -> GattResult<NotificationEvent> {
        self.events.next(timeout)
    }

    /// Reads the value of the attribute at `handle`.
    pub fn read(&self, handle: u16) -> GattResult<Vec<u8>> {
        self.session.read(handle)
    }

    /// Writes `value` to `handle` and waits for the acknowledgement.
    pub fn write(&self, handle: u16, value: &[u8]) -> GattResult<()> {
        self.session.write(handle, value)
    }

    /// Writes `value` to `handle` without acknowledgement.
    pub fn write_command(&self, handle: u16, value: &[u8]) -> GattResult<()> {
        self.session.write_command(handle, value)
    }

    /// Negotiates the ATT MTU.
    pub fn exchange_mtu(&self, client_mtu: u16) -> GattResult<u16> {
        self.session.exchange_mtu(client_mtu)
    }

    /// Closes the session. Idempotent.
    pub fn disconnect(&self) -> GattResult<()> {
        self.session.disconnect()
    }

    /// The underlying session, for state inspection and extra listeners.
    pub fn session(&self) -> &GattSession {
        &self.session
    }
}
