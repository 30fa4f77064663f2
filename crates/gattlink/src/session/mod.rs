//! GATT session
//!
//! Owns one transport channel and runs the ATT client discipline over it:
//! a single sequential request/response exchange at a time, with
//! peer-initiated notifications and indications routed to the
//! [`NotificationDispatcher`] independently of any outstanding request.
//!
//! A dedicated receive-loop thread is the sole reader of the transport and
//! the sole producer into the dispatcher, so a stalled caller can never
//! block notification delivery.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::addr::{AddressType, BdAddr};
use crate::att::constants::ATT_DEFAULT_MTU;
use crate::att::{AttPdu, DecodeError};
use crate::error::{GattError, GattResult};
use crate::transport::{Connector, Transport};

pub mod dispatch;

#[cfg(test)]
pub(crate) mod tests;

pub use dispatch::{
    Listener, NotificationDispatcher, NotificationEvent, NotificationKind, OverflowPolicy,
};

/// Lifecycle of a [`GattSession`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the single connection handshake.
    pub connect_timeout: Duration,
    /// Default deadline for one request/response exchange.
    pub request_timeout: Duration,
    /// Capacity of each listener's notification queue.
    pub queue_capacity: usize,
    /// What the receive loop does when a listener queue is full.
    pub overflow_policy: OverflowPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            queue_capacity: 32,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

/// One in-flight request awaiting its response.
struct Pending {
    request_opcode: u8,
    expected_opcode: u8,
    outcome: Option<GattResult<AttPdu>>,
}

/// Why the receive loop is tearing the session down.
enum Teardown {
    /// Orderly close, locally initiated or peer hang-up.
    Closed,
    /// Transport error underneath a live session.
    Lost,
    /// The peer broke the ATT discipline.
    Violation(String),
}

struct SessionShared {
    config: SessionConfig,
    state: Mutex<SessionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    pending: Mutex<Option<Pending>>,
    pending_cv: Condvar,
    dispatcher: NotificationDispatcher,
    mtu: Mutex<u16>,
}

/// A GATT client session over one transport channel.
pub struct GattSession {
    shared: Arc<SessionShared>,
    rx_thread: Mutex<Option<JoinHandle<()>>>,
}

impl GattSession {
    /// Creates an idle session. Nothing happens until [`connect`].
    ///
    /// [`connect`]: GattSession::connect
    pub fn new(config: SessionConfig) -> Self {
        let dispatcher =
            NotificationDispatcher::new(config.queue_capacity, config.overflow_policy);
        Self {
            shared: Arc::new(SessionShared {
                config,
                state: Mutex::new(SessionState::Idle),
                transport: Mutex::new(None),
                pending: Mutex::new(None),
                pending_cv: Condvar::new(),
                dispatcher,
                mtu: Mutex::new(ATT_DEFAULT_MTU),
            }),
            rx_thread: Mutex::new(None),
        }
    }

    /// Opens the transport and starts the receive loop.
    ///
    /// Exactly one handshake attempt, bounded by the configured connect
    /// timeout. Valid only from `Idle`; a concurrent or repeated call
    /// fails with [`GattError::InvalidState`]. On failure the session is
    /// `Closed` and the connect error is returned.
    pub fn connect<C: Connector>(
        &self,
        connector: &C,
        addr: &BdAddr,
        addr_type: AddressType,
    ) -> GattResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Idle {
                return Err(GattError::InvalidState(*state));
            }
            *state = SessionState::Connecting;
        }

        let channel = match connector.open(addr, addr_type, self.shared.config.connect_timeout) {
            Ok(channel) => channel,
            Err(err) => {
                warn!("connect to {addr} failed: {err}");
                *self.shared.state.lock().unwrap() = SessionState::Closed;
                self.shared.dispatcher.close();
                return Err(err);
            }
        };

        let transport: Arc<dyn Transport> = Arc::new(channel);
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != SessionState::Connecting {
                // disconnect() raced the handshake; finish tearing down
                let _ = transport.close();
                *state = SessionState::Closed;
                self.shared.dispatcher.close();
                return Err(GattError::ConnectionLost);
            }
            *self.shared.transport.lock().unwrap() = Some(Arc::clone(&transport));
            *state = SessionState::Connected;
        }
        debug!("session connected to {addr} ({addr_type:?})");

        let shared = Arc::clone(&self.shared);
        let handle = match thread::Builder::new()
            .name("gattlink-rx".into())
            .spawn(move || receive_loop(shared, transport))
        {
            Ok(handle) => handle,
            Err(err) => {
                // Connected with no reader is a dead session; close it
                // rather than letting later requests time out.
                teardown(&self.shared, Teardown::Lost);
                return Err(GattError::Io(err));
            }
        };
        *self.rx_thread.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    /// Effective ATT MTU (23 until [`exchange_mtu`] negotiates more).
    ///
    /// [`exchange_mtu`]: GattSession::exchange_mtu
    pub fn mtu(&self) -> u16 {
        *self.shared.mtu.lock().unwrap()
    }

    /// Sends one request and waits for its response with the configured
    /// request timeout.
    pub fn request(&self, pdu: AttPdu) -> GattResult<AttPdu> {
        self.request_with_timeout(pdu, self.shared.config.request_timeout)
    }

    /// Sends one request and waits for its response.
    ///
    /// ATT permits a single outstanding request per bearer, so the session
    /// holds one in-flight slot: if it is occupied this fails immediately
    /// with [`GattError::RequestInFlight`] rather than queueing or
    /// interleaving. On timeout the slot is cleared, the session stays
    /// connected, and the caller may retry. An ATT Error Response resolves
    /// the exchange as [`GattError::Peer`], which is not fatal either.
    pub fn request_with_timeout(&self, pdu: AttPdu, timeout: Duration) -> GattResult<AttPdu> {
        let request_opcode = pdu.opcode();
        let expected_opcode = AttPdu::response_opcode_for(request_opcode).ok_or_else(|| {
            GattError::ProtocolViolation(format!(
                "opcode {request_opcode:#04x} is not a request"
            ))
        })?;

        let transport = self.connected_transport()?;
        let bytes = pdu.encode(self.mtu())?;

        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.is_some() {
                return Err(GattError::RequestInFlight);
            }
            *pending = Some(Pending {
                request_opcode,
                expected_opcode,
                outcome: None,
            });
        }

        if let Err(err) = transport.send(&bytes) {
            warn!("send failed, closing session: {err}");
            teardown(&self.shared, Teardown::Lost);
            return Err(GattError::ConnectionLost);
        }

        self.await_response(timeout)
    }

    fn await_response(&self, timeout: Duration) -> GattResult<AttPdu> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock().unwrap();
        loop {
            match pending.as_mut() {
                Some(slot) if slot.outcome.is_some() => {
                    let slot = pending.take().unwrap();
                    return slot.outcome.unwrap();
                }
                Some(_) => {}
                // The slot never vanishes underneath the requester;
                // teardown resolves it instead of clearing it.
                None => return Err(GattError::ConnectionLost),
            }
            let now = Instant::now();
            if now >= deadline {
                // Clear the slot so a later request can proceed
                *pending = None;
                return Err(GattError::RequestTimeout(timeout));
            }
            let (next, _) = self
                .shared
                .pending_cv
                .wait_timeout(pending, deadline - now)
                .unwrap();
            pending = next;
        }
    }

    /// Negotiates the ATT MTU and returns the effective value used for
    /// every later exchange.
    pub fn exchange_mtu(&self, client_mtu: u16) -> GattResult<u16> {
        match self.request(AttPdu::ExchangeMtuRequest { client_mtu })? {
            AttPdu::ExchangeMtuResponse { server_mtu } => {
                let effective = client_mtu.min(server_mtu).max(ATT_DEFAULT_MTU);
                *self.shared.mtu.lock().unwrap() = effective;
                debug!("MTU negotiated: client {client_mtu}, server {server_mtu}, effective {effective}");
                Ok(effective)
            }
            other => Err(GattError::ProtocolViolation(format!(
                "unexpected response to MTU exchange: {other:?}"
            ))),
        }
    }

    /// Reads the value of the attribute at `handle`.
    pub fn read(&self, handle: u16) -> GattResult<Vec<u8>> {
        match self.request(AttPdu::ReadRequest { handle })? {
            AttPdu::ReadResponse { value } => Ok(value),
            other => Err(GattError::ProtocolViolation(format!(
                "unexpected response to read: {other:?}"
            ))),
        }
    }

    /// Writes `value` to the attribute at `handle` and waits for the
    /// acknowledgement.
    pub fn write(&self, handle: u16, value: &[u8]) -> GattResult<()> {
        match self.request(AttPdu::WriteRequest {
            handle,
            value: value.to_vec(),
        })? {
            AttPdu::WriteResponse => Ok(()),
            other => Err(GattError::ProtocolViolation(format!(
                "unexpected response to write: {other:?}"
            ))),
        }
    }

    /// Writes `value` to the attribute at `handle` without acknowledgement.
    pub fn write_command(&self, handle: u16, value: &[u8]) -> GattResult<()> {
        let transport = self.connected_transport()?;
        let bytes = AttPdu::WriteCommand {
            handle,
            value: value.to_vec(),
        }
        .encode(self.mtu())?;
        if let Err(err) = transport.send(&bytes) {
            warn!("send failed, closing session: {err}");
            teardown(&self.shared, Teardown::Lost);
            return Err(GattError::ConnectionLost);
        }
        Ok(())
    }

    /// Subscribes to the notification stream.
    ///
    /// Only events received after the subscription are delivered, so
    /// subscribe before provoking the peer.
    pub fn subscribe(&self) -> Listener {
        self.shared.dispatcher.subscribe()
    }

    /// Closes the session and unblocks every waiter.
    ///
    /// Idempotent, and safe to call while requests or listeners are
    /// blocked; they all fail with [`GattError::ConnectionLost`].
    pub fn disconnect(&self) -> GattResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                SessionState::Connected | SessionState::Connecting => {
                    *state = SessionState::Disconnecting;
                }
                SessionState::Disconnecting | SessionState::Closed => return Ok(()),
                SessionState::Idle => {
                    *state = SessionState::Closed;
                    self.shared.dispatcher.close();
                    return Ok(());
                }
            }
        }

        if let Some(transport) = self.shared.transport.lock().unwrap().clone() {
            let _ = transport.close();
        }

        // Closing the transport only reaches a receive loop blocked in
        // recv. Under the Block overflow policy it may instead be parked
        // in a full listener queue, so wake the dispatcher side too
        // before joining, and resolve the pending slot while at it.
        self.shared.dispatcher.close();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if let Some(slot) = pending.as_mut() {
                if slot.outcome.is_none() {
                    slot.outcome = Some(Err(GattError::ConnectionLost));
                }
            }
            self.shared.pending_cv.notify_all();
        }

        // The receive loop observes the closed transport and finalizes the
        // state; joining makes disconnect deterministic for the caller.
        let handle = self.rx_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        // connect() may still be mid-handshake with no receive loop yet;
        // make the terminal state unconditional.
        teardown(&self.shared, Teardown::Closed);
        Ok(())
    }

    fn connected_transport(&self) -> GattResult<Arc<dyn Transport>> {
        let state = *self.shared.state.lock().unwrap();
        if state != SessionState::Connected {
            return Err(GattError::InvalidState(state));
        }
        self.shared
            .transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(GattError::InvalidState(state))
    }
}

impl Drop for GattSession {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Reads, decodes, and routes inbound PDUs until the channel dies.
fn receive_loop(shared: Arc<SessionShared>, transport: Arc<dyn Transport>) {
    loop {
        match transport.recv() {
            Ok(Some(bytes)) => match AttPdu::decode(&bytes) {
                Ok(pdu) => {
                    if let Err(cause) = route_pdu(&shared, &transport, pdu) {
                        teardown(&shared, cause);
                        return;
                    }
                }
                Err(err) => {
                    warn!("undecodable PDU from peer ({}): {err}", hex::encode(&bytes));
                    teardown(&shared, Teardown::Violation(decode_violation(&err)));
                    return;
                }
            },
            Ok(None) => {
                debug!("transport closed");
                teardown(&shared, Teardown::Closed);
                return;
            }
            Err(err) => {
                warn!("transport error: {err}");
                teardown(&shared, Teardown::Lost);
                return;
            }
        }
    }
}

fn decode_violation(err: &DecodeError) -> String {
    format!("undecodable PDU: {err}")
}

/// Classifies one inbound PDU: response to the outstanding request, event
/// for the dispatcher, or protocol violation.
fn route_pdu(
    shared: &Arc<SessionShared>,
    transport: &Arc<dyn Transport>,
    pdu: AttPdu,
) -> Result<(), Teardown> {
    match pdu {
        AttPdu::HandleValueNotification { handle, value } => {
            shared.dispatcher.publish(NotificationEvent {
                handle,
                value,
                kind: NotificationKind::Notification,
                received_at: Instant::now(),
            });
            Ok(())
        }
        AttPdu::HandleValueIndication { handle, value } => {
            shared.dispatcher.publish(NotificationEvent {
                handle,
                value,
                kind: NotificationKind::Indication,
                received_at: Instant::now(),
            });
            // Indications are acknowledged on the wire; encoding a bare
            // confirmation cannot fail.
            let confirmation = AttPdu::HandleValueConfirmation
                .encode(ATT_DEFAULT_MTU)
                .unwrap_or_else(|_| unreachable!());
            if let Err(err) = transport.send(&confirmation) {
                warn!("failed to confirm indication: {err}");
                return Err(Teardown::Lost);
            }
            Ok(())
        }
        AttPdu::ErrorResponse {
            request_opcode,
            handle,
            error_code,
        } => {
            let mut pending = shared.pending.lock().unwrap();
            match pending.as_mut() {
                Some(slot) if slot.outcome.is_none() && slot.request_opcode == request_opcode => {
                    slot.outcome = Some(Err(GattError::Peer {
                        code: error_code,
                        handle,
                    }));
                    shared.pending_cv.notify_all();
                    Ok(())
                }
                _ => Err(Teardown::Violation(format!(
                    "error response for {request_opcode:#04x} with no matching request"
                ))),
            }
        }
        response => {
            let opcode = response.opcode();
            let mut pending = shared.pending.lock().unwrap();
            match pending.as_mut() {
                Some(slot) if slot.outcome.is_none() && slot.expected_opcode == opcode => {
                    slot.outcome = Some(Ok(response));
                    shared.pending_cv.notify_all();
                    Ok(())
                }
                _ => Err(Teardown::Violation(format!(
                    "unexpected PDU {opcode:#04x} with no matching request"
                ))),
            }
        }
    }
}

/// Moves the session to `Closed`, closes the transport, resolves the
/// pending request, and wakes every listener. Idempotent.
fn teardown(shared: &Arc<SessionShared>, cause: Teardown) {
    {
        let mut state = shared.state.lock().unwrap();
        if let Teardown::Violation(ref msg) = cause {
            warn!("protocol violation, closing session: {msg}");
        }
        *state = SessionState::Closed;
    }

    if let Some(transport) = shared.transport.lock().unwrap().clone() {
        let _ = transport.close();
    }

    {
        let mut pending = shared.pending.lock().unwrap();
        if let Some(slot) = pending.as_mut() {
            if slot.outcome.is_none() {
                slot.outcome = Some(Err(match cause {
                    Teardown::Violation(msg) => GattError::ProtocolViolation(msg),
                    _ => GattError::ConnectionLost,
                }));
            }
        }
        shared.pending_cv.notify_all();
    }

    shared.dispatcher.close();
}
