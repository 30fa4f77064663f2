//! Error types for the gattlink library
//!
//! One taxonomy covers the whole client core. Transport and protocol
//! failures (`Connect*`, `ProtocolViolation`, `ConnectionLost`) are fatal
//! to the session; `RequestTimeout` and `Timeout` are the only categories
//! a caller may retry without reconnecting.

use std::time::Duration;

use thiserror::Error;

use crate::att::{AttErrorCode, DecodeError, EncodeError};
use crate::session::SessionState;

/// Errors surfaced by the GATT client core.
#[derive(Debug, Error)]
pub enum GattError {
    /// The connection handshake failed (peer rejection or local I/O).
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),

    /// The connection handshake did not complete within the deadline.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The operation is not valid in the session's current state.
    /// Surfaced immediately; retrying without a state change is a caller bug.
    #[error("operation not valid in session state {0:?}")]
    InvalidState(SessionState),

    /// No matching response arrived within the request deadline. The
    /// session stays connected and the in-flight slot is cleared.
    #[error("no response within {0:?}")]
    RequestTimeout(Duration),

    /// Another request is already outstanding on this session. ATT allows
    /// exactly one request/response exchange at a time.
    #[error("a request is already in flight")]
    RequestInFlight,

    /// A bounded wait for an event expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent a PDU the protocol state does not allow. Fatal: the
    /// session transitions to Closed.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The transport failed or closed underneath the session. Fatal; every
    /// pending operation fails with this error.
    #[error("connection lost")]
    ConnectionLost,

    /// The peer answered a request with an ATT Error Response.
    #[error("ATT error {code:?} on handle {handle:#06x}")]
    Peer { code: AttErrorCode, handle: u16 },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for GATT client operations.
pub type GattResult<T> = Result<T, GattError>;
