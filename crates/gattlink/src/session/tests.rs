//! Unit tests for the GATT session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::addr::{AddressType, BdAddr};
use crate::att::constants::*;
use crate::att::{AttErrorCode, AttPdu};
use crate::error::{GattError, GattResult};
use crate::session::{
    GattSession, NotificationKind, SessionConfig, SessionState,
};
use crate::transport::{Connector, Transport};

/// Records every PDU the session puts on the wire.
struct SentLog {
    pdus: Mutex<Vec<Vec<u8>>>,
    cv: Condvar,
}

impl SentLog {
    fn new() -> Self {
        Self {
            pdus: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        }
    }

    fn push(&self, pdu: Vec<u8>) {
        let mut pdus = self.pdus.lock().unwrap();
        pdus.push(pdu);
        self.cv.notify_all();
    }

    fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut pdus = self.pdus.lock().unwrap();
        while pdus.len() < count {
            let now = Instant::now();
            assert!(
                now < deadline,
                "timed out waiting for {count} sent PDUs, have {}",
                pdus.len()
            );
            let (next, _) = self.cv.wait_timeout(pdus, deadline - now).unwrap();
            pdus = next;
        }
        pdus.clone()
    }
}

/// In-memory transport fed by the test acting as the peer device.
pub(crate) struct MockTransport {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    sent: Arc<SentLog>,
    closed: AtomicBool,
}

impl Transport for MockTransport {
    fn send(&self, pdu: &[u8]) -> std::io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        self.sent.push(pdu.to_vec());
        Ok(())
    }

    fn recv(&self) -> std::io::Result<Option<Vec<u8>>> {
        let inbound = self.inbound.lock().unwrap();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match inbound.recv_timeout(Duration::from_millis(5)) {
                Ok(pdu) => return Ok(Some(pdu)),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    fn close(&self) -> std::io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The peer's side of a [`MockTransport`].
pub(crate) struct TestPeer {
    tx: mpsc::Sender<Vec<u8>>,
    sent: Arc<SentLog>,
}

impl TestPeer {
    pub(crate) fn send(&self, bytes: &[u8]) {
        self.tx.send(bytes.to_vec()).unwrap();
    }

    /// Drops the sending side, which the session sees as the channel
    /// closing underneath it.
    fn hang_up(self) {}
}

pub(crate) fn mock_pair() -> (MockTransport, TestPeer) {
    let (tx, rx) = mpsc::channel();
    let sent = Arc::new(SentLog::new());
    let transport = MockTransport {
        inbound: Mutex::new(rx),
        sent: Arc::clone(&sent),
        closed: AtomicBool::new(false),
    };
    (transport, TestPeer { tx, sent })
}

pub(crate) struct MockConnector(Mutex<Option<MockTransport>>);

impl MockConnector {
    pub(crate) fn holding(transport: MockTransport) -> Self {
        Self(Mutex::new(Some(transport)))
    }
}

impl Connector for MockConnector {
    type Channel = MockTransport;

    fn open(
        &self,
        _addr: &BdAddr,
        _addr_type: AddressType,
        _timeout: Duration,
    ) -> GattResult<MockTransport> {
        self.0
            .lock()
            .unwrap()
            .take()
            .ok_or(GattError::ConnectTimeout(Duration::ZERO))
    }
}

struct RefusingConnector;

impl Connector for RefusingConnector {
    type Channel = MockTransport;

    fn open(
        &self,
        _addr: &BdAddr,
        _addr_type: AddressType,
        timeout: Duration,
    ) -> GattResult<MockTransport> {
        Err(GattError::ConnectTimeout(timeout))
    }
}

fn peer_addr() -> BdAddr {
    "00:11:22:33:FF:EE".parse().unwrap()
}

fn connected_session(config: SessionConfig) -> (GattSession, TestPeer) {
    let (transport, peer) = mock_pair();
    let session = GattSession::new(config);
    let connector = MockConnector(Mutex::new(Some(transport)));
    session
        .connect(&connector, &peer_addr(), AddressType::Public)
        .unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    (session, peer)
}

fn wait_for_state(session: &GattSession, expected: SessionState) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.state() != expected {
        assert!(
            Instant::now() < deadline,
            "session never reached {expected:?}, stuck in {:?}",
            session.state()
        );
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn first_notification_is_delivered() {
    let (session, peer) = connected_session(SessionConfig::default());
    let listener = session.subscribe();

    peer.send(&[ATT_HANDLE_VALUE_NTF, 0x2F, 0x00, 0x01, 0x00]);

    let event = listener.next(Duration::from_secs(1)).unwrap();
    assert_eq!(event.handle, 0x002F);
    assert_eq!(event.value, vec![0x01, 0x00]);
    assert_eq!(event.kind, NotificationKind::Notification);
}

#[test]
fn notifications_arrive_in_transport_order() {
    let (session, peer) = connected_session(SessionConfig::default());
    let listener = session.subscribe();

    for i in 0u8..5 {
        peer.send(&[ATT_HANDLE_VALUE_NTF, 0x2F, 0x00, i]);
    }

    for i in 0u8..5 {
        let event = listener.next(Duration::from_secs(1)).unwrap();
        assert_eq!(event.value, vec![i], "event {i} out of order");
    }
}

#[test]
fn every_listener_sees_the_same_order() {
    let (session, peer) = connected_session(SessionConfig::default());
    let first = session.subscribe();
    let second = session.subscribe();

    for i in 0u8..4 {
        peer.send(&[ATT_HANDLE_VALUE_NTF, 0x10, 0x00, i]);
    }

    for listener in [&first, &second] {
        for i in 0u8..4 {
            let event = listener.next(Duration::from_secs(1)).unwrap();
            assert_eq!(event.value, vec![i]);
        }
    }
}

#[test]
fn read_round_trip() {
    let (session, peer) = connected_session(SessionConfig::default());

    let responder = thread::spawn(move || {
        let sent = peer.sent.wait_for(1);
        assert_eq!(sent[0], vec![ATT_READ_REQ, 0x10, 0x00]);
        peer.send(&[ATT_READ_RSP, 0xAA, 0xBB]);
        peer
    });

    let value = session.read(0x0010).unwrap();
    assert_eq!(value, vec![0xAA, 0xBB]);
    assert_eq!(session.state(), SessionState::Connected);
    responder.join().unwrap();
}

#[test]
fn peer_error_response_is_not_fatal() {
    let (session, peer) = connected_session(SessionConfig::default());

    let responder = thread::spawn(move || {
        peer.sent.wait_for(1);
        // Error Response: request opcode, handle 0x0010, Invalid Handle
        peer.send(&[ATT_ERROR_RSP, ATT_READ_REQ, 0x10, 0x00, 0x01]);
        peer
    });

    let err = session.read(0x0010).unwrap_err();
    assert!(
        matches!(
            err,
            GattError::Peer {
                code: AttErrorCode::InvalidHandle,
                handle: 0x0010
            }
        ),
        "unexpected error: {err:?}"
    );
    // The session survives a peer-side error
    assert_eq!(session.state(), SessionState::Connected);

    let peer = responder.join().unwrap();
    let responder = thread::spawn(move || {
        peer.sent.wait_for(2);
        peer.send(&[ATT_READ_RSP, 0x07]);
        peer
    });
    assert_eq!(session.read(0x0011).unwrap(), vec![0x07]);
    responder.join().unwrap();
}

#[test]
fn transport_loss_fails_outstanding_request() {
    let (session, peer) = connected_session(SessionConfig::default());

    let responder = thread::spawn(move || {
        peer.sent.wait_for(1);
        peer.hang_up();
    });

    let err = session.read(0x0010).unwrap_err();
    assert!(
        matches!(err, GattError::ConnectionLost),
        "unexpected error: {err:?}"
    );
    wait_for_state(&session, SessionState::Closed);
    responder.join().unwrap();
}

#[test]
fn request_timeout_clears_the_slot() {
    let (session, peer) = connected_session(SessionConfig::default());

    let started = Instant::now();
    let err = session
        .request_with_timeout(AttPdu::ReadRequest { handle: 0x0010 }, Duration::from_millis(500))
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        matches!(err, GattError::RequestTimeout(_)),
        "unexpected error: {err:?}"
    );
    assert!(
        elapsed >= Duration::from_millis(450),
        "timed out too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(2),
        "timed out too late: {elapsed:?}"
    );
    assert_eq!(session.state(), SessionState::Connected);

    // The slot is free again: a second request completes normally
    let responder = thread::spawn(move || {
        peer.sent.wait_for(2);
        peer.send(&[ATT_READ_RSP, 0x01]);
    });
    assert_eq!(session.read(0x0011).unwrap(), vec![0x01]);
    responder.join().unwrap();
}

#[test]
fn only_one_request_may_be_in_flight() {
    let (session, peer) = connected_session(SessionConfig::default());
    let session = Arc::new(session);

    let background = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            session.request_with_timeout(
                AttPdu::ReadRequest { handle: 0x0001 },
                Duration::from_secs(2),
            )
        })
    };

    // The first request is on the wire and unanswered; the slot is taken
    peer.sent.wait_for(1);
    let err = session.read(0x0002).unwrap_err();
    assert!(
        matches!(err, GattError::RequestInFlight),
        "unexpected error: {err:?}"
    );

    peer.send(&[ATT_READ_RSP, 0x2A]);
    let response = background.join().unwrap().unwrap();
    assert_eq!(response, AttPdu::ReadResponse { value: vec![0x2A] });
}

#[test]
fn connect_is_rejected_outside_idle() {
    let (session, _peer) = connected_session(SessionConfig::default());
    let connector = MockConnector(Mutex::new(None));
    let err = session
        .connect(&connector, &peer_addr(), AddressType::Public)
        .unwrap_err();
    assert!(
        matches!(err, GattError::InvalidState(SessionState::Connected)),
        "unexpected error: {err:?}"
    );
}

#[test]
fn failed_connect_closes_the_session() {
    let session = GattSession::new(SessionConfig::default());
    let err = session
        .connect(&RefusingConnector, &peer_addr(), AddressType::Random)
        .unwrap_err();
    assert!(
        matches!(err, GattError::ConnectTimeout(_)),
        "unexpected error: {err:?}"
    );
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn request_is_rejected_before_connect() {
    let session = GattSession::new(SessionConfig::default());
    let err = session.read(0x0001).unwrap_err();
    assert!(
        matches!(err, GattError::InvalidState(SessionState::Idle)),
        "unexpected error: {err:?}"
    );
}

#[test]
fn disconnect_wakes_blocked_listeners_and_is_idempotent() {
    let (session, _peer) = connected_session(SessionConfig::default());
    let session = Arc::new(session);
    let listener = session.subscribe();

    let closer = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            session.disconnect().unwrap();
        })
    };

    let err = listener.next(Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(err, GattError::ConnectionLost),
        "unexpected error: {err:?}"
    );
    closer.join().unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    session.disconnect().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn disconnect_unblocks_a_receive_loop_stuck_on_a_full_queue() {
    // Capacity 1 with the Block policy: the second notification parks the
    // receive loop in the listener queue, where a transport shutdown
    // cannot reach it. Disconnect must still complete.
    let config = SessionConfig {
        queue_capacity: 1,
        ..SessionConfig::default()
    };
    let (session, peer) = connected_session(config);
    let listener = session.subscribe();

    peer.send(&[ATT_HANDLE_VALUE_NTF, 0x2F, 0x00, 0x00]);
    peer.send(&[ATT_HANDLE_VALUE_NTF, 0x2F, 0x00, 0x01]);

    // Give the loop time to queue the first event and park on the second.
    // The listener is deliberately not drained.
    thread::sleep(Duration::from_millis(50));

    let session = Arc::new(session);
    let closer = {
        let session = Arc::clone(&session);
        thread::spawn(move || session.disconnect())
    };

    let started = Instant::now();
    closer.join().unwrap().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "disconnect hung behind the blocked receive loop"
    );
    assert_eq!(session.state(), SessionState::Closed);

    // The event queued before the close is still deliverable
    assert_eq!(
        listener.next(Duration::from_secs(1)).unwrap().value,
        vec![0x00]
    );
}

#[test]
fn listener_subscribed_after_disconnect_sees_the_close() {
    let (session, _peer) = connected_session(SessionConfig::default());
    session.disconnect().unwrap();

    let late = session.subscribe();
    let started = Instant::now();
    let err = late.next(Duration::from_secs(5)).unwrap_err();
    assert!(
        matches!(err, GattError::ConnectionLost),
        "unexpected error: {err:?}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "late listener waited instead of seeing the close"
    );
}

#[test]
fn indication_is_confirmed_and_delivered() {
    let (session, peer) = connected_session(SessionConfig::default());
    let listener = session.subscribe();

    peer.send(&[ATT_HANDLE_VALUE_IND, 0x31, 0x00, 0x05]);

    let event = listener.next(Duration::from_secs(1)).unwrap();
    assert_eq!(event.handle, 0x0031);
    assert_eq!(event.value, vec![0x05]);
    assert_eq!(event.kind, NotificationKind::Indication);

    let sent = peer.sent.wait_for(1);
    assert_eq!(sent[0], vec![ATT_HANDLE_VALUE_CONF]);
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn unsolicited_response_closes_the_session() {
    let (session, peer) = connected_session(SessionConfig::default());
    let listener = session.subscribe();

    // A response with no request outstanding breaks the ATT discipline
    peer.send(&[ATT_READ_RSP, 0x00]);

    wait_for_state(&session, SessionState::Closed);
    let err = listener.next(Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, GattError::ConnectionLost));
}

#[test]
fn undecodable_pdu_closes_the_session() {
    let (session, peer) = connected_session(SessionConfig::default());
    peer.send(&[0xAB, 0x01]);
    wait_for_state(&session, SessionState::Closed);
}

#[test]
fn write_command_needs_no_response() {
    let (session, peer) = connected_session(SessionConfig::default());
    session.write_command(0x002A, &[0x01, 0x00]).unwrap();
    let sent = peer.sent.wait_for(1);
    assert_eq!(sent[0], vec![ATT_WRITE_CMD, 0x2A, 0x00, 0x01, 0x00]);
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn exchange_mtu_raises_the_encode_limit() {
    let (session, peer) = connected_session(SessionConfig::default());
    assert_eq!(session.mtu(), ATT_DEFAULT_MTU);

    // A write larger than the default MTU is rejected locally
    let big = vec![0u8; 100];
    let err = session.write(0x0001, &big).unwrap_err();
    assert!(matches!(err, GattError::Encode(_)), "unexpected: {err:?}");

    let responder = thread::spawn(move || {
        peer.sent.wait_for(1);
        let mut rsp = vec![ATT_EXCHANGE_MTU_RSP];
        rsp.extend_from_slice(&200u16.to_le_bytes());
        peer.send(&rsp);

        // Acknowledge the follow-up write
        peer.sent.wait_for(2);
        peer.send(&[ATT_WRITE_RSP]);
    });

    let effective = session.exchange_mtu(185).unwrap();
    assert_eq!(effective, 185);
    assert_eq!(session.mtu(), 185);

    session.write(0x0001, &big).unwrap();
    responder.join().unwrap();
}
