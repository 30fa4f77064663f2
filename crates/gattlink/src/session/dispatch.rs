//! Notification dispatcher
//!
//! Decouples the session's receive loop from consumer code. Each
//! subscriber owns a bounded queue; the receive loop fans every event out
//! to all live subscribers in arrival order. The queue capacity and
//! overflow behavior are part of the contract: the default policy blocks
//! the receive path when a subscriber falls behind, because silently
//! dropping BLE notifications loses data the peer will not resend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::GattError;

/// How a peer-initiated value push was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Unacknowledged push.
    Notification,
    /// Acknowledged push; the session confirms it on the wire.
    Indication,
}

/// One value push received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub handle: u16,
    pub value: Vec<u8>,
    pub kind: NotificationKind,
    pub received_at: Instant,
}

/// What the receive loop does when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Block the receive path until the subscriber drains an event.
    /// Backpressure reaches the peer through link-layer flow control.
    #[default]
    Block,
    /// Discard the oldest queued event to make room.
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

struct QueueState {
    buf: VecDeque<NotificationEvent>,
    closed: bool,
    detached: bool,
}

struct ListenerQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl ListenerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
                detached: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, event: &NotificationEvent, policy: OverflowPolicy) {
        let mut state = self.state.lock().unwrap();
        while state.buf.len() >= self.capacity {
            if state.closed || state.detached {
                return;
            }
            match policy {
                OverflowPolicy::Block => {
                    state = self.not_full.wait(state).unwrap();
                }
                OverflowPolicy::DropOldest => {
                    warn!("notification queue full, dropping oldest event");
                    state.buf.pop_front();
                }
                OverflowPolicy::DropNewest => {
                    warn!("notification queue full, dropping incoming event");
                    return;
                }
            }
        }
        if state.closed || state.detached {
            return;
        }
        state.buf.push_back(event.clone());
        self.not_empty.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// A subscriber handle onto a session's notification stream.
///
/// Events arrive in the exact order the session received them from the
/// transport. Dropping the listener detaches it without disturbing the
/// session or other listeners.
pub struct Listener {
    queue: Arc<ListenerQueue>,
}

impl Listener {
    /// Blocks until an event arrives, the session closes, or `timeout`
    /// expires.
    pub fn next(&self, timeout: Duration) -> Result<NotificationEvent, GattError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.state.lock().unwrap();
        loop {
            if let Some(event) = state.buf.pop_front() {
                self.queue.not_full.notify_one();
                return Ok(event);
            }
            if state.closed {
                return Err(GattError::ConnectionLost);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GattError::Timeout(timeout));
            }
            let (next_state, wait) = self
                .queue
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next_state;
            if wait.timed_out() && state.buf.is_empty() && !state.closed {
                return Err(GattError::Timeout(timeout));
            }
        }
    }

    /// Pops an event if one is queued, without blocking.
    pub fn try_next(&self) -> Option<NotificationEvent> {
        let mut state = self.queue.state.lock().unwrap();
        let event = state.buf.pop_front();
        if event.is_some() {
            self.queue.not_full.notify_one();
        }
        event
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock().unwrap();
        state.detached = true;
        // A receive loop blocked on this queue must not wait forever
        self.queue.not_full.notify_all();
    }
}

/// Fan-out point between the receive loop and consumer code.
///
/// Owned by the session; the receive loop is the only producer.
pub struct NotificationDispatcher {
    listeners: Mutex<Vec<Weak<ListenerQueue>>>,
    // Checked and set under the listeners lock so subscribe and close
    // cannot race a queue into existence that nobody will ever close.
    closed: AtomicBool,
    capacity: usize,
    policy: OverflowPolicy,
}

impl NotificationDispatcher {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            capacity,
            policy,
        }
    }

    /// Subscribing after [`close`] yields a listener whose queue is
    /// already closed, so `next` reports the session gone instead of
    /// waiting out its timeout.
    ///
    /// [`close`]: NotificationDispatcher::close
    pub fn subscribe(&self) -> Listener {
        let queue = Arc::new(ListenerQueue::new(self.capacity));
        let mut listeners = self.listeners.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) {
            queue.close();
        } else {
            listeners.push(Arc::downgrade(&queue));
        }
        Listener { queue }
    }

    /// Delivers one event to every live listener, in subscription order.
    pub fn publish(&self, event: NotificationEvent) {
        trace!(
            "dispatching {:?} for handle {:#06x} ({} bytes)",
            event.kind,
            event.handle,
            event.value.len()
        );
        let queues: Vec<Arc<ListenerQueue>> = {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.retain(|w| w.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for queue in queues {
            queue.push(&event, self.policy);
        }
    }

    /// Wakes every listener with a closed signal. Idempotent.
    pub fn close(&self) {
        let listeners = self.listeners.lock().unwrap();
        self.closed.store(true, Ordering::SeqCst);
        for queue in listeners.iter().filter_map(Weak::upgrade) {
            queue.close();
        }
    }
}
