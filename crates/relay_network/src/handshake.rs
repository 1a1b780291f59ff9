//! Capability handshake gate.
//!
//! While a handshake is pending, inbound messages are held in FIFO order. The
//! gate resolves exactly once: acceptance hands the held messages back in
//! arrival order, rejection discards them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// This side does not wait for a capability message.
    NotRequired,
    Pending,
    Accepted,
    Rejected,
}

impl GateState {
    pub fn is_resolved(self) -> bool {
        self != Self::Pending
    }

    /// Whether messages may flow in either direction.
    pub fn is_open(self) -> bool {
        matches!(self, Self::NotRequired | Self::Accepted)
    }
}

/// What happened to an inbound message offered to the gate.
#[derive(Debug)]
pub enum Offer {
    /// Deliver it now.
    Deliver(Message),
    /// Held until the handshake resolves.
    Queued,
    /// The handshake failed; the message is discarded.
    Dropped,
}

#[derive(Debug)]
struct GateInner {
    state: GateState,
    queue: VecDeque<Message>,
}

#[derive(Debug)]
pub struct HandshakeGate {
    inner: Mutex<GateInner>,
    state_tx: watch::Sender<GateState>,
}

impl HandshakeGate {
    /// A gate that holds inbound messages until resolved.
    pub fn required() -> Self {
        Self::with_state(GateState::Pending)
    }

    /// A gate that is open from the start.
    pub fn not_required() -> Self {
        Self::with_state(GateState::NotRequired)
    }

    fn with_state(state: GateState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            inner: Mutex::new(GateInner {
                state,
                queue: VecDeque::new(),
            }),
            state_tx,
        }
    }

    pub fn state(&self) -> GateState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn offer(&self, message: Message) -> Offer {
        let mut inner = self.inner.lock();
        match inner.state {
            GateState::Pending => {
                inner.queue.push_back(message);
                Offer::Queued
            }
            GateState::Rejected => Offer::Dropped,
            GateState::NotRequired | GateState::Accepted => Offer::Deliver(message),
        }
    }

    /// Number of messages currently held.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Open the gate. Returns the held messages in arrival order, or `None`
    /// if the gate was not pending.
    pub fn accept(&self) -> Option<Vec<Message>> {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.state != GateState::Pending {
                return None;
            }
            inner.state = GateState::Accepted;
            inner.queue.drain(..).collect()
        };
        self.state_tx.send_replace(GateState::Accepted);
        Some(drained)
    }

    /// Fail the handshake and discard held messages. Returns `false` if the
    /// gate was not pending.
    pub fn reject(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != GateState::Pending {
                return false;
            }
            inner.state = GateState::Rejected;
            inner.queue.clear();
        }
        self.state_tx.send_replace(GateState::Rejected);
        true
    }

    /// Wait until the gate resolves.
    pub async fn wait(&self) -> GateState {
        let mut rx = self.state_tx.subscribe();
        match rx.wait_for(|state| state.is_resolved()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
