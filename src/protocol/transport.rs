//! In-process asynchronous message bus and request/response correlation.
//!
//! A send returns immediately; delivery happens when the receiving side
//! drains its channel. Replies are matched to requests by message id through
//! a [`Correlator`], which expires entries that never receive a reply so the
//! table cannot grow without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::messages::{Envelope, MessageId};

/// A send that could not be handed to the bus.
///
/// Transport faults are transient: callers log them and rely on the liveness
/// mechanism to notice a peer that stays gone.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint attached for \"{0}\"")]
    Unreachable(String),
    #[error("endpoint \"{0}\" dropped its receiver")]
    Closed(String),
}

/// The sending side of the message bus, the seam sessions talk through.
pub trait MessageBus: Send + Sync {
    /// Hands an envelope to the bus for asynchronous delivery.
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Channel-backed bus connecting the engine and resource managers in one
/// process.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    endpoints: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an endpoint and returns its inbound channel.
    ///
    /// Re-attaching an id replaces the previous channel; the old receiver
    /// stops seeing traffic.
    pub fn attach(&self, id: impl Into<String>) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .expect("bus endpoint table poisoned")
            .insert(id.into(), tx);
        rx
    }

    /// Removes an endpoint; later sends to it fail with `Unreachable`.
    pub fn detach(&self, id: &str) {
        self.endpoints
            .lock()
            .expect("bus endpoint table poisoned")
            .remove(id);
    }
}

impl MessageBus for LocalBus {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let endpoints = self.endpoints.lock().expect("bus endpoint table poisoned");
        let Some(tx) = endpoints.get(&envelope.to) else {
            return Err(TransportError::Unreachable(envelope.to));
        };
        let to = envelope.to.clone();
        tx.send(envelope)
            .map_err(|_| TransportError::Closed(to))
    }
}

/// What a tracked request was, so its reply can be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Connect,
    HandshakeResponse,
    SelectControlType,
    Instruction,
    KeepAlive,
}

/// A request still waiting for its reply.
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub sent_at: Instant,
}

/// Request/response correlation table keyed by message id.
#[derive(Debug)]
pub struct Correlator {
    pending: HashMap<MessageId, PendingRequest>,
    ttl: Duration,
}

impl Correlator {
    /// Creates a table whose entries expire after `ttl` without a reply.
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    /// Registers an outbound request.
    pub fn track(&mut self, id: MessageId, kind: RequestKind, now: Instant) {
        self.pending.insert(id, PendingRequest { kind, sent_at: now });
    }

    /// Consumes the entry for a reply's subject id, if one is still tracked.
    pub fn resolve(&mut self, id: MessageId) -> Option<PendingRequest> {
        self.pending.remove(&id)
    }

    /// Drops entries older than the reply deadline; returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending
            .retain(|_, req| now.duration_since(req.sent_at) < ttl);
        let expired = before - self.pending.len();
        if expired > 0 {
            debug!(expired, "expired unanswered protocol requests");
        }
        expired
    }

    /// Forgets all pending requests (session teardown).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
