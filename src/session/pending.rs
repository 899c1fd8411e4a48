//! Rendezvous slots for calls waiting on an agent response.
//!
//! Each outstanding call owns one `oneshot` channel: the sender sits in the
//! table keyed by request id, the receiver is held by the waiting caller.
//! Removing the sender from the table is what fulfils a slot, so a slot can
//! never be fulfilled twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

use crate::transport::protocol::{ClientResponse, RequestId};

/// What a waiting caller receives through its slot.
#[derive(Debug)]
pub enum Reply {
    /// The agent's decoded response.
    Response(ClientResponse),
    /// The agent answered this request but the body could not be decoded.
    Malformed(String),
}

/// Outcome of handing a response to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The waiting caller received the response.
    Delivered,
    /// No slot exists: already answered, expired, or never issued.
    NoSlot,
    /// The slot existed but its caller had already given up.
    Abandoned,
}

struct Slot {
    tx: oneshot::Sender<Reply>,
    created_at: Instant,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<RequestId, Slot>,
    closed: bool,
}

/// Per-session map from request id to the slot awaiting its response.
pub struct PendingCallTable {
    inner: Mutex<Inner>,
    retention: Duration,
}

impl PendingCallTable {
    /// Create a table whose slots are evicted after `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention,
        }
    }

    /// Create the slot for `request_id`.
    ///
    /// Returns `None` once the table has been closed.
    pub async fn register(&self, request_id: RequestId) -> Option<oneshot::Receiver<Reply>> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.slots.insert(
            request_id,
            Slot {
                tx,
                created_at: Instant::now(),
            },
        );
        Some(rx)
    }

    /// Fulfil the slot matching the response's request id.
    pub async fn complete(&self, response: ClientResponse) -> Delivery {
        self.fulfil(response.request_id, Reply::Response(response)).await
    }

    /// Fail the slot for `request_id` with an undecodable answer.
    pub async fn reject(&self, request_id: RequestId, reason: String) -> Delivery {
        self.fulfil(request_id, Reply::Malformed(reason)).await
    }

    async fn fulfil(&self, request_id: RequestId, reply: Reply) -> Delivery {
        let slot = self.inner.lock().await.slots.remove(&request_id);
        match slot {
            Some(slot) => match slot.tx.send(reply) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Abandoned,
            },
            None => Delivery::NoSlot,
        }
    }

    /// Drop the slot for `request_id`. Returns whether it was present.
    pub async fn remove(&self, request_id: RequestId) -> bool {
        self.inner.lock().await.slots.remove(&request_id).is_some()
    }

    /// Evict slots older than the retention window.
    ///
    /// Waiters on evicted slots see their channel close.
    pub async fn evict_expired(&self) -> usize {
        let retention = self.retention;
        let mut inner = self.inner.lock().await;
        let before = inner.slots.len();
        inner
            .slots
            .retain(|_, slot| slot.created_at.elapsed() < retention);
        before - inner.slots.len()
    }

    /// Refuse new slots and drop every outstanding one.
    ///
    /// Returns how many waiters were cut off.
    pub async fn close(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let drained = inner.slots.len();
        inner.slots.clear();
        drained
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn contains(&self, request_id: RequestId) -> bool {
        self.inner.lock().await.slots.contains_key(&request_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
