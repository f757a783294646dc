//! Reservation table pairing msgids with eventual responses.
//!
//! Each msgid can be reserved exactly once while a request is in flight;
//! the matching response resolves the reservation and wakes the waiter.
//! There is no timeout at this layer - session teardown aborts every
//! outstanding reservation.

use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};

use crate::error::{Result, RpcError};
use crate::message::Message;

/// Keyed one-shot handoff table: `reserve` inserts a pending entry and
/// returns the receiving half, `resolve` removes it and delivers.
///
/// Thread-safe; shared between the session consumer and any number of
/// callers awaiting responses.
#[derive(Debug)]
pub struct Reservator {
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
}

impl Reservator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a msgid, returning the receiver the response will arrive on.
    ///
    /// Fails with [`RpcError::AlreadyReserved`] if the msgid already has a
    /// pending entry (two concurrent receives, or a msgid-space wrap
    /// colliding with an outstanding call).
    pub async fn reserve(&self, msgid: u32) -> Result<oneshot::Receiver<Message>> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&msgid) {
            return Err(RpcError::AlreadyReserved(msgid));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(msgid, tx);
        Ok(rx)
    }

    /// Resolve a reservation, delivering the response to its waiter.
    ///
    /// When the msgid was never reserved the response is handed back
    /// unconsumed, so the caller can report it as an orphan.
    pub async fn resolve(
        &self,
        msgid: u32,
        response: Message,
    ) -> std::result::Result<(), Message> {
        match self.pending.lock().await.remove(&msgid) {
            Some(tx) => {
                if tx.send(response).is_err() {
                    // The waiter gave up; nothing left to deliver to.
                    tracing::debug!(msgid, "response waiter dropped before delivery");
                }
                Ok(())
            }
            None => Err(response),
        }
    }

    /// Drop every pending entry, failing all outstanding waiters.
    pub async fn abort_all(&self) {
        self.pending.lock().await.clear();
    }

    /// Number of pending reservations.
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Returns true if there are no pending reservations.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

impl Default for Reservator {
    fn default() -> Self {
        Self::new()
    }
}
