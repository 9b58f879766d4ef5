//! Response correlation
//!
//! Each outstanding request registers a slot keyed by its message id. The
//! receive loop completes the slot when the matching response arrives.
//! Dropping the [`PendingResponse`] releases the slot.

use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

type Slot = (u64, oneshot::Sender<Result<Bytes>>);

#[derive(Default)]
struct Slots {
    waiting: HashMap<u64, Slot>,
    closed: Option<String>,
}

/// Message id to waiting caller table
#[derive(Default)]
pub struct ResponseTable {
    slots: Mutex<Slots>,
    next_token: AtomicU64,
}

impl ResponseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve a slot for `message_id`.
    pub fn register(self: &Arc<Self>, message_id: u64) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut slots = self.slots.lock();
        if let Some(reason) = &slots.closed {
            return Err(Error::ConnectionLost(reason.clone()));
        }
        if slots.waiting.contains_key(&message_id) {
            return Err(Error::InvalidState(format!(
                "message id {} already in flight",
                message_id
            )));
        }
        slots.waiting.insert(message_id, (token, tx));
        Ok(PendingResponse {
            message_id,
            token,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hand a response to its waiting caller. Returns false for unknown ids.
    pub fn dispatch(&self, message_id: u64, frame: Bytes) -> bool {
        let slot = self.slots.lock().waiting.remove(&message_id);
        match slot {
            // The caller may have given up in the meantime
            Some((_, tx)) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiting caller and refuse new registrations.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock();
            slots.closed = Some(reason.to_string());
            slots.waiting.drain().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ConnectionLost(reason.to_string())));
        }
        count
    }

    /// Accept registrations again after a reconnect.
    pub fn reopen(&self) {
        self.slots.lock().closed = None;
    }

    pub fn in_flight(&self) -> usize {
        self.slots.lock().waiting.len()
    }

    fn release(&self, message_id: u64, token: u64) {
        let mut slots = self.slots.lock();
        if matches!(slots.waiting.get(&message_id), Some((t, _)) if *t == token) {
            slots.waiting.remove(&message_id);
        }
    }
}

/// A reserved correlation slot
pub struct PendingResponse {
    message_id: u64,
    token: u64,
    rx: oneshot::Receiver<Result<Bytes>>,
    table: Arc<ResponseTable>,
}

impl PendingResponse {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Wait for the correlated frame.
    pub async fn wait(mut self) -> Result<Bytes> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionLost(format!(
                "response slot {} dropped",
                self.message_id
            ))),
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("message_id", &self.message_id)
            .finish()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.release(self.message_id, self.token);
    }
}
