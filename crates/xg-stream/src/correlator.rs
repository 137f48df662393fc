//! Method-call correlation.
//!
//! Ids are handed out from a counter that lives under the same lock as the
//! pending map, so concurrent callers always get distinct, strictly
//! increasing ids starting at 1. Each slot is a oneshot channel and is
//! removed from the map before it is written, which makes delivery
//! exactly-once.

use std::sync::{Mutex, PoisonError};

use ahash::AHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use xg_core::{Result, XgError};

/// What a method call eventually receives.
pub type Reply = Result<Value>;

#[derive(Default)]
struct State {
    last_id: u64,
    pending: AHashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Maps outstanding call ids to their reply slots.
#[derive(Default)]
pub struct Correlator {
    state: Mutex<State>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and register its reply slot.
    ///
    /// Fails with [`XgError::Closed`] once [`close`](Self::close) has run.
    pub fn add_pending(&self) -> Result<(u64, oneshot::Receiver<Reply>)> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(XgError::Closed);
        }
        state.last_id += 1;
        let id = state.last_id;
        state.pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Remove the slot for `id` without writing to it.
    pub fn pop(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(&id)
    }

    /// Remove the slot for `id` and write `reply` into it.
    ///
    /// Returns `false` if the id is unknown or was already delivered.
    pub fn deliver(&self, id: u64, reply: Reply) -> bool {
        match self.pop(id) {
            Some(slot) => {
                // The caller may have given up waiting; that is not our concern.
                let _ = slot.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding slot with [`XgError::Closed`] and refuse new
    /// ones. Returns how many slots were failed.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.pending.drain().collect()
        };
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(XgError::Closed));
        }
        count
    }

    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// The most recently assigned id, 0 if none.
    pub fn last_id(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).last_id
    }
}
