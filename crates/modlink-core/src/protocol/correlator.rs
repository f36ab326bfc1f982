//! Request/reply correlation
//!
//! Every binary request that awaits a reply gets a fresh 16-bit id. The
//! reply frame echoes that id; the pending sender is removed and completed
//! exactly once. Ids wrap around and skip 0, which means "no reply".

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{trace, warn};

use super::packet::Reply;

/// Pending requests keyed by request id
#[derive(Debug)]
pub struct RequestCorrelator {
    pending: HashMap<u16, oneshot::Sender<Reply>>,
    last_id: u16,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            last_id: 0,
        }
    }

    /// Register a waiter and return the id to put on the wire
    ///
    /// Waiters whose receiver was dropped (timed out) are purged first so
    /// their ids can be reused. `None` when every id is still in flight.
    pub fn register(&mut self, sender: oneshot::Sender<Reply>) -> Option<u16> {
        self.pending.retain(|_, waiter| !waiter.is_closed());

        // skip the ids still in flight
        let mut free = None;
        for _ in 0..u16::MAX {
            let id = self.next_id();
            if !self.pending.contains_key(&id) {
                free = Some(id);
                break;
            }
        }
        let Some(id) = free else {
            warn!(pending = self.pending.len(), "no free request id");
            return None;
        };
        self.pending.insert(id, sender);
        trace!(id, pending = self.pending.len(), "request registered");
        Some(id)
    }

    fn next_id(&mut self) -> u16 {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id == 0 {
            self.last_id = 1;
        }
        self.last_id
    }

    /// Complete the waiter for `reply.id`
    ///
    /// Returns false when no request is waiting on that id; the reply is
    /// dropped.
    pub fn resolve(&mut self, reply: Reply) -> bool {
        match self.pending.remove(&reply.id) {
            Some(waiter) => {
                if waiter.send(reply).is_err() {
                    trace!("reply arrived after the requester gave up");
                }
                true
            }
            None => {
                warn!(id = reply.id, "reply for unknown request dropped");
                false
            }
        }
    }

    /// Forget a request whose caller stopped waiting
    pub fn cancel(&mut self, id: u16) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Drop every waiter; their receivers observe a closed channel
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

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
