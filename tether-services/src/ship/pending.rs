//! The ship-side correlation table tracking in-flight requests awaiting
//! their response frame.
//!
//! Kept as `Rc<RefCell<_>>` rather than behind an `Arc<Mutex<_>>` since the
//! ship runs a single-threaded `monoio` event loop — every handler task,
//! the uplink Reader, and the tunnel router all run on the same thread.
//! `insert` would silently clobber a live entry for a reused id, so
//! callers always mint a fresh random id instead of reusing one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tether_core::CorrelationId;

/// One-shot delivery channel for a single request's response bytes.
pub type ResponseTx = async_channel::Sender<Vec<u8>>;
pub type ResponseRx = async_channel::Receiver<Vec<u8>>;

#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Rc<RefCell<HashMap<CorrelationId, ResponseTx>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh correlation id, returning the receiving half the
    /// caller awaits. Panics in debug builds if `id` was already
    /// registered, since ids are freshly minted and a collision would
    /// indicate a generator bug, not a valid race.
    pub fn register(&self, id: CorrelationId) -> ResponseRx {
        let (tx, rx) = async_channel::bounded(1);
        let previous = self.inner.borrow_mut().insert(id, tx);
        debug_assert!(previous.is_none(), "correlation id {id} reused while in flight");
        rx
    }

    /// Delivers a response frame to the handler awaiting `id`, if any is
    /// still registered. Returns `false` for an orphan response: the
    /// handler already timed out and removed itself, or the id never
    /// belonged to this table.
    pub fn deliver(&self, id: CorrelationId, payload: Vec<u8>) -> bool {
        let tx = self.inner.borrow_mut().remove(&id);
        match tx {
            Some(tx) => tx.try_send(payload).is_ok(),
            None => false,
        }
    }

    /// Removes `id` without delivering anything, used when a handler's
    /// deadline expires. A response that later arrives for that id is
    /// logged as an orphan and discarded.
    pub fn remove(&self, id: CorrelationId) {
        self.inner.borrow_mut().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
