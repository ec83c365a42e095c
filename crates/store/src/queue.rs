//! FIFO work queue with deduplication and explicit done-tracking.
//!
//! An item is keyed by [`QueueItem::key`]. While a key is queued or checked out
//! (returned by [`WorkQueue::get`] and not yet passed to [`WorkQueue::done`]),
//! further adds with the same key are rejected.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use metrics::gauge;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

/// Items stored in a [`WorkQueue`] expose the identity used for deduplication.
pub trait QueueItem: Send {
    type Key: Eq + Hash + Clone + Debug + Send;

    fn key(&self) -> Self::Key;
}

struct State<T: QueueItem> {
    pending: VecDeque<T>,
    queued: FxHashSet<T::Key>,
    processing: FxHashSet<T::Key>,
    shutting_down: bool,
}

pub struct WorkQueue<T: QueueItem> {
    name: &'static str,
    state: Mutex<State<T>>,
    available: Notify,
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                pending: VecDeque::new(),
                queued: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            available: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str { self.name }

    // Every mutation leaves the state consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_depth(&self, depth: usize) {
        gauge!("altc_queue_depth", depth as f64, "queue" => self.name);
    }

    /// Enqueue `item` unless its key is already queued or checked out, or the
    /// queue is shutting down. Returns whether the item was enqueued.
    pub fn add(&self, item: T) -> bool {
        let key = item.key();
        let mut st = self.lock();
        if st.shutting_down {
            debug!(queue = self.name, key = ?key, "add ignored: queue shutting down");
            return false;
        }
        if st.queued.contains(&key) || st.processing.contains(&key) {
            debug!(queue = self.name, key = ?key, "add ignored: already queued or in processing");
            return false;
        }
        st.queued.insert(key);
        st.pending.push_back(item);
        let depth = st.pending.len();
        drop(st);
        self.report_depth(depth);
        self.available.notify_one();
        true
    }

    /// Wait for the next item and check it out. Returns `None` once the queue
    /// is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a concurrent add or
            // shutdown between the check and the await is not missed.
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(item) = st.pending.pop_front() {
                    let key = item.key();
                    st.queued.remove(&key);
                    st.processing.insert(key);
                    let depth = st.pending.len();
                    drop(st);
                    self.report_depth(depth);
                    return Some(item);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a checked-out item as processed so its key may be added again.
    pub fn done(&self, item: &T) {
        let key = item.key();
        let mut st = self.lock();
        if !st.processing.remove(&key) {
            debug!(queue = self.name, key = ?key, "done called for an item not in processing");
        }
    }

    /// Number of items waiting to be checked out.
    pub fn len(&self) -> usize { self.lock().pending.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of items checked out and not yet marked done.
    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    /// Idempotent. Blocked and future `get` calls return `None` once drained.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let depth = st.pending.len();
        drop(st);
        debug!(queue = self.name, depth, "queue shut down");
        self.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
}
