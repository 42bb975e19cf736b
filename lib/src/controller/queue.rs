//! A deduplicating work queue of request keys.
//!
//! A key is queued at most once. A key added while it is being processed
//! is marked dirty and queued again when processing finishes, so the same
//! request is never reconciled concurrently but no event is lost.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::RequestKey;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<RequestKey>,
    queued: HashSet<RequestKey>,
    active: HashSet<RequestKey>,
    dirty: HashSet<RequestKey>,
    closed: bool,
}

/// See the module documentation.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // The state is consistent after every operation, so a panic while
        // holding the lock doesn't invalidate it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` unless it is already queued.
    pub fn add(&self, key: RequestKey) {
        let mut s = self.lock();
        if s.closed {
            return;
        }
        if s.active.contains(&key) {
            s.dirty.insert(key);
            return;
        }
        if s.queued.insert(key.clone()) {
            s.queue.push_back(key);
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once the queue is closed and
    /// drained.
    pub async fn next(&self) -> Option<RequestKey> {
        loop {
            // Created before checking state, so a concurrent `close` can't be missed.
            let notified = self.notify.notified();
            {
                let mut s = self.lock();
                if let Some(key) = s.queue.pop_front() {
                    s.queued.remove(&key);
                    s.active.insert(key.clone());
                    return Some(key);
                }
                if s.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `key` as finished.
    pub fn done(&self, key: &RequestKey) {
        let mut s = self.lock();
        s.active.remove(key);
        if s.dirty.remove(key) && !s.closed && s.queued.insert(key.clone()) {
            s.queue.push_back(key.clone());
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys; waiters drain what is queued, then get `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Like [`Self::close`], also dropping queued keys.
    pub fn shutdown(&self) {
        {
            let mut s = self.lock();
            s.closed = true;
            s.queue.clear();
            s.queued.clear();
            s.dirty.clear();
        }
        self.notify.notify_waiters();
    }

    /// Number of keys waiting.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no keys are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
