//! A thread-safe ordered set with a blocking take.
//!
//! The per-peer outbound queue: iteration order equals insertion order,
//! `add` suppresses duplicates (which is what collapses repeated keep-alive
//! announces), and `take` parks the writer until an item arrives or the
//! queue closes. Closing is graceful: items already queued still drain, new
//! items are refused, and `take` reports exhaustion with `None`.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct MessageQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    members: HashSet<T>,
    closed: bool,
}

impl<T: Clone + Eq + Hash> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                members: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an item. Returns false if it was already queued or the queue
    /// is closed.
    pub fn add(&self, item: T) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.closed || !inner.members.insert(item.clone()) {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Remove every queued item matching the predicate. Returns whether
    /// anything was removed.
    pub fn remove_if(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let before = inner.items.len();
        let mut removed = Vec::new();
        inner.items.retain(|item| {
            if predicate(item) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        for item in removed {
            inner.members.remove(&item);
        }
        inner.items.len() != before
    }

    /// Wait for the next item in insertion order. Returns `None` once the
    /// queue is closed and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = inner.items.pop_front() {
                    inner.members.remove(&item);
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further adds; queued items still drain.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Eq + Hash> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
