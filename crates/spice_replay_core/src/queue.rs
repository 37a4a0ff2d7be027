//! Replay queue shared between the idle context and the server thread.
//!
//! The queue is unbounded: the filler keeps it near the fill target on its
//! own, so `push` never waits.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::command::QueueItem;

/// FIFO of pending display commands.
#[derive(Debug, Default)]
pub struct ReplayQueue {
    items: Mutex<VecDeque<QueueItem>>,
    available: Condvar,
}

impl ReplayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the tail.
    pub fn push(&self, item: QueueItem) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Remove the head, waiting until one is available.
    pub fn pop_blocking(&self) -> QueueItem {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            self.available.wait(&mut items);
        }
    }

    /// Remove the head without waiting.
    pub fn try_pop(&self) -> Option<QueueItem> {
        self.items.lock().pop_front()
    }

    /// Number of queued items, sentinel included.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop everything still queued.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }
}
