//! Bounded FIFO of recent match records

use std::collections::VecDeque;
use std::sync::Mutex;

/// Capacity used by every filter's match history
pub const RECENT_CAPACITY: usize = 1000;

/// Fixed-capacity buffer that evicts the oldest record on overflow
#[derive(Debug)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, item: T) {
        let mut items = self.lock();
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Up to `max` records, newest first
    pub fn recent(&self, max: usize) -> Vec<T> {
        self.lock().iter().rev().take(max).cloned().collect()
    }

    /// Everything, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        // Records are plain data; a poisoned guard still holds a valid deque
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(RECENT_CAPACITY)
    }
}
