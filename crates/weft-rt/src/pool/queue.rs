// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Work-stealing run queues.
//!
//! One bounded FIFO per carrier plus a shared injector. Carriers pop
//! their own queue from the front; idle carriers steal half of a
//! victim's queue from the back.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Max entries in one carrier's queue before overflow to the injector.
pub(crate) const CAPACITY: usize = 1024;

/// Per-carrier queue. Owner and stealers share one mutex.
pub(crate) struct LocalQueue<T> {
    deque: Mutex<VecDeque<T>>,
}

impl<T> LocalQueue<T> {
    pub fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
        }
    }

    /// Push to the back. Hands the item back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut q = self.deque.lock();
        if q.len() >= CAPACITY {
            return Err(item);
        }
        q.push_back(item);
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        self.deque.lock().pop_front()
    }

    /// Take half of the queue (at least one item) from the back.
    pub fn steal_batch(&self) -> Vec<T> {
        let mut q = self.deque.lock();
        let count = (q.len() / 2).max(q.len().min(1));
        let mut stolen = Vec::with_capacity(count);
        for _ in 0..count {
            match q.pop_back() {
                Some(item) => stolen.push(item),
                None => break,
            }
        }
        stolen
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deque.lock().is_empty()
    }

    /// Remove everything (a retiring carrier hands its work back).
    pub fn drain_all(&self) -> Vec<T> {
        self.deque.lock().drain(..).collect()
    }
}

/// Shared queue for external submissions and local overflow.
pub(crate) struct InjectorQueue<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> InjectorQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.lock().push_back(item);
    }

    pub fn push_batch(&self, items: Vec<T>) {
        self.queue.lock().extend(items);
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_queue_is_fifo_for_owner() {
        let q = LocalQueue::new();
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert!(q.is_empty());
    }

    #[test]
    fn local_queue_overflow_returns_item() {
        let q = LocalQueue::new();
        for i in 0..CAPACITY {
            q.push(i).unwrap();
        }
        assert_eq!(q.push(usize::MAX), Err(usize::MAX));
    }

    #[test]
    fn steal_takes_half_from_the_back() {
        let q = LocalQueue::new();
        for i in 0..10 {
            q.push(i).unwrap();
        }
        let stolen = q.steal_batch();
        assert_eq!(stolen, vec![9, 8, 7, 6, 5]);
        assert_eq!(q.len(), 5);
        assert_eq!(q.pop(), Some(0));
    }

    #[test]
    fn steal_takes_the_last_item() {
        let q = LocalQueue::new();
        q.push(7).unwrap();
        assert_eq!(q.steal_batch(), vec![7]);
        assert!(q.steal_batch().is_empty());
    }

    #[test]
    fn injector_batch_keeps_order() {
        let q = InjectorQueue::new();
        q.push(0);
        q.push_batch(vec![1, 2, 3]);
        assert_eq!(q.len(), 4);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert!(!q.is_empty());
    }
}
