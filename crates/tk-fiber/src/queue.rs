// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded multi-producer/multi-consumer queues.
//!
//! The scheduler only needs non-blocking push/pop with a fixed capacity.
//! `crossbeam_queue::ArrayQueue` provides exactly that; the trait keeps the
//! scheduler honest about what it relies on. Callers that must not fail
//! (capacity is provisioned so a slot always frees up) go through
//! [`push_spin`] / [`pop_spin`].

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;

/// Fixed-capacity concurrent queue of small items.
///
/// Both operations are safe to call from any number of threads at once and
/// never block. A full or empty queue is reported, not waited out.
pub trait BoundedQueue<T>: Send + Sync {
    /// Push an item. Returns it back if the queue is full.
    fn try_push(&self, item: T) -> Result<(), T>;

    /// Pop the oldest item, if any.
    fn try_pop(&self) -> Option<T>;

    /// Items currently queued. Only a snapshot under concurrency.
    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

impl<T: Send> BoundedQueue<T> for ArrayQueue<T> {
    fn try_push(&self, item: T) -> Result<(), T> {
        ArrayQueue::push(self, item)
    }

    fn try_pop(&self) -> Option<T> {
        ArrayQueue::pop(self)
    }

    fn len(&self) -> usize {
        ArrayQueue::len(self)
    }

    fn capacity(&self) -> usize {
        ArrayQueue::capacity(self)
    }
}

/// Push, retrying while the queue is transiently full.
pub(crate) fn push_spin<T, Q>(queue: &Q, mut item: T)
where
    Q: BoundedQueue<T> + ?Sized,
{
    let backoff = Backoff::new();
    loop {
        match queue.try_push(item) {
            Ok(()) => return,
            Err(rejected) => {
                item = rejected;
                backoff.snooze();
            }
        }
    }
}

/// Pop, retrying while the queue is transiently empty.
pub(crate) fn pop_spin<T, Q>(queue: &Q) -> T
where
    Q: BoundedQueue<T> + ?Sized,
{
    let backoff = Backoff::new();
    loop {
        if let Some(item) = queue.try_pop() {
            return item;
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_fifo() {
        let q = ArrayQueue::new(4);
        q.try_push(1u32).unwrap();
        q.try_push(2).unwrap();
        assert_eq!(BoundedQueue::len(&q), 2);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), None);
        assert!(BoundedQueue::is_empty(&q));
    }

    #[test]
    fn overflow_returns_item() {
        let q = ArrayQueue::new(2);
        q.try_push(1u32).unwrap();
        q.try_push(2).unwrap();
        assert!(BoundedQueue::is_full(&q));
        assert_eq!(q.try_push(3), Err(3));
    }

    #[test]
    fn push_spin_waits_for_consumer() {
        let q = Arc::new(ArrayQueue::new(1));
        q.try_push(0u32).unwrap();

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 3 {
                    if let Some(v) = q.try_pop() {
                        seen.push(v);
                    }
                }
                seen
            })
        };

        push_spin(&*q, 1);
        push_spin(&*q, 2);
        assert_eq!(consumer.join().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn pop_spin_waits_for_producer() {
        let q = Arc::new(ArrayQueue::new(4));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(5));
                q.try_push(7u32).unwrap();
            })
        };
        assert_eq!(pop_spin(&*q), 7);
        producer.join().unwrap();
    }
}
