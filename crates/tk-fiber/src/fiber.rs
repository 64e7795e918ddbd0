// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber pool: a fixed arena of execution contexts plus two index queues.
//!
//! `free` holds fibers that are not in the middle of a task (never started,
//! or parked at a point of the worker loop where nothing is left to finish).
//! `ready` holds fibers that were suspended on a workload and have since
//! been woken. Fibers are referred to by index everywhere so links stay valid
//! across reuse.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;

use crate::context::{ExecutionContext, FiberEntry};
use crate::queue::{push_spin, BoundedQueue};

/// Null link for intrusive index lists.
pub(crate) const NULL_INDEX: u32 = u32::MAX;

pub(crate) struct Fiber {
    pub context: ExecutionContext,
    /// Next fiber in the wait list this fiber sits on, or [`NULL_INDEX`].
    pub wait_list_next: AtomicU32,
}

pub(crate) struct FiberPool {
    fibers: Box<[Fiber]>,
    free: ArrayQueue<u32>,
    ready: ArrayQueue<u32>,
}

impl FiberPool {
    /// Allocate `count` fibers, each entering `entry(index)` on first switch.
    pub fn new(count: usize, stack_size: usize, entry: FiberEntry) -> io::Result<Self> {
        let mut fibers = Vec::with_capacity(count);
        let free = ArrayQueue::new(count);
        for index in 0..count {
            fibers.push(Fiber {
                context: ExecutionContext::create(stack_size, entry, index)?,
                wait_list_next: AtomicU32::new(NULL_INDEX),
            });
            let _ = free.push(index as u32);
        }

        Ok(Self {
            fibers: fibers.into_boxed_slice(),
            free,
            ready: ArrayQueue::new(count),
        })
    }

    pub fn get(&self, index: u32) -> &Fiber {
        &self.fibers[index as usize]
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    /// Next fiber to run: a woken one if possible, otherwise a free one.
    /// Spins until either queue yields.
    pub fn pop_context(&self) -> u32 {
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.ready.try_pop() {
                return index;
            }
            if let Some(index) = self.free.try_pop() {
                return index;
            }
            backoff.snooze();
        }
    }

    pub fn try_pop_ready(&self) -> Option<u32> {
        self.ready.try_pop()
    }

    /// Return a fiber that has nothing left to resume to the free queue.
    pub fn pool_context(&self, index: u32) {
        self.get(index)
            .wait_list_next
            .store(NULL_INDEX, Ordering::Relaxed);
        push_spin(&self.free, index);
    }

    /// Make a suspended fiber eligible to resume.
    pub fn wake_up(&self, index: u32) {
        push_spin(&self.ready, index);
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }
}
