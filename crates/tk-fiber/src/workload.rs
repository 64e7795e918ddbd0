// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Workloads and their wait lists.
//!
//! A workload counts the tasks of one `schedule_work` call still running
//! and owns an intrusive list of fibers waiting for it. The list head and a
//! generation share one `AtomicU64`:
//!
//! ```text
//!   63            32 31             0
//!  +----------------+----------------+
//!  |   generation   |  head (fiber)  |
//!  +----------------+----------------+
//! ```
//!
//! Closing a workload bumps the generation in the same word the waiters
//! compare-and-swap on, so once it is closed no fiber can slip into the
//! list. A handle carries the generation it was issued with; a mismatch
//! means the workload finished (and the slot may have been reused), which
//! callers treat as done.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;
use tracing::trace;

use crate::fiber::{FiberPool, NULL_INDEX};
use crate::queue::{pop_spin, push_spin};

/// Reference to a scheduled workload.
///
/// Cheap to copy and never dereferenced directly. Once the workload has
/// finished the handle stays valid and reports it as done, even after the
/// slot it points at has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkloadHandle {
    index: u32,
    generation: u32,
}

impl WorkloadHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Opaque 64-bit form: index in the low half, generation in the high.
    pub fn as_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitList {
    head: u32,
    generation: u32,
}

impl WaitList {
    fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.head as u64
    }

    fn unpack(raw: u64) -> Self {
        Self {
            head: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// Adding this to a packed word bumps the generation and leaves the head.
const GENERATION_STEP: u64 = 1 << 32;

struct Workload {
    remaining: AtomicU32,
    wait_list: AtomicU64,
}

impl Workload {
    fn new() -> Self {
        let empty = WaitList {
            head: NULL_INDEX,
            generation: 0,
        };
        Self {
            remaining: AtomicU32::new(0),
            wait_list: AtomicU64::new(empty.pack()),
        }
    }

    fn wait_list(&self) -> WaitList {
        WaitList::unpack(self.wait_list.load(Ordering::Acquire))
    }
}

pub(crate) struct WorkloadPool {
    slots: Box<[CachePadded<Workload>]>,
    free: ArrayQueue<u32>,
}

impl WorkloadPool {
    pub fn new(count: usize) -> Self {
        let free = ArrayQueue::new(count);
        for index in 0..count {
            let _ = free.push(index as u32);
        }
        Self {
            slots: (0..count).map(|_| CachePadded::new(Workload::new())).collect(),
            free,
        }
    }

    /// Take a free slot for `task_count` tasks. Spins while none is free.
    pub fn allocate(&self, task_count: u32) -> WorkloadHandle {
        let index = pop_spin(&self.free);
        let slot = &self.slots[index as usize];
        slot.remaining.store(task_count, Ordering::Release);
        let handle = WorkloadHandle {
            index,
            generation: slot.wait_list().generation,
        };
        trace!(
            workload = index,
            generation = handle.generation,
            tasks = task_count,
            "workload opened"
        );
        handle
    }

    /// Whether everything counted under `handle` has completed.
    ///
    /// Stale handles, including ones from another pool, are done.
    pub fn is_done(&self, handle: WorkloadHandle) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            return true;
        };
        slot.wait_list().generation != handle.generation
            || slot.remaining.load(Ordering::Acquire) == 0
    }

    /// Count one task of slot `index` as finished.
    ///
    /// Returns `true` if that was the last one: the workload is closed, its
    /// waiters are in the ready queue and the slot is free again.
    pub fn complete_task(&self, index: u32, fibers: &FiberPool) -> bool {
        let slot = &self.slots[index as usize];
        if slot.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return false;
        }

        // After this no insertion can succeed; `closed.head` is final.
        let closed = WaitList::unpack(slot.wait_list.fetch_add(GENERATION_STEP, Ordering::AcqRel));

        let mut woken = 0u32;
        let mut current = closed.head;
        while current != NULL_INDEX {
            // Unlink before waking: a woken fiber may run and wait again at once.
            let next = fibers
                .get(current)
                .wait_list_next
                .swap(NULL_INDEX, Ordering::Relaxed);
            fibers.wake_up(current);
            woken += 1;
            current = next;
        }

        let reopened = WaitList {
            head: NULL_INDEX,
            generation: closed.generation.wrapping_add(1),
        };
        slot.wait_list.store(reopened.pack(), Ordering::Release);
        trace!(workload = index, generation = closed.generation, woken, "workload closed");

        push_spin(&self.free, index);
        true
    }

    /// Put `fiber` on the wait list of `handle`.
    ///
    /// If the workload already closed, the fiber is woken right away and
    /// `false` is returned. The fiber must be fully suspended: once it is in
    /// the list another thread may resume it.
    pub fn insert_waiter(&self, handle: WorkloadHandle, fiber: u32, fibers: &FiberPool) -> bool {
        let Some(slot) = self.slots.get(handle.index as usize) else {
            fibers.wake_up(fiber);
            return false;
        };

        let desired = WaitList {
            head: fiber,
            generation: handle.generation,
        }
        .pack();

        let mut observed = slot.wait_list.load(Ordering::Acquire);
        loop {
            let current = WaitList::unpack(observed);
            if current.generation != handle.generation {
                fibers.wake_up(fiber);
                return false;
            }

            fibers
                .get(fiber)
                .wait_list_next
                .store(current.head, Ordering::Relaxed);

            match slot.wait_list.compare_exchange_weak(
                observed,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => observed = actual,
            }
        }
    }

    /// True when no workload is in flight.
    pub fn all_free(&self) -> bool {
        self.free.is_full()
    }

    pub fn in_flight(&self) -> usize {
        self.free.capacity() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::tests::pool as fiber_pool;
    use proptest::prelude::*;

    #[test]
    fn handle_u64_form_is_stable() {
        let handle = WorkloadHandle {
            index: 3,
            generation: 9,
        };
        assert_eq!(handle.as_u64(), (9u64 << 32) | 3);
        assert_eq!(WorkloadHandle::from_u64(handle.as_u64()), handle);
    }

    #[test]
    fn closing_bumps_generation_and_frees_slot() {
        let fibers = fiber_pool(1);
        let pool = WorkloadPool::new(1);
        let handle = pool.allocate(2);
        assert!(!pool.is_done(handle));
        assert!(!pool.all_free());

        assert!(!pool.complete_task(handle.index(), &fibers));
        assert!(!pool.is_done(handle));
        assert!(pool.complete_task(handle.index(), &fibers));

        assert!(pool.is_done(handle));
        assert!(pool.all_free());
        assert_eq!(pool.slots[0].wait_list().generation, handle.generation() + 1);
        assert_eq!(pool.slots[0].wait_list().head, NULL_INDEX);
    }

    #[test]
    fn reused_slot_does_not_revive_old_handle() {
        let fibers = fiber_pool(1);
        let pool = WorkloadPool::new(1);
        let old = pool.allocate(1);
        pool.complete_task(old.index(), &fibers);

        let new = pool.allocate(1);
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(pool.is_done(old));
        assert!(!pool.is_done(new));
    }

    #[test]
    fn waiters_are_woken_on_close() {
        let fibers = fiber_pool(3);
        let pool = WorkloadPool::new(2);
        let handle = pool.allocate(1);

        assert!(pool.insert_waiter(handle, 0, &fibers));
        assert!(pool.insert_waiter(handle, 1, &fibers));
        assert_eq!(fibers.ready_count(), 0);

        pool.complete_task(handle.index(), &fibers);
        // Most recently inserted first.
        assert_eq!(fibers.try_pop_ready(), Some(1));
        assert_eq!(fibers.try_pop_ready(), Some(0));
        assert_eq!(fibers.try_pop_ready(), None);
        for i in 0..2 {
            assert_eq!(fibers.get(i).wait_list_next.load(Ordering::Relaxed), NULL_INDEX);
        }
    }

    #[test]
    fn insert_after_close_wakes_immediately() {
        let fibers = fiber_pool(1);
        let pool = WorkloadPool::new(1);
        let handle = pool.allocate(1);
        pool.complete_task(handle.index(), &fibers);

        assert!(!pool.insert_waiter(handle, 0, &fibers));
        assert_eq!(fibers.try_pop_ready(), Some(0));
    }

    #[test]
    fn insert_into_reused_slot_with_stale_handle_wakes_immediately() {
        let fibers = fiber_pool(1);
        let pool = WorkloadPool::new(1);
        let stale = pool.allocate(1);
        pool.complete_task(stale.index(), &fibers);
        let live = pool.allocate(1);

        assert!(!pool.insert_waiter(stale, 0, &fibers));
        assert_eq!(fibers.try_pop_ready(), Some(0));
        assert_eq!(pool.slots[live.index() as usize].wait_list().head, NULL_INDEX);
    }

    #[test]
    fn foreign_handle_is_done() {
        let pool = WorkloadPool::new(2);
        assert!(pool.is_done(WorkloadHandle::from_u64(57)));
    }

    #[test]
    fn in_flight_counts_open_workloads() {
        let fibers = fiber_pool(1);
        let pool = WorkloadPool::new(4);
        let a = pool.allocate(1);
        let _b = pool.allocate(1);
        assert_eq!(pool.in_flight(), 2);
        pool.complete_task(a.index(), &fibers);
        assert_eq!(pool.in_flight(), 1);
    }

    proptest! {
        #[test]
        fn generations_strictly_increase_per_slot(counts in prop::collection::vec(1u32..5, 1..40)) {
            let fibers = fiber_pool(1);
            let pool = WorkloadPool::new(1);
            let mut issued: Vec<WorkloadHandle> = Vec::new();

            for count in counts {
                let handle = pool.allocate(count);
                if let Some(prev) = issued.last() {
                    prop_assert!(handle.generation() > prev.generation());
                }
                prop_assert!(!issued.contains(&handle));
                for _ in 0..count {
                    prop_assert!(!pool.is_done(handle));
                    pool.complete_task(handle.index(), &fibers);
                }
                prop_assert!(pool.is_done(handle));
                issued.push(handle);
            }
            prop_assert!(issued.iter().all(|h| pool.is_done(*h)));
        }
    }
}
