// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Registry of OS threads lent to the scheduler by their owners.
//!
//! Touched on acquire, on release and when the last workload drains; never
//! on the per-task path, so a plain mutex is enough.

use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};

use crate::worker::ThreadContext;

/// When an acquired thread should be handed back to its caller.
///
/// An explicit release always works, whatever the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCondition {
    /// Only on `release_threads` / `release_all_threads`.
    UserRequest,
    /// As soon as no workload is in flight.
    AllWorkloadsDone,
}

/// Why `acquire_this_thread` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseCause {
    UserRequest,
    AllWorkloadsDone,
    SchedulerStopped,
}

/// Identifies one acquisition of a thread, for `release_threads`.
///
/// Records are reused. The generation ties the handle to the acquisition it
/// came from, so a handle kept past its thread's return releases nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcquiredThreadHandle {
    index: u32,
    generation: u32,
}

impl AcquiredThreadHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

#[derive(Debug, Clone, Copy)]
struct AcquiredThread {
    thread: Option<ThreadId>,
    /// Bumped every time the record is given back.
    generation: u32,
    condition: ReleaseCondition,
    cause: Option<ReleaseCause>,
}

impl AcquiredThread {
    const VACANT: Self = Self {
        thread: None,
        generation: 0,
        condition: ReleaseCondition::UserRequest,
        cause: None,
    };

    fn is_held_by(&self, handle: AcquiredThreadHandle) -> bool {
        self.thread.is_some() && self.generation == handle.generation
    }
}

pub(crate) struct AcquiredThreads {
    state: Mutex<Registry>,
}

impl AcquiredThreads {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(Registry {
                records: vec![AcquiredThread::VACANT; capacity],
                free: (0..capacity as u32).rev().collect(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Registry> {
        // Every update leaves the registry consistent, so a poisoned lock is
        // still safe to use.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry contents; reached through [`AcquiredThreads::lock`].
///
/// Record `i` drives the thread slot `slots[i]` passed to the release calls.
pub(crate) struct Registry {
    records: Vec<AcquiredThread>,
    free: Vec<u32>,
}

impl Registry {
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    pub fn active_count(&self) -> usize {
        self.records.len() - self.free.len()
    }

    /// Record the calling thread. `None` when every record is taken.
    pub fn register(&mut self, condition: ReleaseCondition) -> Option<AcquiredThreadHandle> {
        let index = self.free.pop()?;
        let record = &mut self.records[index as usize];
        *record = AcquiredThread {
            thread: Some(thread::current().id()),
            generation: record.generation,
            condition,
            cause: None,
        };
        Some(AcquiredThreadHandle {
            index,
            generation: record.generation,
        })
    }

    /// Give the record back and report why its thread was released.
    ///
    /// `handle` must be the one `register` returned to the calling thread.
    pub fn unregister(&mut self, handle: AcquiredThreadHandle) -> Option<ReleaseCause> {
        let record = &mut self.records[handle.index as usize];
        debug_assert!(record.is_held_by(handle));
        let cause = record.cause;
        *record = AcquiredThread {
            generation: record.generation.wrapping_add(1),
            ..AcquiredThread::VACANT
        };
        self.free.push(handle.index);
        cause
    }

    /// Release one thread. `false` if the handle names no current
    /// acquisition: out of range, vacant, or from an earlier generation.
    pub fn release(
        &mut self,
        handle: AcquiredThreadHandle,
        cause: ReleaseCause,
        slots: &[ThreadContext],
    ) -> bool {
        let Some(record) = self.records.get_mut(handle.index as usize) else {
            return false;
        };
        if !record.is_held_by(handle) {
            return false;
        }
        record.cause = Some(cause);
        slots[handle.index as usize].request_join();
        true
    }

    /// Release every acquired thread, or only those waiting for the
    /// workloads to drain. Returns how many were signalled.
    pub fn release_all(
        &mut self,
        cause: ReleaseCause,
        only: Option<ReleaseCondition>,
        slots: &[ThreadContext],
    ) -> usize {
        let mut released = 0;
        for (index, record) in self.records.iter_mut().enumerate() {
            if record.thread.is_none() {
                continue;
            }
            if only.is_some_and(|condition| condition != record.condition) {
                continue;
            }
            record.cause = Some(cause);
            slots[index].request_join();
            released += 1;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(n: usize) -> Vec<ThreadContext> {
        (0..n).map(|_| ThreadContext::new()).collect()
    }

    #[test]
    fn register_until_full() {
        let registry = AcquiredThreads::new(2);
        let mut reg = registry.lock();
        let a = reg.register(ReleaseCondition::UserRequest).unwrap();
        let b = reg.register(ReleaseCondition::UserRequest).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.active_count(), 2);
        assert!(reg.register(ReleaseCondition::UserRequest).is_none());
        assert_eq!(reg.records[a.index() as usize].thread, Some(thread::current().id()));
    }

    #[test]
    fn release_records_cause() {
        let registry = AcquiredThreads::new(2);
        let slots = slots(2);
        let mut reg = registry.lock();
        let a = reg.register(ReleaseCondition::UserRequest).unwrap();

        assert!(reg.release(a, ReleaseCause::UserRequest, &slots));
        assert!(slots[a.index() as usize].join_requested());
        assert_eq!(reg.unregister(a), Some(ReleaseCause::UserRequest));
        assert_eq!(reg.active_count(), 0);
    }

    #[test]
    fn releasing_vacant_record_is_ignored() {
        let registry = AcquiredThreads::new(1);
        let slots = slots(1);
        let mut reg = registry.lock();
        let vacant = AcquiredThreadHandle::from_parts(0, 0);
        let out_of_range = AcquiredThreadHandle::from_parts(9, 0);
        assert!(!reg.release(vacant, ReleaseCause::UserRequest, &slots));
        assert!(!reg.release(out_of_range, ReleaseCause::UserRequest, &slots));
        assert!(!slots[0].join_requested());
    }

    #[test]
    fn drain_release_only_hits_matching_condition() {
        let registry = AcquiredThreads::new(3);
        let slots = slots(3);
        let mut reg = registry.lock();
        let user = reg.register(ReleaseCondition::UserRequest).unwrap();
        let drain = reg.register(ReleaseCondition::AllWorkloadsDone).unwrap();

        let released = reg.release_all(
            ReleaseCause::AllWorkloadsDone,
            Some(ReleaseCondition::AllWorkloadsDone),
            &slots,
        );
        assert_eq!(released, 1);
        assert!(slots[drain.index() as usize].join_requested());
        assert!(!slots[user.index() as usize].join_requested());

        assert_eq!(reg.release_all(ReleaseCause::UserRequest, None, &slots), 2);
        assert_eq!(reg.unregister(user), Some(ReleaseCause::UserRequest));
    }

    #[test]
    fn handle_from_earlier_acquisition_releases_nothing() {
        let registry = AcquiredThreads::new(1);
        let slots = slots(1);
        let mut reg = registry.lock();

        let first = reg.register(ReleaseCondition::UserRequest).unwrap();
        assert_eq!(reg.unregister(first), None);
        let second = reg.register(ReleaseCondition::UserRequest).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);

        assert!(!reg.release(first, ReleaseCause::UserRequest, &slots));
        assert!(!slots[0].join_requested());
        assert!(reg.release(second, ReleaseCause::UserRequest, &slots));
        assert!(slots[0].join_requested());
        assert_eq!(reg.unregister(second), Some(ReleaseCause::UserRequest));
    }

    #[test]
    fn unreleased_record_has_no_cause() {
        let registry = AcquiredThreads::new(1);
        let mut reg = registry.lock();
        let a = reg.register(ReleaseCondition::AllWorkloadsDone).unwrap();
        assert_eq!(reg.unregister(a), None);
        assert_eq!(reg.capacity(), 1);
    }
}
