// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler object.
//!
//! Owns every pool, the dispatch queue and the thread slots. Worker threads,
//! owned or acquired, all run the loop in [`crate::worker`] against the same
//! [`SchedulerShared`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, error, warn};

use crate::acquire::{AcquiredThreadHandle, AcquiredThreads, ReleaseCause, ReleaseCondition};
use crate::config::{logical_core_count, SchedulerConfig, ThreadPoolParams};
use crate::error::SchedulerError;
use crate::fiber::FiberPool;
use crate::queue::push_spin;
use crate::task::{DispatchedTask, Task};
use crate::worker::{self, ThreadContext};
use crate::workload::{WorkloadHandle, WorkloadPool};

/// State shared between the scheduler handle and every worker thread.
pub(crate) struct SchedulerShared {
    pub config: SchedulerConfig,
    pub fibers: FiberPool,
    pub workloads: WorkloadPool,
    pub dispatch: ArrayQueue<DispatchedTask>,
    /// `[0, max_threads)` for owned threads, then one slot per acquired-thread record.
    pub threads: Box<[ThreadContext]>,
    pub acquired: AcquiredThreads,
    /// Set once by `stop`; every loop exits on it.
    join_flag: AtomicBool,
}

impl SchedulerShared {
    pub fn is_stopped(&self) -> bool {
        self.join_flag.load(Ordering::Acquire)
    }

    fn acquired_slots(&self) -> &[ThreadContext] {
        &self.threads[self.config.max_threads..]
    }

    /// Count one task of workload slot `index` as done.
    pub fn on_task_completed(&self, index: u32) {
        if !self.workloads.complete_task(index, &self.fibers) || !self.workloads.all_free() {
            return;
        }
        let mut registry = self.acquired.lock();
        // Someone may have scheduled again before we got the lock.
        if self.workloads.all_free() {
            let released = registry.release_all(
                ReleaseCause::AllWorkloadsDone,
                Some(ReleaseCondition::AllWorkloadsDone),
                self.acquired_slots(),
            );
            if released > 0 {
                debug!(released, "all workloads done, releasing acquired threads");
            }
        }
    }
}

/// A cooperative fiber scheduler.
///
/// Lifecycle: [`Scheduler::new`] allocates everything, then
/// [`init_thread_pool`](Self::init_thread_pool) and/or
/// [`acquire_this_thread`](Self::acquire_this_thread) supply threads, work is
/// added with [`schedule_work`](Self::schedule_work), and
/// [`stop`](Self::stop) (or dropping the scheduler) shuts the owned threads
/// down.
///
/// ```no_run
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use tk_fiber::{ReleaseCondition, Scheduler, SchedulerConfig, Task, ThreadPoolParams};
///
/// let scheduler = Scheduler::new(SchedulerConfig::default())?;
/// scheduler.init_thread_pool(ThreadPoolParams::optimal())?;
///
/// let hits = Arc::new(AtomicUsize::new(0));
/// let tasks = (0..100).map(|_| {
///     let hits = hits.clone();
///     Task::new(move || {
///         hits.fetch_add(1, Ordering::Relaxed);
///     })
/// });
/// let workload = scheduler.schedule_work(tasks.collect::<Vec<_>>());
///
/// // Lend this thread until the work drains.
/// scheduler.acquire_this_thread(ReleaseCondition::AllWorkloadsDone)?;
/// scheduler.wait_for_workload(workload);
/// assert_eq!(hits.load(Ordering::Relaxed), 100);
/// # Ok::<(), tk_fiber::SchedulerError>(())
/// ```
pub struct Scheduler {
    /// `None` until the pool is initialised.
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Allocate every pool and all fiber stacks. No thread is started.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let fibers = FiberPool::new(config.max_fibers, config.fiber_stack_size, worker::fiber_main)
            .map_err(SchedulerError::StackAllocation)?;
        let threads = (0..config.max_threads * 2)
            .map(|_| ThreadContext::new())
            .collect();

        debug!(
            fibers = fibers.len(),
            stack_size = config.fiber_stack_size,
            workloads = config.max_workloads,
            dispatch = config.max_dispatched_tasks,
            "scheduler created"
        );

        let shared = SchedulerShared {
            fibers,
            workloads: WorkloadPool::new(config.max_workloads),
            dispatch: ArrayQueue::new(config.max_dispatched_tasks),
            threads,
            acquired: AcquiredThreads::new(config.max_threads),
            join_flag: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            workers: Mutex::new(None),
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    fn workers(&self) -> MutexGuard<'_, Option<Vec<JoinHandle<()>>>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the scheduler-owned worker threads. May be called once.
    ///
    /// A count above `max_threads` is clamped. Zero is allowed for callers
    /// that only ever lend their own threads.
    pub fn init_thread_pool(&self, params: ThreadPoolParams) -> Result<(), SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        let mut workers = self.workers();
        if let Some(running) = workers.as_ref() {
            return Err(SchedulerError::PoolAlreadyInitialized(running.len()));
        }

        let max = self.shared.config.max_threads;
        let mut count = params.thread_count;
        if count > max {
            warn!(requested = count, max, "too many worker threads requested, clamping");
            count = max;
        }
        let cores = logical_core_count();
        if count > cores {
            warn!(threads = count, cores, "more worker threads than logical cores");
        }

        let core_ids = if params.core_lock {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if params.core_lock && core_ids.len() < count {
            warn!(
                threads = count,
                cores = core_ids.len(),
                "not enough core ids to pin every worker"
            );
        }

        let handles = workers.insert(Vec::with_capacity(count));
        for index in 0..count {
            let shared = Arc::clone(&self.shared);
            let core = core_ids.get(index).copied();
            let handle = thread::Builder::new()
                .name(format!("tk-worker-{index}"))
                .spawn(move || {
                    if let Some(core) = core {
                        if !core_affinity::set_for_current(core) {
                            warn!(worker = index, core = core.id, "failed to pin worker thread");
                        }
                    }
                    worker::run_thread(&shared, index);
                })
                .map_err(|source| SchedulerError::ThreadSpawn { index, source })?;
            handles.push(handle);
        }

        debug!(threads = count, core_lock = params.core_lock, "thread pool started");
        Ok(())
    }

    /// Lend the calling thread to the scheduler until it is released.
    pub fn acquire_this_thread(
        &self,
        condition: ReleaseCondition,
    ) -> Result<ReleaseCause, SchedulerError> {
        self.acquire_this_thread_with(condition, |_| {})
    }

    /// Like [`acquire_this_thread`](Self::acquire_this_thread), handing the
    /// thread's handle to `on_acquired` before the worker loop starts. The
    /// handle is what [`release_threads`](Self::release_threads) takes.
    ///
    /// With [`ReleaseCondition::AllWorkloadsDone`] and nothing in flight this
    /// returns at once, without calling `on_acquired`.
    ///
    /// Fails with [`SchedulerError::NestedAcquire`] when called from inside a
    /// task, of this scheduler or any other.
    pub fn acquire_this_thread_with<F>(
        &self,
        condition: ReleaseCondition,
        on_acquired: F,
    ) -> Result<ReleaseCause, SchedulerError>
    where
        F: FnOnce(AcquiredThreadHandle),
    {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        // A fiber's thread belongs to the loop it runs in, whichever
        // scheduler that is.
        if worker::is_any_worker() {
            return Err(SchedulerError::NestedAcquire);
        }

        let handle = {
            let mut registry = self.shared.acquired.lock();
            if condition == ReleaseCondition::AllWorkloadsDone && self.shared.workloads.all_free() {
                return Ok(ReleaseCause::AllWorkloadsDone);
            }
            let capacity = registry.capacity();
            let handle = registry
                .register(condition)
                .ok_or(SchedulerError::AcquireCapacity(capacity))?;
            self.shared.acquired_slots()[handle.index() as usize].clear_join();
            handle
        };

        debug!(handle = handle.index(), ?condition, "thread acquired");
        on_acquired(handle);

        let slot = self.shared.config.max_threads + handle.index() as usize;
        worker::run_thread(&self.shared, slot);

        let cause = self
            .shared
            .acquired
            .lock()
            .unregister(handle)
            .unwrap_or(ReleaseCause::SchedulerStopped);
        debug!(handle = handle.index(), ?cause, "thread released");
        Ok(cause)
    }

    /// Ask the given acquired threads to return to their callers.
    ///
    /// Each one finishes the task it is running first. Handles that name no
    /// acquired thread are skipped.
    pub fn release_threads(&self, handles: &[AcquiredThreadHandle]) {
        let mut registry = self.shared.acquired.lock();
        for &handle in handles {
            if !registry.release(handle, ReleaseCause::UserRequest, self.shared.acquired_slots()) {
                warn!(
                    handle = handle.index(),
                    generation = handle.generation(),
                    "release requested for a thread that is not acquired"
                );
            }
        }
    }

    pub fn release_all_threads(&self) {
        let released = self.shared.acquired.lock().release_all(
            ReleaseCause::UserRequest,
            None,
            self.shared.acquired_slots(),
        );
        debug!(released, "released all acquired threads");
    }

    /// Queue `tasks` as one workload and return its handle.
    ///
    /// Never blocks on the tasks themselves, but spins while the workload
    /// pool or the dispatch queue is full. An empty set yields a handle that
    /// is already done.
    pub fn schedule_work<I>(&self, tasks: I) -> WorkloadHandle
    where
        I: IntoIterator<Item = Task>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut tasks = tasks.into_iter();
        let expected = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        // An empty workload still takes a slot for one count, released below.
        let counted = expected.max(1);

        let handle = self.shared.workloads.allocate(counted);
        let mut dispatched = 0u32;
        for task in tasks.by_ref().take(expected as usize) {
            push_spin(
                &self.shared.dispatch,
                DispatchedTask {
                    task,
                    workload: handle.index(),
                },
            );
            dispatched += 1;
        }

        let dropped = tasks.count();
        if dropped > 0 {
            warn!(
                workload = handle.index(),
                reported = expected,
                dropped,
                "task iterator yielded more items than it reported, extra tasks dropped"
            );
        }

        // The iterator may also report more items than it yields.
        for _ in dispatched..counted {
            self.shared.on_task_completed(handle.index());
        }
        handle
    }

    /// Wait until every task of `handle` has run.
    ///
    /// Inside a task this suspends the calling fiber and the thread moves on
    /// to other work. Anywhere else it falls back to
    /// [`wait_for_workload_idle`](Self::wait_for_workload_idle).
    pub fn wait_for_workload(&self, handle: WorkloadHandle) {
        if self.is_workload_done(handle) {
            return;
        }
        if worker::is_worker_of(&self.shared) {
            worker::wait_for(handle);
        } else {
            debug!(workload = handle.index(), "not on a worker fiber, waiting idle");
            self.wait_for_workload_idle(handle);
        }
    }

    /// Wait for `handle` by yielding the OS thread in a loop.
    pub fn wait_for_workload_idle(&self, handle: WorkloadHandle) {
        while !self.is_workload_done(handle) {
            thread::yield_now();
        }
    }

    pub fn is_workload_done(&self, handle: WorkloadHandle) -> bool {
        self.shared.workloads.is_done(handle)
    }

    /// Workloads scheduled and not yet finished.
    pub fn workloads_in_flight(&self) -> usize {
        self.shared.workloads.in_flight()
    }

    /// Make every worker loop exit and join the owned threads.
    ///
    /// Acquired threads return [`ReleaseCause::SchedulerStopped`] to their
    /// callers. Tasks suspended in `wait_for_workload` are never resumed.
    /// Calling this from an owned worker thread skips joining that thread.
    pub fn stop(&self) {
        if self.shared.join_flag.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles = self.workers().take().unwrap_or_default();
        let current = thread::current().id();
        let mut joined = 0usize;
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("tk-worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "worker thread panicked");
            }
            joined += 1;
        }
        debug!(
            joined,
            fibers_free = self.shared.fibers.free_count(),
            fibers_ready = self.shared.fibers.ready_count(),
            "scheduler stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Threads spawned by [`init_thread_pool`](Self::init_thread_pool).
    pub fn owned_thread_count(&self) -> usize {
        self.workers().as_ref().map_or(0, Vec::len)
    }

    /// Threads currently lent through `acquire_this_thread`.
    pub fn acquired_thread_count(&self) -> usize {
        self.shared.acquired.lock().active_count()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.shared.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn small() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_max_threads(4)
            .with_max_fibers(8)
            .with_max_workloads(4)
            .with_max_dispatched_tasks(16)
            .with_fiber_stack_size(64 * 1024)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Scheduler::new(small().with_max_workloads(0)).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Config(ConfigError::ZeroCapacity("max_workloads"))
        ));
    }

    #[test]
    fn slots_cover_owned_and_acquired_threads() {
        let scheduler = Scheduler::new(small()).unwrap();
        assert_eq!(scheduler.shared.threads.len(), 8);
        assert_eq!(scheduler.shared.acquired_slots().len(), 4);
        assert_eq!(scheduler.shared.fibers.len(), 8);
    }

    #[test]
    fn empty_workload_is_done_immediately() {
        let scheduler = Scheduler::new(small()).unwrap();
        let handle = scheduler.schedule_work(Vec::new());
        assert!(scheduler.is_workload_done(handle));
        assert_eq!(scheduler.workloads_in_flight(), 0);
        scheduler.wait_for_workload(handle);
    }

    #[test]
    fn scheduled_work_stays_queued_without_threads() {
        let scheduler = Scheduler::new(small()).unwrap();
        let handle = scheduler.schedule_work(vec![Task::new(|| {}), Task::new(|| {})]);
        assert!(!scheduler.is_workload_done(handle));
        assert_eq!(scheduler.workloads_in_flight(), 1);
        assert_eq!(scheduler.shared.dispatch.len(), 2);
    }

    /// Yields `actual` tasks while claiming `reported`.
    struct Miscounted {
        actual: usize,
        reported: usize,
    }

    impl Iterator for Miscounted {
        type Item = Task;

        fn next(&mut self) -> Option<Task> {
            if self.actual == 0 {
                return None;
            }
            self.actual -= 1;
            self.reported = self.reported.saturating_sub(1);
            Some(Task::new(|| {}))
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            (self.reported, Some(self.reported))
        }
    }

    impl ExactSizeIterator for Miscounted {}

    #[test]
    fn extra_tasks_past_reported_length_are_not_queued() {
        let scheduler = Scheduler::new(small()).unwrap();
        let handle = scheduler.schedule_work(Miscounted {
            actual: 5,
            reported: 2,
        });
        assert_eq!(scheduler.shared.dispatch.len(), 2);
        assert!(!scheduler.is_workload_done(handle));

        scheduler.init_thread_pool(ThreadPoolParams::new(1, false)).unwrap();
        scheduler.wait_for_workload(handle);
        assert!(scheduler.shared.dispatch.is_empty());
    }

    #[test]
    fn shortfall_below_reported_length_is_completed() {
        let scheduler = Scheduler::new(small()).unwrap();
        let handle = scheduler.schedule_work(Miscounted {
            actual: 1,
            reported: 3,
        });
        assert_eq!(scheduler.shared.dispatch.len(), 1);
        assert!(!scheduler.is_workload_done(handle));

        scheduler.init_thread_pool(ThreadPoolParams::new(1, false)).unwrap();
        scheduler.wait_for_workload(handle);
        assert_eq!(scheduler.workloads_in_flight(), 0);
    }

    #[test]
    fn acquire_with_nothing_outstanding_returns_at_once() {
        let scheduler = Scheduler::new(small()).unwrap();
        let mut called = false;
        let cause = scheduler
            .acquire_this_thread_with(ReleaseCondition::AllWorkloadsDone, |_| called = true)
            .unwrap();
        assert_eq!(cause, ReleaseCause::AllWorkloadsDone);
        assert!(!called);
        assert_eq!(scheduler.acquired_thread_count(), 0);
    }

    #[test]
    fn pool_initialises_once() {
        let scheduler = Scheduler::new(small()).unwrap();
        scheduler.init_thread_pool(ThreadPoolParams::new(1, false)).unwrap();
        assert_eq!(scheduler.owned_thread_count(), 1);
        let err = scheduler
            .init_thread_pool(ThreadPoolParams::new(1, false))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::PoolAlreadyInitialized(1)));
        scheduler.stop();
    }

    #[test]
    fn thread_count_is_clamped() {
        let scheduler = Scheduler::new(small()).unwrap();
        scheduler.init_thread_pool(ThreadPoolParams::new(100, false)).unwrap();
        assert_eq!(scheduler.owned_thread_count(), 4);
        scheduler.stop();
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let scheduler = Scheduler::new(small()).unwrap();
        scheduler.init_thread_pool(ThreadPoolParams::new(2, false)).unwrap();
        scheduler.stop();
        scheduler.stop();
        assert!(scheduler.is_stopped());
        assert_eq!(scheduler.owned_thread_count(), 0);

        assert!(matches!(
            scheduler.init_thread_pool(ThreadPoolParams::new(1, false)),
            Err(SchedulerError::Stopped)
        ));
        assert!(matches!(
            scheduler.acquire_this_thread(ReleaseCondition::UserRequest),
            Err(SchedulerError::Stopped)
        ));
    }

    #[test]
    fn releasing_unknown_handles_is_harmless() {
        let scheduler = Scheduler::new(small()).unwrap();
        scheduler.release_threads(&[AcquiredThreadHandle::from_parts(3, 0)]);
        scheduler.release_all_threads();
        assert_eq!(scheduler.acquired_thread_count(), 0);
    }
}
