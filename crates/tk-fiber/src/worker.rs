// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker loop and per-thread fiber bookkeeping.
//!
//! Every fiber runs the same loop: take a dispatched task and run it, or
//! resume a woken fiber, or yield the OS thread. A task that waits on a
//! workload suspends the whole fiber; the thread carries on in another
//! fiber from the pool.
//!
//! A switch never does bookkeeping itself. The outgoing fiber is described
//! in its thread's `prev` slot and whichever context runs next on that
//! thread settles it in [`on_context_return`]: pool it, or put it on the wait
//! list it asked for. By then its registers are saved, so another thread may
//! resume it as soon as it becomes visible.
//!
//! Fibers migrate between OS threads. Anything thread-local is reached via
//! [`current_worker`], which is not inlined and is called again after every
//! switch.

use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::error;

use crate::context::ExecutionContext;
use crate::fiber::NULL_INDEX;
use crate::queue::BoundedQueue;
use crate::scheduler::SchedulerShared;
use crate::task::{panic_message, DispatchedTask};
use crate::workload::WorkloadHandle;

/// The fiber a thread just switched away from.
#[derive(Debug, Clone, Copy)]
struct PausedFiber {
    fiber: u32,
    /// `None`: nothing left to resume it for, pool it.
    waiting_on: Option<WorkloadHandle>,
}

/// State of one OS thread while it runs the worker loop.
///
/// Slots live in a fixed array owned by the scheduler. Everything except
/// `join_flag` is only touched by the thread currently bound to the slot.
pub(crate) struct ThreadContext {
    /// The thread's native stack, converted into a context.
    home: ExecutionContext,
    current: UnsafeCell<u32>,
    prev: UnsafeCell<Option<PausedFiber>>,
    join_flag: AtomicBool,
}

unsafe impl Sync for ThreadContext {}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadContext {
    pub fn new() -> Self {
        Self {
            home: ExecutionContext::thread(),
            current: UnsafeCell::new(NULL_INDEX),
            prev: UnsafeCell::new(None),
            join_flag: AtomicBool::new(false),
        }
    }

    /// Ask the thread bound to this slot to leave its loop.
    pub fn request_join(&self) {
        self.join_flag.store(true, Ordering::Release);
    }

    pub fn clear_join(&self) {
        self.join_flag.store(false, Ordering::Release);
    }

    pub fn join_requested(&self) -> bool {
        self.join_flag.load(Ordering::Acquire)
    }

    fn current(&self) -> u32 {
        unsafe { *self.current.get() }
    }

    fn set_current(&self, fiber: u32) {
        unsafe { *self.current.get() = fiber };
    }

    fn set_prev(&self, prev: Option<PausedFiber>) {
        unsafe { *self.prev.get() = prev };
    }

    fn take_prev(&self) -> Option<PausedFiber> {
        unsafe { (*self.prev.get()).take() }
    }
}

#[derive(Clone, Copy)]
struct WorkerRef {
    shared: *const SchedulerShared,
    slot: usize,
}

thread_local! {
    static WORKER: Cell<Option<WorkerRef>> = const { Cell::new(None) };
}

#[inline(never)]
fn current_worker_ref() -> Option<WorkerRef> {
    WORKER.with(Cell::get)
}

/// The scheduler and thread slot the calling code runs under.
///
/// Only valid inside a fiber or the home context of a worker thread. The
/// returned references must not be held across a switch.
fn current_worker<'a>() -> (&'a SchedulerShared, &'a ThreadContext) {
    let worker = current_worker_ref().expect("fiber code running outside of a worker thread");
    // SAFETY: the pointer was set by `run_thread`, which keeps the shared
    // state borrowed until the thread leaves the loop.
    let shared = unsafe { &*worker.shared };
    (shared, &shared.threads[worker.slot])
}

/// Whether the calling code runs on a fiber of `shared`.
pub(crate) fn is_worker_of(shared: &SchedulerShared) -> bool {
    current_worker_ref().is_some_and(|w| std::ptr::eq(w.shared, shared))
}

/// Whether the calling code runs on a fiber of any scheduler.
pub(crate) fn is_any_worker() -> bool {
    current_worker_ref().is_some()
}

/// Run the calling OS thread as a worker bound to `slot` until its join
/// flag or the scheduler's is set.
pub(crate) fn run_thread(shared: &SchedulerShared, slot: usize) {
    let outer = WORKER.with(|w| {
        w.replace(Some(WorkerRef {
            shared: shared as *const SchedulerShared,
            slot,
        }))
    });

    let thread = &shared.threads[slot];
    thread.set_prev(None);
    let first = shared.fibers.pop_context();
    thread.set_current(first);
    // SAFETY: `first` came out of the pool, so nobody else is running it.
    unsafe { ExecutionContext::switch(&thread.home, &shared.fibers.get(first).context) };

    // Back on the home stack, which never leaves this thread. `current` is
    // the fiber whose loop ended; it is parked in `exit_to_home`.
    let last = thread.current();
    thread.set_current(NULL_INDEX);
    shared.fibers.pool_context(last);

    WORKER.with(|w| w.set(outer));
}

/// First frame of every fiber.
pub(crate) extern "C" fn fiber_main(_index: usize) -> ! {
    loop {
        on_context_return();
        worker_loop();
        exit_to_home();
    }
}

fn worker_loop() {
    loop {
        let (shared, thread) = current_worker();
        if thread.join_requested() || shared.is_stopped() {
            return;
        }

        if let Some(dispatch) = shared.dispatch.try_pop() {
            run_task(shared, dispatch);
            continue;
        }

        if let Some(ready) = shared.fibers.try_pop_ready() {
            yield_to(ready);
            continue;
        }

        thread::yield_now();
    }
}

fn run_task(shared: &SchedulerShared, dispatch: DispatchedTask) {
    let DispatchedTask { task, workload } = dispatch;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        error!(workload, panic = %panic_message(&*payload), "task panicked");
    }
    shared.on_task_completed(workload);
}

/// Settle the fiber this thread just switched away from.
fn on_context_return() {
    let (shared, thread) = current_worker();
    let Some(prev) = thread.take_prev() else {
        return;
    };
    match prev.waiting_on {
        Some(handle) => {
            shared
                .workloads
                .insert_waiter(handle, prev.fiber, &shared.fibers);
        }
        None => shared.fibers.pool_context(prev.fiber),
    }
}

/// Resume a woken fiber. The running fiber is idle in the loop, so it goes
/// back to the free pool.
fn yield_to(target: u32) {
    let (shared, thread) = current_worker();
    let from = thread.current();
    thread.set_prev(Some(PausedFiber {
        fiber: from,
        waiting_on: None,
    }));
    thread.set_current(target);
    // SAFETY: `target` came out of the ready queue; `from` is running here.
    unsafe {
        ExecutionContext::switch(
            &shared.fibers.get(from).context,
            &shared.fibers.get(target).context,
        )
    };
    on_context_return();
}

/// Suspend the running fiber until `handle` closes.
pub(crate) fn wait_for(handle: WorkloadHandle) {
    let (shared, thread) = current_worker();
    let from = thread.current();
    thread.set_prev(Some(PausedFiber {
        fiber: from,
        waiting_on: Some(handle),
    }));
    let next = shared.fibers.pop_context();
    thread.set_current(next);
    // SAFETY: `next` came out of the pool; `from` is running here.
    unsafe {
        ExecutionContext::switch(
            &shared.fibers.get(from).context,
            &shared.fibers.get(next).context,
        )
    };
    on_context_return();
}

/// Leave fiber mode: hand the thread back to its native stack.
fn exit_to_home() {
    let (shared, thread) = current_worker();
    let from = thread.current();
    // SAFETY: the home context was switched out of by `run_thread` on this
    // very thread and is resumed by nobody else.
    unsafe { ExecutionContext::switch(&shared.fibers.get(from).context, &thread.home) };
}
