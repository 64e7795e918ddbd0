// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Units of work handed to the scheduler.

use std::any::Any;

type Routine = Box<dyn FnOnce() + Send + 'static>;

/// A routine to run exactly once on some worker thread.
///
/// Tasks run inside a fiber, so they may call
/// [`Scheduler::wait_for_workload`](crate::Scheduler::wait_for_workload)
/// to suspend until another workload finishes.
pub struct Task {
    routine: Routine,
}

impl Task {
    pub fn new<F>(routine: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            routine: Box::new(routine),
        }
    }

    /// Plain function plus an opaque argument, for callers that keep their
    /// task state elsewhere and pass an index or address.
    pub fn from_fn(routine: fn(usize), arg: usize) -> Self {
        Self::new(move || routine(arg))
    }

    pub(crate) fn run(self) {
        (self.routine)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// A task sitting in the dispatch queue, tagged with its workload slot.
#[derive(Debug)]
pub(crate) struct DispatchedTask {
    pub task: Task,
    pub workload: u32,
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static LAST_ARG: AtomicUsize = AtomicUsize::new(0);

    fn record(arg: usize) {
        LAST_ARG.store(arg, Ordering::SeqCst);
    }

    #[test]
    fn closure_task_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        Task::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fn_task_receives_argument() {
        Task::from_fn(record, 42).run();
        assert_eq!(LAST_ARG.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn panic_message_variants() {
        let err = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*err), "boom");
        let err = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*err), "code 7");
        let err = std::panic::catch_unwind(|| std::panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(&*err), "unknown panic");
    }
}
