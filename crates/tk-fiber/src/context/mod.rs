// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackful execution contexts.
//!
//! An [`ExecutionContext`] is either a fiber (own stack, fresh entry point)
//! or the native stack of an OS thread that was converted into a context so
//! fibers have somewhere to switch back to. Four operations: create, destroy
//! (`Drop`), switch-into, convert-current-thread.
//!
//! The switch itself only saves callee-saved registers on the outgoing stack
//! and records the stack pointer. Everything else is the scheduler's job.

mod stack;

#[cfg(target_arch = "aarch64")]
#[path = "aarch64.rs"]
mod arch;
#[cfg(target_arch = "x86_64")]
#[path = "x86_64.rs"]
mod arch;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("tk-fiber supports unix targets on x86_64 or aarch64 only");

use std::cell::UnsafeCell;
use std::io;

use stack::Stack;

/// Entry point of a fiber. Receives the argument given to
/// [`ExecutionContext::create`] and must never return.
pub(crate) type FiberEntry = extern "C" fn(usize) -> !;

/// A resumable unit of execution.
pub(crate) struct ExecutionContext {
    /// Saved stack pointer while suspended. Garbage while running.
    sp: UnsafeCell<usize>,
    /// `None` for a converted OS thread: it runs on the thread's own stack.
    stack: Option<Stack>,
}

// The saved stack pointer is only written by the switch out of this context
// and only read by the switch into it. The scheduler orders those two through
// its queues, so a context is never touched by two threads at once.
unsafe impl Send for ExecutionContext {}
unsafe impl Sync for ExecutionContext {}

impl ExecutionContext {
    /// Create a fiber with a fresh stack of at least `stack_size` bytes.
    /// The first switch into it calls `entry(arg)`.
    pub fn create(stack_size: usize, entry: FiberEntry, arg: usize) -> io::Result<Self> {
        let stack = Stack::new(stack_size)?;
        // SAFETY: the stack is freshly mapped, writable and owned by us.
        let sp = unsafe { arch::init_stack(stack.top(), entry as usize, arg) };
        Ok(Self {
            sp: UnsafeCell::new(sp),
            stack: Some(stack),
        })
    }

    /// A context standing for whatever OS thread first switches out of it.
    ///
    /// Nothing is captured until that switch; the slot simply receives the
    /// thread's stack pointer.
    pub fn thread() -> Self {
        Self {
            sp: UnsafeCell::new(0),
            stack: None,
        }
    }

    /// Whether this context owns a fiber stack.
    pub fn is_fiber(&self) -> bool {
        self.stack.is_some()
    }

    /// Suspend the running code into `from` and resume `to`.
    ///
    /// Returns when something later switches back into `from`, possibly on a
    /// different OS thread.
    ///
    /// # Safety
    /// `from` must describe the code that is currently running, and `to`
    /// must be suspended (created and never entered, or switched out of) and
    /// not concurrently resumed by any other thread.
    pub unsafe fn switch(from: &Self, to: &Self) {
        let target = *to.sp.get();
        arch::switch_stack(from.sp.get(), target);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("fiber", &self.is_fiber())
            .field("stack", &self.stack)
            .finish()
    }
}
