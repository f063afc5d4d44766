//! The slice of the thread system the VM layer consumes.

use core::sync::atomic::AtomicU16;

pub type Pid = u16;
pub type Tid = u16;
pub type AtomicTid = AtomicU16;

/// Reserved: no real thread has this id, so it marks a free lock.
pub const NO_TID: Tid = 0;

/// What the VM layer needs to know about the running thread.
///
/// Implemented by the scheduler in the kernel and by a host fixture in tests.
pub trait ThreadContext: Send + Sync {
    /// Id of the running thread. Never [`NO_TID`].
    fn current_tid(&self) -> Tid;

    /// The user stack pointer saved when the running thread last entered the kernel,
    /// if it came from user mode.
    fn user_stack_pointer(&self) -> Option<usize>;

    /// Block the running thread for at least `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);
}
