//! A lock that remembers which thread holds it.
//!
//! Frame locks are taken in one call and released in another (a page pinned by
//! `lock_for_access` stays locked until `unlock_for_access`), so they cannot be
//! guard-based. Instead the holder's [`Tid`] is recorded, which also lets callers
//! assert ownership before touching the frame.

use crate::threading::{AtomicTid, Tid, NO_TID};
use core::fmt;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Release};

pub struct FrameLock {
    holding_thread: AtomicTid,
}

impl FrameLock {
    pub const fn new() -> Self {
        Self {
            holding_thread: AtomicTid::new(NO_TID),
        }
    }

    /// Spin until the lock is free, then take it for `tid`.
    ///
    /// Panics if `tid` already holds the lock: these locks are not recursive.
    pub fn acquire(&self, tid: Tid) {
        assert_ne!(tid, NO_TID, "thread id 0 cannot hold a frame lock");
        assert!(
            !self.held_by(tid),
            "thread {tid} tried to re-acquire a frame lock it already holds"
        );
        while self
            .holding_thread
            .compare_exchange_weak(NO_TID, tid, AcqRel, Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Take the lock for `tid` if nobody holds it. Fails if `tid` itself holds it.
    pub fn try_acquire(&self, tid: Tid) -> bool {
        assert_ne!(tid, NO_TID, "thread id 0 cannot hold a frame lock");
        self.holding_thread
            .compare_exchange(NO_TID, tid, AcqRel, Acquire)
            .is_ok()
    }

    /// Release the lock. Releasing a lock held by someone else is a caller bug.
    pub fn release(&self, tid: Tid) {
        let released = self
            .holding_thread
            .compare_exchange(tid, NO_TID, Release, Acquire);
        if let Err(holder) = released {
            panic!("thread {tid} released a frame lock held by {holder}");
        }
    }

    pub fn held_by(&self, tid: Tid) -> bool {
        self.holding_thread.load(Acquire) == tid
    }

    pub fn is_locked(&self) -> bool {
        self.holding_thread.load(Acquire) != NO_TID
    }
}

impl Default for FrameLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.holding_thread.load(Acquire) {
            NO_TID => write!(f, "FrameLock(free)"),
            tid => write!(f, "FrameLock(held by {tid})"),
        }
    }
}
