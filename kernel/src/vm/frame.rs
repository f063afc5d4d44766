//! The frame table: ownership of the physical frames user pages live in.
//!
//! Every frame has a [`FrameLock`]. Holding it is the only way to read or change which
//! page the frame belongs to, and the only way to touch its contents. A page fault and
//! an eviction sweep that pick the same frame are serialized by that lock alone: the
//! sweep never blocks on it, it skips the frame instead.

use super::config::{ReplacementPolicy, VmConfig};
use super::error::VmError;
use super::page::Page;
use super::stats::Counter;
use crate::sync::{FrameLock, Mutex};
use crate::threading::{ThreadContext, Tid};
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use log::{debug, info, warn};
use vmkernel_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::FromZeroes;

/// Index of a frame in the frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

/// One page of the heap-allocated pool used when no boot region is handed over.
#[derive(FromZeroes)]
#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_FRAME_SIZE]);

enum FrameState {
    Free,
    Claimed {
        page: Weak<Page>,
        /// Rotation of the clock hand during which the frame was claimed.
        epoch: u64,
    },
}

struct Frame {
    base: NonNull<u8>,
    lock: FrameLock,
    state: Mutex<FrameState>,
}

// SAFETY: `base` points into the frame pool, which outlives the table. The bytes
// behind it are only accessed by the thread holding `lock`.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    fn new(base: NonNull<u8>) -> Self {
        Self {
            base,
            lock: FrameLock::new(),
            state: Mutex::new(FrameState::Free),
        }
    }

    fn is_free(&self) -> bool {
        matches!(*self.state.lock(), FrameState::Free)
    }

    fn claim(&self, page: &Arc<Page>, epoch: u64) {
        *self.state.lock() = FrameState::Claimed {
            page: Arc::downgrade(page),
            epoch,
        };
    }

    fn owner(&self) -> Option<(Weak<Page>, u64)> {
        match &*self.state.lock() {
            FrameState::Free => None,
            FrameState::Claimed { page, epoch } => Some((page.clone(), *epoch)),
        }
    }
}

struct ClockHand {
    position: usize,
    /// Completed turns of the hand.
    epoch: u64,
}

impl ClockHand {
    fn advance(&mut self, frame_count: usize) -> usize {
        self.position += 1;
        if self.position >= frame_count {
            self.position = 0;
            self.epoch += 1;
        }
        self.position
    }
}

pub struct FrameTable {
    frames: Box<[Frame]>,
    /// Heap pool the frames point into, if the table allocated it.
    pool: Option<NonNull<[PageBuf]>>,
    /// Serializes the find-or-evict decision.
    scan: Mutex<ClockHand>,
    config: VmConfig,
    ctx: Arc<dyn ThreadContext>,
    pub(crate) evictions: Counter,
    pub(crate) file_discards: Counter,
    pub(crate) alloc_retries: Counter,
    pub(crate) alloc_failures: Counter,
}

// SAFETY: `pool` is only dereferenced in `drop`; every other access goes through a
// `Frame` under its lock.
unsafe impl Send for FrameTable {}
unsafe impl Sync for FrameTable {}

impl FrameTable {
    /// Build a table over `frame_count` zeroed frames allocated from the kernel heap.
    pub fn new(frame_count: usize, config: VmConfig, ctx: Arc<dyn ThreadContext>) -> Self {
        let pool = NonNull::from(Box::leak(PageBuf::new_box_slice_zeroed(frame_count)));
        let frames = (0..frame_count)
            .map(|i| {
                // SAFETY: `i` is in bounds of the pool slice, so the pointer is non-null.
                Frame::new(unsafe {
                    NonNull::new_unchecked(pool.cast::<PageBuf>().as_ptr().add(i).cast::<u8>())
                })
            })
            .collect();
        let mut table = Self::with_frames(frames, config, ctx);
        table.pool = Some(pool);
        table
    }

    /// Build a table over the `frame_count` frames starting at `base`, e.g. the user
    /// pool the boot allocator set aside.
    ///
    /// # Safety
    ///
    /// `base` must be page-aligned and point to `frame_count * PAGE_FRAME_SIZE` bytes
    /// that nothing else uses for as long as the table lives.
    pub unsafe fn from_region(
        base: NonNull<u8>,
        frame_count: usize,
        config: VmConfig,
        ctx: Arc<dyn ThreadContext>,
    ) -> Self {
        assert_eq!(
            base.as_ptr() as usize % PAGE_FRAME_SIZE,
            0,
            "frame region must be page-aligned"
        );
        let frames = (0..frame_count)
            .map(|i| Frame::new(NonNull::new_unchecked(base.as_ptr().add(i * PAGE_FRAME_SIZE))))
            .collect();
        Self::with_frames(frames, config, ctx)
    }

    fn with_frames(frames: Vec<Frame>, config: VmConfig, ctx: Arc<dyn ThreadContext>) -> Self {
        info!("frame table: {} user frames", frames.len());
        Self {
            frames: frames.into_boxed_slice(),
            pool: None,
            scan: Mutex::new(ClockHand {
                position: 0,
                epoch: 0,
            }),
            config,
            ctx,
            evictions: Counter::new(),
            file_discards: Counter::new(),
            alloc_retries: Counter::new(),
            alloc_failures: Counter::new(),
        }
    }

    fn tid(&self) -> Tid {
        self.ctx.current_tid()
    }

    fn frame(&self, frame: FrameId) -> &Frame {
        &self.frames[frame.0]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames currently claimed by some page.
    pub fn in_use(&self) -> usize {
        self.frames.iter().filter(|f| !f.is_free()).count()
    }

    /// Kernel address of the frame's first byte.
    pub fn base(&self, frame: FrameId) -> usize {
        self.frame(frame).base.as_ptr() as usize
    }

    pub fn is_locked_by_current(&self, frame: FrameId) -> bool {
        self.frame(frame).lock.held_by(self.tid())
    }

    /// The page `frame` is claimed by, if it is claimed and the page still exists.
    pub fn owner_of(&self, frame: FrameId) -> Option<Arc<Page>> {
        self.frame(frame).owner()?.0.upgrade()
    }

    /// Run `f` over the contents of `frame`, which the caller must hold locked.
    pub(crate) fn with_contents<R>(&self, frame: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let entry = self.frame(frame);
        assert!(
            entry.lock.held_by(self.tid()),
            "{frame} accessed without holding its lock"
        );
        // SAFETY: The frame is PAGE_FRAME_SIZE bytes of pool memory and we hold its
        // lock, so no other thread reads or writes it until we release it.
        let bytes = unsafe { core::slice::from_raw_parts_mut(entry.base.as_ptr(), PAGE_FRAME_SIZE) };
        f(bytes)
    }

    /// One pass of the allocator: a free frame if there is one, otherwise a frame
    /// reclaimed by evicting its page. The returned frame is locked and claimed for
    /// `page`.
    fn try_allocate_and_lock(&self, page: &Arc<Page>) -> Option<FrameId> {
        if self.frames.is_empty() {
            return None;
        }
        let tid = self.tid();
        let mut hand = self.scan.lock();

        for (i, frame) in self.frames.iter().enumerate() {
            if !frame.lock.try_acquire(tid) {
                continue;
            }
            if frame.is_free() {
                frame.claim(page, hand.epoch);
                return Some(FrameId(i));
            }
            frame.lock.release(tid);
        }

        let probes = self.config.sweep_rotations.max(1) * self.frames.len();
        for _ in 0..probes {
            let i = hand.advance(self.frames.len());
            let frame = &self.frames[i];
            if !frame.lock.try_acquire(tid) {
                continue;
            }

            let victim = frame
                .owner()
                .and_then(|(victim, epoch)| Some((victim.upgrade()?, epoch)));
            let Some((victim, epoch)) = victim else {
                // Freed since the first pass, or its page table is gone.
                frame.claim(page, hand.epoch);
                return Some(FrameId(i));
            };

            if self.config.policy == ReplacementPolicy::SecondChance {
                let accessed = victim.accessed_recently();
                if accessed || epoch == hand.epoch {
                    frame.lock.release(tid);
                    continue;
                }
            }

            match victim.evict() {
                Ok(()) => {
                    debug!(
                        "evicted page {:#x} of process {} from frame {}",
                        victim.addr(),
                        victim.pid(),
                        i
                    );
                    self.evictions.inc();
                    frame.claim(page, hand.epoch);
                    return Some(FrameId(i));
                }
                Err(err) => {
                    debug!("could not evict page {:#x}: {}", victim.addr(), err);
                    frame.lock.release(tid);
                }
            }
        }

        None
    }

    /// Find or reclaim a frame for `page` and return it locked.
    ///
    /// The scan is retried a few times with a sleep in between, since every candidate
    /// may be momentarily locked by other threads.
    pub fn allocate_and_lock(&self, page: &Arc<Page>) -> Result<FrameId, VmError> {
        let attempts = self.config.frame_alloc_attempts.max(1);
        for attempt in 0..attempts {
            if let Some(frame) = self.try_allocate_and_lock(page) {
                return Ok(frame);
            }
            if attempt + 1 < attempts {
                warn!(
                    "no frame for page {:#x}, retrying in {} ms",
                    page.addr(),
                    self.config.frame_alloc_backoff_ms
                );
                self.alloc_retries.inc();
                self.ctx.sleep_ms(self.config.frame_alloc_backoff_ms);
            }
        }
        self.alloc_failures.inc();
        Err(VmError::OutOfFrames)
    }

    /// Lock `page`'s frame, if it has one. Until the frame is unlocked the page stays
    /// resident in it.
    pub fn lock(&self, page: &Page) -> Option<FrameId> {
        let tid = self.tid();
        loop {
            let frame = page.frame()?;
            self.frame(frame).lock.acquire(tid);
            // The page may have been evicted (and even paged back in elsewhere) while
            // we waited.
            if page.frame() == Some(frame) {
                return Some(frame);
            }
            self.frame(frame).lock.release(tid);
        }
    }

    /// Release a frame locked by the current thread. It stays claimed.
    pub fn unlock(&self, frame: FrameId) {
        self.frame(frame).lock.release(self.tid());
    }

    /// Return a frame locked by the current thread to the free pool. Its contents are
    /// lost.
    pub fn free(&self, frame: FrameId) {
        let tid = self.tid();
        let entry = self.frame(frame);
        assert!(entry.lock.held_by(tid), "{frame} freed without holding its lock");
        *entry.state.lock() = FrameState::Free;
        entry.lock.release(tid);
    }
}

impl Drop for FrameTable {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            // SAFETY: `pool` came from `Box::leak` in `new` and no frame outlives us.
            drop(unsafe { Box::from_raw(pool.as_ptr()) });
        }
    }
}

impl fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FrameTable")
            .field("frames", &self.len())
            .field("in_use", &self.in_use())
            .finish_non_exhaustive()
    }
}
