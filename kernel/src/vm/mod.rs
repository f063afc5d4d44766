//! Demand-paged virtual memory.
//!
//! A [`VmSystem`] owns the physical frames user pages can occupy and the swap space
//! they are evicted to. Every process gets a [`SupplementalPageTable`] sharing that
//! system; its pages move between frames, swap and their backing files as faults and
//! evictions happen.
//!
//! Lock order, outermost first: the frame table's scan lock, a frame lock, then the
//! short-lived internal mutexes (frame state, page state, page map, swap bitmap). A
//! frame lock is never taken while one of the internal mutexes is held.

pub mod backing;
pub mod config;
pub mod error;
pub mod frame;
pub mod page;
pub mod stats;
pub mod swap;

#[cfg(test)]
pub(crate) mod test_support;

pub use backing::{BackingFile, FileBacking};
pub use config::{ReplacementPolicy, VmConfig};
pub use error::VmError;
pub use frame::{FrameId, FrameTable};
pub use page::{Page, Residency, SupplementalPageTable};
pub use stats::VmStats;
pub use swap::{SwapSlot, SwapSpace};

use crate::block::Block;
use crate::paging::AddressTranslation;
use crate::threading::{Pid, ThreadContext};
use alloc::sync::Arc;
use core::ptr::NonNull;

pub struct VmSystem {
    config: VmConfig,
    ctx: Arc<dyn ThreadContext>,
    frames: FrameTable,
    swap: SwapSpace,
}

impl VmSystem {
    /// Set up `frame_count` user frames from the kernel heap and swap on
    /// `swap_device`, if there is one.
    pub fn new(
        config: VmConfig,
        ctx: Arc<dyn ThreadContext>,
        frame_count: usize,
        swap_device: Option<Arc<Block>>,
    ) -> Arc<Self> {
        let frames = FrameTable::new(frame_count, config, ctx.clone());
        Arc::new(Self {
            config,
            ctx,
            frames,
            swap: SwapSpace::new(swap_device),
        })
    }

    /// Like [`VmSystem::new`], over a region of physical memory set aside at boot.
    ///
    /// # Safety
    ///
    /// See [`FrameTable::from_region`].
    pub unsafe fn from_region(
        config: VmConfig,
        ctx: Arc<dyn ThreadContext>,
        base: NonNull<u8>,
        frame_count: usize,
        swap_device: Option<Arc<Block>>,
    ) -> Arc<Self> {
        let frames = FrameTable::from_region(base, frame_count, config, ctx.clone());
        Arc::new(Self {
            config,
            ctx,
            frames,
            swap: SwapSpace::new(swap_device),
        })
    }

    /// A new, empty page table for process `pid`.
    pub fn create_page_table(
        self: &Arc<Self>,
        pid: Pid,
        pagedir: Arc<dyn AddressTranslation>,
    ) -> SupplementalPageTable {
        SupplementalPageTable::new(self.clone(), pid, pagedir)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn ctx(&self) -> &Arc<dyn ThreadContext> {
        &self.ctx
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            frames_total: self.frames.len(),
            frames_in_use: self.frames.in_use(),
            swap_slots_total: self.swap.capacity(),
            swap_slots_free: self.swap.free_slots(),
            evictions: self.frames.evictions.get(),
            file_discards: self.frames.file_discards.get(),
            swap_outs: self.swap.swap_outs.get(),
            swap_ins: self.swap.swap_ins.get(),
            alloc_retries: self.frames.alloc_retries.get(),
            alloc_failures: self.frames.alloc_failures.get(),
        }
    }
}
