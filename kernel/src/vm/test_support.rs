//! Host-side fixtures for the VM tests.

use super::backing::BackingFile;
use super::{SupplementalPageTable, VmConfig, VmSystem};
use crate::block::{Block, BlockSector, BlockType};
use crate::drivers::ram_disk::RamDisk;
use crate::paging::PageDirectory;
use crate::threading::{ThreadContext, Tid};
use std::cell::Cell;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vmkernel_shared::mem::SECTORS_PER_PAGE;

static NEXT_TID: AtomicU16 = AtomicU16::new(1);

std::thread_local! {
    static TID: Tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    static STACK_POINTER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Maps each host thread to its own tid.
#[derive(Debug, Default)]
pub struct HostContext;

impl HostContext {
    pub fn new() -> Self {
        Self
    }

    /// Pretend the calling thread entered the kernel with user stack pointer `esp`.
    pub fn set_stack_pointer(&self, esp: Option<usize>) {
        STACK_POINTER.with(|cell| cell.set(esp));
    }
}

impl ThreadContext for HostContext {
    fn current_tid(&self) -> Tid {
        TID.with(|tid| *tid)
    }

    fn user_stack_pointer(&self) -> Option<usize> {
        STACK_POINTER.with(Cell::get)
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// A file held in memory.
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let Some(src) = self.data.get(offset..) else {
            return 0;
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        n
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

pub struct Fixture {
    pub vm: Arc<VmSystem>,
    pub spt: SupplementalPageTable,
    pub pagedir: Arc<PageDirectory>,
    pub ctx: Arc<HostContext>,
    /// The swap disk, if the fixture has swap.
    pub disk: Option<Arc<RamDisk>>,
}

/// A VM system with `frames` frames and `swap_slots` swap slots, and a page table for
/// process 1. Retries do not sleep.
pub fn fixture(frames: usize, swap_slots: usize) -> Fixture {
    let config = VmConfig {
        frame_alloc_backoff_ms: 0,
        ..VmConfig::DEFAULT
    };
    fixture_with(config, frames, swap_slots)
}

pub fn fixture_with(config: VmConfig, frames: usize, swap_slots: usize) -> Fixture {
    let ctx = Arc::new(HostContext::new());
    let (disk, device) = if swap_slots == 0 {
        (None, None)
    } else {
        let sectors = BlockSector::try_from(swap_slots * SECTORS_PER_PAGE).unwrap();
        let disk = Arc::new(RamDisk::new(sectors));
        let block = Block::new(0, "swap", BlockType::Swap, sectors, Box::new(disk.clone()));
        (Some(disk), Some(Arc::new(block)))
    };
    let vm = VmSystem::new(config, ctx.clone(), frames, device);
    let pagedir = Arc::new(PageDirectory::new());
    let spt = vm.create_page_table(1, pagedir.clone());
    Fixture {
        vm,
        spt,
        pagedir,
        ctx,
        disk,
    }
}
