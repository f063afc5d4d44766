//! Supplemental page tables: where each user page's contents live, and the
//! page-fault path that brings them into a frame.

use super::backing::{BackingFile, FileBacking};
use super::error::VmError;
use super::frame::FrameId;
use super::swap::SwapSlot;
use super::VmSystem;
use crate::paging::AddressTranslation;
use crate::sync::Mutex;
use crate::threading::Pid;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::{error, info, trace, warn};
use vmkernel_shared::mem::{is_user_vaddr, pg_ofs, pg_round_down, pg_round_up, PAGE_FRAME_SIZE};

/// Where a page's contents are right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident(FrameId),
    Swapped(SwapSlot),
    /// Not loaded; will be read from its file.
    File,
    /// Not loaded; will be zero-filled.
    ZeroFill,
}

#[derive(Debug, Default)]
struct PageState {
    frame: Option<FrameId>,
    swap_slot: Option<SwapSlot>,
    /// Set once the page is taken out of its table. It never gets a frame again.
    removed: bool,
}

/// One virtual page of a process.
///
/// `state` may only change while the frame lock of the page's (current or incoming)
/// frame is held.
pub struct Page {
    addr: usize,
    read_only: bool,
    pid: Pid,
    file: Option<FileBacking>,
    state: Mutex<PageState>,
    pagedir: Arc<dyn AddressTranslation>,
    vm: Arc<VmSystem>,
}

impl Page {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn file(&self) -> Option<&FileBacking> {
        self.file.as_ref()
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.state.lock().frame
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.state.lock().swap_slot
    }

    pub fn residency(&self) -> Residency {
        let state = self.state.lock();
        match (state.frame, state.swap_slot, &self.file) {
            (Some(frame), _, _) => Residency::Resident(frame),
            (None, Some(slot), _) => Residency::Swapped(slot),
            (None, None, Some(_)) => Residency::File,
            (None, None, None) => Residency::ZeroFill,
        }
    }

    pub(crate) fn vm(&self) -> &Arc<VmSystem> {
        &self.vm
    }

    /// The page's contents now live in `slot` instead of its frame.
    pub(crate) fn detach_to_swap(&self, slot: SwapSlot) {
        let mut state = self.state.lock();
        state.frame = None;
        state.swap_slot = Some(slot);
    }

    pub(crate) fn clear_swap_slot(&self) {
        self.state.lock().swap_slot = None;
    }

    fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Whether the page was accessed since the last call. Clears the accessed bit.
    pub fn accessed_recently(&self) -> bool {
        let accessed = self.pagedir.is_accessed(self.addr);
        if accessed {
            self.pagedir.set_accessed(self.addr, false);
        }
        accessed
    }

    /// Take the page out of its frame, which the calling thread must hold locked.
    ///
    /// The user mapping is removed before anything else, so a racing access faults and
    /// waits on the frame lock. Anonymous pages go to swap. File-backed pages are
    /// dropped and reloaded from the file on the next fault.
    ///
    /// On failure the mapping stays cleared but the page keeps its frame.
    pub fn evict(&self) -> Result<(), VmError> {
        let frames = self.vm.frames();
        let frame = self.frame().ok_or(VmError::NotResident(self.addr))?;
        assert!(
            frames.is_locked_by_current(frame),
            "evicting page {:#x} without holding {frame}",
            self.addr
        );

        self.pagedir.clear_mapping(self.addr);

        match &self.file {
            None => {
                self.vm.swap().swap_out(self)?;
            }
            Some(_) => {
                if !self.read_only && self.pagedir.is_dirty(self.addr) {
                    warn!(
                        "discarding modified file-backed page {:#x} of process {}",
                        self.addr, self.pid
                    );
                }
                self.state.lock().frame = None;
                frames.file_discards.inc();
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Page")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("pid", &self.pid)
            .field("read_only", &self.read_only)
            .field("file", &self.file)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// The pages of one process, keyed by page address.
pub struct SupplementalPageTable {
    pid: Pid,
    pages: Mutex<BTreeMap<usize, Arc<Page>>>,
    pagedir: Arc<dyn AddressTranslation>,
    vm: Arc<VmSystem>,
}

impl SupplementalPageTable {
    pub fn new(vm: Arc<VmSystem>, pid: Pid, pagedir: Arc<dyn AddressTranslation>) -> Self {
        Self {
            pid,
            pages: Mutex::new(BTreeMap::new()),
            pagedir,
            vm,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn vm(&self) -> &Arc<VmSystem> {
        &self.vm
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// The page covering `address`, if any.
    pub fn page_for(&self, address: usize) -> Option<Arc<Page>> {
        self.pages.lock().get(&pg_round_down(address)).cloned()
    }

    pub fn residency(&self, address: usize) -> Option<Residency> {
        Some(self.page_for(address)?.residency())
    }

    fn insert(
        &self,
        address: usize,
        read_only: bool,
        file: Option<FileBacking>,
    ) -> Result<Arc<Page>, VmError> {
        if !is_user_vaddr(address) || address >= self.vm.config().user_top {
            return Err(VmError::KernelAddress(address));
        }
        let addr = pg_round_down(address);
        let mut pages = self.pages.lock();
        if pages.contains_key(&addr) {
            return Err(VmError::AlreadyMapped(addr));
        }
        let page = Arc::new(Page {
            addr,
            read_only,
            pid: self.pid,
            file,
            state: Mutex::new(PageState::default()),
            pagedir: self.pagedir.clone(),
            vm: self.vm.clone(),
        });
        pages.insert(addr, page.clone());
        Ok(page)
    }

    /// Create a zero-fill page covering `address`.
    pub fn allocate(&self, address: usize, read_only: bool) -> Result<Arc<Page>, VmError> {
        self.insert(address, read_only, None)
    }

    /// Create a page covering `address` whose contents are loaded from `backing`.
    pub fn allocate_file_backed(
        &self,
        address: usize,
        read_only: bool,
        backing: FileBacking,
    ) -> Result<Arc<Page>, VmError> {
        assert!(
            backing.length <= PAGE_FRAME_SIZE,
            "file backing of {} bytes does not fit a page",
            backing.length
        );
        self.insert(address, read_only, Some(backing))
    }

    /// The page covering `address`, creating a stack page if `address` is a push
    /// below the stack pointer `esp`.
    pub fn lookup_or_grow(&self, address: usize, esp: usize) -> Result<Arc<Page>, VmError> {
        if let Some(page) = self.page_for(address) {
            return Ok(page);
        }
        if !self.vm.config().is_stack_access(address, esp) {
            return Err(VmError::NoSuchPage(address));
        }
        trace!("process {}: growing stack to {:#x}", self.pid, pg_round_down(address));
        match self.allocate(address, false) {
            // Another thread of this process grew it first.
            Err(VmError::AlreadyMapped(_)) => {
                self.page_for(address).ok_or(VmError::NoSuchPage(address))
            }
            result => result,
        }
    }

    fn find(&self, address: usize) -> Result<Arc<Page>, VmError> {
        if !is_user_vaddr(address) {
            return Err(VmError::KernelAddress(address));
        }
        match self.vm.ctx().user_stack_pointer() {
            Some(esp) => self.lookup_or_grow(address, esp),
            None => self.page_for(address).ok_or(VmError::NoSuchPage(address)),
        }
    }

    /// Bring the page covering `address` into a frame and map it.
    ///
    /// On failure the page is left without a frame and unmapped; the caller should kill
    /// the process.
    pub fn resolve_fault(&self, address: usize) -> Result<(), VmError> {
        trace!("process {}: fault at {:#x}", self.pid, address);
        let result = self.find(address).and_then(|page| {
            let frame = self.pin(&page)?;
            let mapped = self.map(&page, frame);
            self.vm.frames().unlock(frame);
            mapped
        });
        if let Err(err) = result {
            error!("process {}: cannot resolve fault at {:#x}: {}", self.pid, address, err);
        }
        result
    }

    fn map(&self, page: &Page, frame: FrameId) -> Result<(), VmError> {
        if page.is_removed() {
            return Err(VmError::NoSuchPage(page.addr));
        }
        let base = self.vm.frames().base(frame);
        if self.pagedir.set_mapping(page.addr, base, !page.read_only) {
            Ok(())
        } else {
            Err(VmError::MappingFailed(page.addr))
        }
    }

    /// Lock `page` into a frame, loading it if it is not resident. Returns the frame,
    /// locked by the calling thread.
    fn pin(&self, page: &Arc<Page>) -> Result<FrameId, VmError> {
        let frames = self.vm.frames();
        loop {
            if let Some(frame) = frames.lock(page) {
                if page.is_removed() {
                    frames.unlock(frame);
                    return Err(VmError::NoSuchPage(page.addr));
                }
                return Ok(frame);
            }
            if page.is_removed() {
                return Err(VmError::NoSuchPage(page.addr));
            }

            let frame = frames.allocate_and_lock(page)?;
            {
                let mut state = page.state.lock();
                if state.removed {
                    // Deallocated while we were looking for a frame.
                    drop(state);
                    frames.free(frame);
                    return Err(VmError::NoSuchPage(page.addr));
                }
                if state.frame.is_some() {
                    // Another thread loaded it while we were allocating.
                    drop(state);
                    frames.free(frame);
                    continue;
                }
                state.frame = Some(frame);
            }

            if let Err(err) = self.load(page, frame) {
                page.state.lock().frame = None;
                frames.free(frame);
                return Err(err);
            }
            return Ok(frame);
        }
    }

    fn load(&self, page: &Page, frame: FrameId) -> Result<(), VmError> {
        if page.swap_slot().is_some() {
            return self.vm.swap().swap_in(page);
        }
        self.vm.frames().with_contents(frame, |bytes| match &page.file {
            Some(backing) => {
                let (head, tail) = bytes.split_at_mut(backing.length);
                let read = backing.file.read_at(head, backing.offset);
                tail.fill(0);
                if read == backing.length {
                    Ok(())
                } else {
                    Err(VmError::ShortRead {
                        expected: backing.length,
                        actual: read,
                    })
                }
            }
            None => {
                bytes.fill(0);
                Ok(())
            }
        })
    }

    /// Remove the page covering `address`, dropping its frame and swap slot.
    pub fn deallocate(&self, address: usize) -> Result<(), VmError> {
        let page = self
            .pages
            .lock()
            .remove(&pg_round_down(address))
            .ok_or(VmError::NoSuchPage(address))?;
        self.release(&page);
        Ok(())
    }

    /// Take `page`'s frame and swap slot away for good. A fault that still holds the
    /// page fails with `NoSuchPage` instead of loading it again.
    fn release(&self, page: &Page) {
        page.state.lock().removed = true;
        let frames = self.vm.frames();
        match frames.lock(page) {
            Some(frame) => {
                self.pagedir.remove_mapping(page.addr);
                page.state.lock().frame = None;
                frames.free(frame);
            }
            None => self.pagedir.remove_mapping(page.addr),
        }
        if let Some(slot) = page.state.lock().swap_slot.take() {
            self.vm.swap().release(slot);
        }
    }

    /// Pin the page covering `address` in memory for the kernel to access it directly.
    /// Must be paired with [`Self::unlock_for_access`].
    pub fn lock_for_access(&self, address: usize, will_write: bool) -> Result<FrameId, VmError> {
        let page = self.find(address)?;
        if will_write && page.read_only {
            return Err(VmError::ReadOnly(page.addr));
        }
        let frame = self.pin(&page)?;
        if let Err(err) = self.map(&page, frame) {
            self.vm.frames().unlock(frame);
            return Err(err);
        }
        Ok(frame)
    }

    /// Release the pin taken by [`Self::lock_for_access`].
    pub fn unlock_for_access(&self, address: usize) {
        let frame = self
            .page_for(address)
            .and_then(|page| page.frame())
            .unwrap_or_else(|| panic!("unlock of {address:#x}, which is not pinned"));
        self.vm.frames().unlock(frame);
    }

    /// Run `f` over the bytes of the page covering `address`, pinned for the duration.
    pub fn with_pinned<R>(
        &self,
        address: usize,
        will_write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, VmError> {
        let frame = self.lock_for_access(address, will_write)?;
        let result = self.vm.frames().with_contents(frame, f);
        self.vm.frames().unlock(frame);
        Ok(result)
    }

    /// Lay out a segment: `read_bytes` bytes of `file` starting at `offset`, followed by
    /// `zero_bytes` zeros, at the page-aligned `address`. Returns the number of pages.
    ///
    /// If a page cannot be created, the pages created so far are removed again.
    pub fn map_segment(
        &self,
        address: usize,
        file: Arc<dyn BackingFile>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        read_only: bool,
    ) -> Result<usize, VmError> {
        if pg_ofs(address) != 0 {
            return Err(VmError::NotPageAligned(address));
        }
        let total = read_bytes + zero_bytes;
        if pg_ofs(total) != 0 {
            return Err(VmError::NotPageAligned(total));
        }
        if total == 0 {
            return Err(VmError::EmptyMapping);
        }

        let mut created = Vec::new();
        let mut remaining = read_bytes;
        for i in 0..total / PAGE_FRAME_SIZE {
            let addr = address + i * PAGE_FRAME_SIZE;
            let length = remaining.min(PAGE_FRAME_SIZE);
            let result = if length > 0 {
                let backing = FileBacking::new(file.clone(), offset + i * PAGE_FRAME_SIZE, length);
                self.allocate_file_backed(addr, read_only, backing)
            } else {
                self.allocate(addr, read_only)
            };
            if let Err(err) = result {
                for addr in created {
                    let _ = self.deallocate(addr);
                }
                return Err(err);
            }
            created.push(addr);
            remaining -= length;
        }
        Ok(created.len())
    }

    /// Map all of `file` at `address`. Returns the number of pages.
    pub fn map_file(
        &self,
        address: usize,
        file: Arc<dyn BackingFile>,
        read_only: bool,
    ) -> Result<usize, VmError> {
        let length = file.len();
        if length == 0 {
            return Err(VmError::EmptyMapping);
        }
        let zero_bytes = pg_round_up(length) - length;
        self.map_segment(address, file, 0, length, zero_bytes, read_only)
    }

    /// Remove `page_count` pages starting at `address`.
    pub fn unmap(&self, address: usize, page_count: usize) -> Result<(), VmError> {
        for i in 0..page_count {
            self.deallocate(address + i * PAGE_FRAME_SIZE)?;
        }
        Ok(())
    }

    /// Release every page. Called when the process exits.
    pub fn destroy(self) {
        info!("process {}: destroying {} pages", self.pid, self.page_count());
        // Drop does the work.
    }

    fn release_all(&self) {
        let pages = core::mem::take(&mut *self.pages.lock());
        for page in pages.values() {
            self.release(page);
        }
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for SupplementalPageTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SupplementalPageTable")
            .field("pid", &self.pid)
            .field("pages", &self.page_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PageDirectory;
    use crate::vm::test_support::{fixture, fixture_with, Fixture, MemFile};
    use crate::vm::{ReplacementPolicy, VmConfig};
    use std::thread;
    use vmkernel_shared::mem::OFFSET;

    #[test]
    fn test_allocate_rejects_duplicates_and_kernel_addresses() {
        let Fixture { spt, .. } = fixture(2, 0);
        let page = spt.allocate(0x1234, false).unwrap();
        assert_eq!(page.addr(), 0x1000);
        assert_eq!(spt.allocate(0x1fff, true).unwrap_err(), VmError::AlreadyMapped(0x1000));
        assert_eq!(spt.allocate(OFFSET, false).unwrap_err(), VmError::KernelAddress(OFFSET));
        assert_eq!(spt.residency(0x1000), Some(Residency::ZeroFill));
    }

    #[test]
    fn test_zero_fill_fault_maps_zeroed_frame() {
        let Fixture { vm, spt, pagedir, .. } = fixture(2, 0);
        spt.allocate(0x4000, false).unwrap();
        spt.resolve_fault(0x4abc).unwrap();

        let Some(Residency::Resident(frame)) = spt.residency(0x4000) else {
            panic!("page should be resident");
        };
        assert_eq!(pagedir.translate(0x4abc), Some(vm.frames().base(frame) + 0xabc));
        assert!(pagedir.is_writable(0x4000));
        assert!(!vm.frames().is_locked_by_current(frame));
        let zeros = spt.with_pinned(0x4000, false, |bytes| bytes.iter().all(|b| *b == 0));
        assert_eq!(zeros, Ok(true));
    }

    #[test]
    fn test_fault_on_unknown_address() {
        let Fixture { spt, ctx, .. } = fixture(2, 0);
        ctx.set_stack_pointer(Some(OFFSET - 0x1000));
        assert_eq!(spt.resolve_fault(0x1000), Err(VmError::NoSuchPage(0x1000)));
        assert_eq!(spt.resolve_fault(OFFSET + 4), Err(VmError::KernelAddress(OFFSET + 4)));
        assert_eq!(spt.page_count(), 0);
    }

    #[test]
    fn test_stack_growth_is_idempotent() {
        let Fixture { spt, ctx, .. } = fixture(4, 0);
        let esp = OFFSET - 0x2000;
        ctx.set_stack_pointer(Some(esp));

        let first = spt.lookup_or_grow(esp - 32, esp).unwrap();
        let second = spt.lookup_or_grow(esp - 32, esp).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.addr(), pg_round_down(esp - 32));
        assert_eq!(spt.page_count(), 1);

        spt.resolve_fault(esp - 4).unwrap();
        spt.resolve_fault(esp - 4).unwrap();
        assert_eq!(spt.page_count(), 1);

        let far = esp - PAGE_FRAME_SIZE - 64;
        assert_eq!(spt.lookup_or_grow(far, esp).unwrap_err(), VmError::NoSuchPage(far));
    }

    #[test]
    fn test_file_backed_fault_zero_fills_tail() {
        let Fixture { spt, .. } = fixture(2, 0);
        let contents: Vec<u8> = (0..3000).map(|i| (i % 200) as u8 + 1).collect();
        let file = Arc::new(MemFile::new(contents.clone()));
        spt.allocate_file_backed(0x8000, true, FileBacking::new(file, 100, 1000))
            .unwrap();
        assert_eq!(spt.residency(0x8000), Some(Residency::File));

        spt.resolve_fault(0x8000).unwrap();
        let bytes = spt.with_pinned(0x8000, false, |bytes| bytes.to_vec()).unwrap();
        assert_eq!(&bytes[..1000], &contents[100..1100]);
        assert!(bytes[1000..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_short_read_leaves_page_unloaded() {
        let Fixture { vm, spt, pagedir, .. } = fixture(2, 0);
        let file = Arc::new(MemFile::new(vec![7; 10]));
        spt.allocate_file_backed(0x8000, true, FileBacking::new(file, 0, 64))
            .unwrap();
        assert_eq!(
            spt.resolve_fault(0x8000),
            Err(VmError::ShortRead {
                expected: 64,
                actual: 10
            })
        );
        assert_eq!(spt.residency(0x8000), Some(Residency::File));
        assert_eq!(pagedir.translate(0x8000), None);
        assert_eq!(vm.frames().in_use(), 0);
    }

    #[test]
    fn test_read_only_page_rejects_writes() {
        let Fixture { spt, pagedir, .. } = fixture(2, 0);
        spt.allocate(0x3000, true).unwrap();
        assert_eq!(spt.lock_for_access(0x3000, true), Err(VmError::ReadOnly(0x3000)));
        spt.resolve_fault(0x3000).unwrap();
        assert!(!pagedir.is_writable(0x3000));
        assert!(!pagedir.touch(0x3000, true));
        assert!(pagedir.touch(0x3000, false));
    }

    #[test]
    fn test_evicting_file_page_discards_and_reloads() {
        let config = VmConfig {
            frame_alloc_attempts: 1,
            ..VmConfig::DEFAULT
        };
        let Fixture { vm, spt, pagedir, .. } = fixture_with(config, 1, 0);
        let file = Arc::new(MemFile::new(vec![0xaa; PAGE_FRAME_SIZE]));
        spt.allocate_file_backed(0x1000, true, FileBacking::new(file, 0, PAGE_FRAME_SIZE))
            .unwrap();
        spt.allocate(0x2000, false).unwrap();

        spt.resolve_fault(0x1000).unwrap();
        spt.resolve_fault(0x2000).unwrap();
        assert_eq!(spt.residency(0x1000), Some(Residency::File));
        assert_eq!(pagedir.translate(0x1000), None);
        assert_eq!(vm.stats().file_discards, 1);
        assert_eq!(vm.swap().capacity(), 0);

        // No swap, so the zero-fill page cannot make room and the file page cannot
        // come back.
        assert_eq!(spt.resolve_fault(0x1000), Err(VmError::OutOfFrames));
        assert_eq!(spt.residency(0x2000).map(|r| matches!(r, Residency::Resident(_))), Some(true));
    }

    #[test]
    fn test_swap_exhaustion_keeps_frame_locked() {
        let Fixture { vm, spt, pagedir, .. } = fixture(1, 0);
        spt.allocate(0x1000, false).unwrap();
        spt.resolve_fault(0x1000).unwrap();

        let page = spt.page_for(0x1000).unwrap();
        let frame = vm.frames().lock(&page).unwrap();
        assert_eq!(page.evict(), Err(VmError::SwapExhausted));
        assert_eq!(page.frame(), Some(frame));
        assert!(vm.frames().is_locked_by_current(frame));
        assert_eq!(pagedir.translate(0x1000), None);
        vm.frames().unlock(frame);

        // The page is still intact and can be mapped again.
        spt.resolve_fault(0x1000).unwrap();
        assert!(pagedir.translate(0x1000).is_some());
    }

    #[test]
    #[should_panic(expected = "without holding")]
    fn test_evict_requires_frame_lock() {
        let Fixture { spt, .. } = fixture(1, 0);
        spt.allocate(0x1000, false).unwrap();
        spt.resolve_fault(0x1000).unwrap();
        let _ = spt.page_for(0x1000).unwrap().evict();
    }

    #[test]
    fn test_deallocate_releases_frame_and_slot() {
        let Fixture { vm, spt, pagedir, .. } = fixture(1, 4);
        spt.allocate(0x1000, false).unwrap();
        spt.allocate(0x2000, false).unwrap();
        spt.resolve_fault(0x1000).unwrap();
        spt.resolve_fault(0x2000).unwrap();
        assert_eq!(vm.swap().free_slots(), 3);

        spt.deallocate(0x1000).unwrap();
        assert_eq!(vm.swap().free_slots(), 4);
        spt.deallocate(0x2000).unwrap();
        assert_eq!(vm.frames().in_use(), 0);
        assert_eq!(pagedir.translate(0x2000), None);
        assert_eq!(pagedir.entry_count(), 0);
        assert_eq!(spt.deallocate(0x2000), Err(VmError::NoSuchPage(0x2000)));
    }

    #[test]
    fn test_fault_racing_deallocate_leaves_no_mapping() {
        let config = VmConfig {
            frame_alloc_attempts: 2000,
            frame_alloc_backoff_ms: 1,
            ..VmConfig::DEFAULT
        };
        let Fixture { vm, spt, pagedir, .. } = fixture_with(config, 1, 4);
        spt.allocate(0x1000, false).unwrap();
        spt.allocate(0x2000, false).unwrap();
        spt.lock_for_access(0x1000, true).unwrap();

        let result = thread::scope(|s| {
            // Waits for the only frame, which is pinned.
            let fault = s.spawn(|| spt.resolve_fault(0x2000));
            thread::sleep(std::time::Duration::from_millis(50));
            spt.deallocate(0x2000).unwrap();
            spt.unlock_for_access(0x1000);
            fault.join().unwrap()
        });

        assert_eq!(result, Err(VmError::NoSuchPage(0x2000)));
        assert_eq!(spt.page_for(0x2000).map(|page| page.addr()), None);
        assert_eq!(pagedir.translate(0x2000), None);
        assert_eq!(pagedir.entry_count(), 1);
        let resident = matches!(spt.residency(0x1000), Some(Residency::Resident(_)));
        assert_eq!(vm.frames().in_use(), usize::from(resident));
        if let Some(Residency::Resident(frame)) = spt.residency(0x1000) {
            assert_eq!(vm.frames().owner_of(frame).map(|page| page.addr()), Some(0x1000));
        }
    }

    #[test]
    fn test_repinning_resident_page_keeps_hardware_bits() {
        let Fixture { spt, pagedir, .. } = fixture(2, 0);
        spt.allocate(0x1000, false).unwrap();
        spt.resolve_fault(0x1000).unwrap();
        assert!(pagedir.touch(0x1010, true));

        spt.lock_for_access(0x1000, false).unwrap();
        spt.unlock_for_access(0x1000);
        spt.resolve_fault(0x1000).unwrap();
        assert!(pagedir.is_accessed(0x1000));
        assert!(pagedir.is_dirty(0x1000));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let Fixture { vm, spt, .. } = fixture(2, 4);
        for i in 1..=4 {
            spt.allocate(i * PAGE_FRAME_SIZE, false).unwrap();
            spt.resolve_fault(i * PAGE_FRAME_SIZE).unwrap();
        }
        assert_eq!(vm.frames().in_use(), 2);
        assert_eq!(vm.swap().free_slots(), 2);

        spt.destroy();
        assert_eq!(vm.frames().in_use(), 0);
        assert_eq!(vm.swap().free_slots(), 4);
    }

    #[test]
    fn test_lock_for_access_pins_against_eviction() {
        let Fixture { vm, spt, .. } = fixture(2, 4);
        for i in 1..=3 {
            spt.allocate(i * PAGE_FRAME_SIZE, false).unwrap();
        }
        let pinned = spt.lock_for_access(0x1000, true).unwrap();
        spt.resolve_fault(0x2000).unwrap();
        spt.resolve_fault(0x3000).unwrap();
        spt.resolve_fault(0x2000).unwrap();

        assert_eq!(spt.residency(0x1000), Some(Residency::Resident(pinned)));
        assert!(vm.frames().is_locked_by_current(pinned));
        spt.unlock_for_access(0x1000);
        assert!(!vm.frames().is_locked_by_current(pinned));
    }

    #[test]
    fn test_second_chance_spares_accessed_page() {
        let config = VmConfig {
            policy: ReplacementPolicy::SecondChance,
            ..VmConfig::DEFAULT
        };
        let Fixture { spt, pagedir, .. } = fixture_with(config, 2, 4);
        for i in 1..=3 {
            spt.allocate(i * PAGE_FRAME_SIZE, false).unwrap();
        }
        spt.resolve_fault(0x1000).unwrap();
        spt.resolve_fault(0x2000).unwrap();
        assert!(pagedir.touch(0x1000, false));

        spt.resolve_fault(0x3000).unwrap();
        assert!(matches!(spt.residency(0x1000), Some(Residency::Resident(_))));
        assert!(matches!(spt.residency(0x2000), Some(Residency::Swapped(_))));
        // The hand cleared the bit on its way past.
        assert!(!pagedir.is_accessed(0x1000));
    }

    #[test]
    fn test_map_segment_splits_pages() {
        let Fixture { spt, .. } = fixture(4, 0);
        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(vec![3; 2 * PAGE_FRAME_SIZE]));
        let pages = spt
            .map_segment(0x10000, file, 0x800, PAGE_FRAME_SIZE + 10, 3 * PAGE_FRAME_SIZE - 10, true)
            .unwrap();
        assert_eq!(pages, 4);

        let lengths: Vec<_> = (0..4)
            .map(|i| spt.page_for(0x10000 + i * PAGE_FRAME_SIZE).unwrap())
            .map(|page| page.file().map(|backing| (backing.offset, backing.length)))
            .collect();
        assert_eq!(
            lengths,
            [
                Some((0x800, PAGE_FRAME_SIZE)),
                Some((0x1800, 10)),
                None,
                None
            ]
        );
        assert!(spt.page_for(0x10000).unwrap().is_read_only());
    }

    #[test]
    fn test_map_segment_rolls_back_on_overlap() {
        let Fixture { spt, .. } = fixture(4, 0);
        spt.allocate(0x12000, false).unwrap();
        let file: Arc<dyn BackingFile> = Arc::new(MemFile::new(vec![1; 4 * PAGE_FRAME_SIZE]));
        assert_eq!(
            spt.map_segment(0x10000, file, 0, 4 * PAGE_FRAME_SIZE, 0, false),
            Err(VmError::AlreadyMapped(0x12000))
        );
        assert_eq!(spt.page_count(), 1);
        assert_eq!(
            spt.map_segment(0x10001, Arc::new(MemFile::new(vec![1])), 0, 1, 0, false),
            Err(VmError::NotPageAligned(0x10001))
        );
    }

    #[test]
    fn test_map_file_and_unmap() {
        let Fixture { spt, .. } = fixture(4, 0);
        let file = Arc::new(MemFile::new(b"hello, mapped world".to_vec()));
        assert_eq!(spt.map_file(0x20000, file, false), Ok(1));
        let mut buf = [0; 5];
        crate::mem::user::copy_in(&spt, &mut buf, 0x20007).unwrap();
        assert_eq!(&buf, b"mappe");

        assert_eq!(
            spt.map_file(0x30000, Arc::new(MemFile::new(Vec::new())), false),
            Err(VmError::EmptyMapping)
        );
        spt.unmap(0x20000, 1).unwrap();
        assert_eq!(spt.page_count(), 0);
    }

    #[test]
    fn test_more_threads_than_frames_all_resolve() {
        const FRAMES: usize = 3;
        let config = VmConfig {
            frame_alloc_attempts: 50,
            frame_alloc_backoff_ms: 1,
            ..VmConfig::DEFAULT
        };
        let Fixture { vm, spt, .. } = fixture_with(config, FRAMES, 64);
        let spt = Arc::new(spt);
        for i in 0..=FRAMES {
            spt.allocate((i + 1) * PAGE_FRAME_SIZE, false).unwrap();
        }

        let handles: Vec<_> = (0..=FRAMES)
            .map(|i| {
                let spt = spt.clone();
                thread::spawn(move || {
                    let addr = (i + 1) * PAGE_FRAME_SIZE;
                    for round in 0..20u8 {
                        let value = [i as u8, round];
                        crate::mem::user::copy_out(&spt, addr, &value).unwrap();
                        let mut back = [0; 2];
                        crate::mem::user::copy_in(&spt, &mut back, addr).unwrap();
                        assert_eq!(back, value);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(vm.stats().evictions > 0);
        assert_eq!(vm.frames().in_use(), FRAMES);
    }

    #[test]
    fn test_residency_is_exclusive_per_page() {
        let Fixture { vm, spt, .. } = fixture(1, 4);
        let file = Arc::new(MemFile::new(vec![9; PAGE_FRAME_SIZE]));
        spt.allocate_file_backed(0x1000, false, FileBacking::new(file, 0, PAGE_FRAME_SIZE))
            .unwrap();
        spt.allocate(0x2000, false).unwrap();
        spt.resolve_fault(0x2000).unwrap();
        spt.resolve_fault(0x1000).unwrap();

        for addr in [0x1000, 0x2000] {
            let page = spt.page_for(addr).unwrap();
            let state = page.state.lock();
            assert!(!(state.frame.is_some() && state.swap_slot.is_some()));
        }
        for frame in 0..vm.frames().len() {
            let owners = [0x1000, 0x2000]
                .iter()
                .filter(|addr| spt.page_for(**addr).unwrap().frame().map(FrameId::index) == Some(frame))
                .count();
            assert!(owners <= 1);
        }
    }

    #[test]
    fn test_separate_processes_share_frames() {
        let Fixture { vm, spt, .. } = fixture(2, 8);
        let other = SupplementalPageTable::new(vm.clone(), 2, Arc::new(PageDirectory::new()));
        spt.allocate(0x1000, false).unwrap();
        other.allocate(0x1000, false).unwrap();
        other.allocate(0x2000, false).unwrap();

        crate::mem::user::copy_out(&spt, 0x1000, b"one").unwrap();
        crate::mem::user::copy_out(&other, 0x1000, b"two").unwrap();
        other.resolve_fault(0x2000).unwrap();

        let mut buf = [0; 3];
        crate::mem::user::copy_in(&spt, &mut buf, 0x1000).unwrap();
        assert_eq!(&buf, b"one");
        crate::mem::user::copy_in(&other, &mut buf, 0x1000).unwrap();
        assert_eq!(&buf, b"two");

        drop(other);
        assert_eq!(vm.frames().in_use(), 0);
    }
}
