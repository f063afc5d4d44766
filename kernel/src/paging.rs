//! Per-process virtual-to-physical translation.

use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use core::fmt;
use vmkernel_shared::mem::{is_user_vaddr, pg_ofs, pg_round_down, PAGE_FRAME_SIZE};
use vmkernel_shared::paging::PageTableEntry;

/// The process page directory, as seen by the VM layer.
///
/// All addresses are user virtual addresses; implementations round them down to
/// their page.
pub trait AddressTranslation: Send + Sync {
    /// Map the page containing `vaddr` to the frame at `frame_base`. Returns `false` if
    /// the mapping could not be installed (e.g. a page table could not be allocated).
    fn set_mapping(&self, vaddr: usize, frame_base: usize, writable: bool) -> bool;

    /// Mark the page not present. Later accesses fault.
    fn clear_mapping(&self, vaddr: usize);

    /// Forget the page entirely, as when it is deallocated.
    fn remove_mapping(&self, vaddr: usize);

    fn is_accessed(&self, vaddr: usize) -> bool;

    fn set_accessed(&self, vaddr: usize, accessed: bool);

    fn is_dirty(&self, vaddr: usize) -> bool;
}

/// A page directory kept in kernel memory.
///
/// Only the leaf entries matter to the VM layer, so the two-level x86 structure is
/// flattened into a map keyed by page address. The MMU's side of the protocol
/// (setting accessed and dirty bits) is reproduced by [`PageDirectory::touch`].
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical address `vaddr` currently translates to, if its page is present.
    pub fn translate(&self, vaddr: usize) -> Option<usize> {
        let entries = self.entries.lock();
        let pte = entries.get(&pg_round_down(vaddr))?;
        pte.present().then(|| pte.frame_base() + pg_ofs(vaddr))
    }

    pub fn is_writable(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&pg_round_down(vaddr))
            .is_some_and(|pte| pte.present() && pte.read_write())
    }

    /// Record an access the way the MMU would. Returns `false` where the hardware would
    /// raise a page fault instead: page not present, or a write to a read-only page.
    pub fn touch(&self, vaddr: usize, write: bool) -> bool {
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&pg_round_down(vaddr)) else {
            return false;
        };
        if !pte.present() || (write && !pte.read_write()) {
            return false;
        }
        *pte = pte.with_accessed(true).with_dirty(pte.dirty() || write);
        true
    }

    pub fn mapped_count(&self) -> usize {
        self.entries.lock().values().filter(|pte| pte.present()).count()
    }

    /// Number of entries, present or not.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDirectory")
            .field("mapped", &self.mapped_count())
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl AddressTranslation for PageDirectory {
    fn set_mapping(&self, vaddr: usize, frame_base: usize, writable: bool) -> bool {
        if !is_user_vaddr(vaddr) || frame_base % PAGE_FRAME_SIZE != 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        let fresh = PageTableEntry::user(frame_base, writable);
        let pte = match entries.get(&pg_round_down(vaddr)) {
            // Remapping the same frame keeps what the MMU recorded so far.
            Some(old) if old.present() && old.frame_base() == frame_base => fresh
                .with_accessed(old.accessed())
                .with_dirty(old.dirty()),
            _ => fresh,
        };
        entries.insert(pg_round_down(vaddr), pte);
        true
    }

    fn clear_mapping(&self, vaddr: usize) {
        let mut entries = self.entries.lock();
        if let Some(pte) = entries.get_mut(&pg_round_down(vaddr)) {
            // Keep the accessed and dirty bits around, like clearing only the present bit.
            *pte = pte.with_present(false);
        }
    }

    fn remove_mapping(&self, vaddr: usize) {
        self.entries.lock().remove(&pg_round_down(vaddr));
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&pg_round_down(vaddr))
            .is_some_and(|pte| pte.accessed())
    }

    fn set_accessed(&self, vaddr: usize, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&pg_round_down(vaddr)) {
            *pte = pte.with_accessed(accessed);
        }
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.entries
            .lock()
            .get(&pg_round_down(vaddr))
            .is_some_and(|pte| pte.dirty())
    }
}
