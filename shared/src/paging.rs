// https://wiki.osdev.org/Paging

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::u52;
use bitbybit::bitfield;

/// Shift between a page-aligned address and its frame number.
pub const PAGE_SHIFT: usize = PAGE_FRAME_SIZE.trailing_zeros() as usize;

/// A leaf page table entry. Bit layout follows the x86 PTE; the frame number is
/// widened so the same entry can describe frames on 64-bit hosts.
#[bitfield(u64, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=63, rw)]
    frame_number: u52,
}

impl PageTableEntry {
    /// A present user entry pointing at the page-aligned `frame_base`.
    pub fn user(frame_base: usize, writable: bool) -> Self {
        debug_assert_eq!(frame_base % PAGE_FRAME_SIZE, 0);
        Self::DEFAULT
            .with_present(true)
            .with_user_supervisor(true)
            .with_read_write(writable)
            .with_frame_number(u52::new((frame_base >> PAGE_SHIFT) as u64))
    }

    /// Base address of the frame this entry points at.
    #[allow(clippy::cast_possible_truncation)]
    pub fn frame_base(&self) -> usize {
        (self.frame_number().value() as usize) << PAGE_SHIFT
    }
}
