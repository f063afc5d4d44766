//! Swap space: page-sized slots on the swap block device, tracked by a bitmap.
//!
//! Slot `n` occupies sectors `n * SECTORS_PER_PAGE .. (n + 1) * SECTORS_PER_PAGE`.
//! Only the bitmap is locked; the sector transfers of different slots run in
//! parallel.

use super::error::VmError;
use super::page::Page;
use super::stats::Counter;
use crate::block::{Block, BlockError, BlockManager, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::sync::Arc;
use bitvec::order::Lsb0;
use bitvec::vec::BitVec;
use core::fmt;
use log::{debug, info, warn};
use vmkernel_shared::mem::SECTORS_PER_PAGE;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    /// Sector holding the slot's first `BLOCK_SECTOR_SIZE` bytes.
    pub fn first_sector(self) -> Result<BlockSector, BlockError> {
        self.0
            .checked_mul(SECTORS_PER_PAGE)
            .and_then(|sector| BlockSector::try_from(sector).ok())
            .ok_or(BlockError::SectorOutOfBounds)
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

pub struct SwapSpace {
    device: Option<Arc<Block>>,
    /// One bit per slot, set while the slot holds a page.
    bitmap: Mutex<BitVec<usize, Lsb0>>,
    pub(crate) swap_outs: Counter,
    pub(crate) swap_ins: Counter,
}

impl SwapSpace {
    /// Attach `device`. Without one, swap has zero slots and every swap-out fails with
    /// [`VmError::SwapExhausted`].
    pub fn new(device: Option<Arc<Block>>) -> Self {
        let slots = match &device {
            Some(block) => {
                let slots = block.get_size() as usize / SECTORS_PER_PAGE;
                info!(
                    "swap: {} slots on {} ({} sectors)",
                    slots,
                    block.get_name(),
                    block.get_size()
                );
                slots
            }
            None => {
                info!("swap: no swap device, swap disabled");
                0
            }
        };
        Self {
            device,
            bitmap: Mutex::new(BitVec::repeat(false, slots)),
            swap_outs: Counter::new(),
            swap_ins: Counter::new(),
        }
    }

    /// Use the first block device registered for the swap role.
    pub fn from_manager(manager: &BlockManager) -> Self {
        Self::new(manager.by_role(BlockType::Swap))
    }

    pub fn capacity(&self) -> usize {
        self.bitmap.lock().len()
    }

    pub fn free_slots(&self) -> usize {
        self.bitmap.lock().count_zeros()
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.bitmap.lock().get(slot.0).is_some_and(|bit| *bit)
    }

    fn claim(&self) -> Option<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        let index = bitmap.first_zero()?;
        bitmap.set(index, true);
        Some(SwapSlot(index))
    }

    /// Return `slot` to the free pool. Its contents are lost.
    pub fn release(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        assert!(
            bitmap.get(slot.0).is_some_and(|bit| *bit),
            "released {slot}, which is not in use"
        );
        bitmap.set(slot.0, false);
    }

    /// Write the contents of `page`'s frame to a fresh slot and record the slot on the
    /// page, which then no longer has a frame.
    ///
    /// The caller must hold the page's frame lock. On failure no slot is kept and the
    /// page still has its frame.
    pub fn swap_out(&self, page: &Page) -> Result<SwapSlot, VmError> {
        let frame = page.frame().ok_or(VmError::NotResident(page.addr()))?;
        let Some(device) = self.device.as_ref() else {
            return Err(VmError::SwapExhausted);
        };
        let Some(slot) = self.claim() else {
            warn!("swap: out of slots evicting page {:#x}", page.addr());
            return Err(VmError::SwapExhausted);
        };

        let written = page
            .vm()
            .frames()
            .with_contents(frame, |bytes| transfer_out(device, slot, bytes));
        if let Err(err) = written {
            warn!("swap: writing {slot} failed: {err}");
            self.release(slot);
            return Err(err.into());
        }

        page.detach_to_swap(slot);
        self.swap_outs.inc();
        debug!("swap: page {:#x} -> {}", page.addr(), slot);
        Ok(slot)
    }

    /// Read `page`'s slot into its frame, then free the slot.
    ///
    /// The caller must hold the page's frame lock. On failure the slot keeps the page's
    /// contents.
    pub fn swap_in(&self, page: &Page) -> Result<(), VmError> {
        let frame = page.frame().ok_or(VmError::NotResident(page.addr()))?;
        let slot = page
            .swap_slot()
            .unwrap_or_else(|| panic!("swap in of page {:#x} without a slot", page.addr()));
        assert!(self.is_in_use(slot), "page {:#x} refers to free {slot}", page.addr());
        let Some(device) = self.device.as_ref() else {
            panic!("{slot} in use without a swap device");
        };

        page.vm()
            .frames()
            .with_contents(frame, |bytes| transfer_in(device, slot, bytes))?;

        page.clear_swap_slot();
        self.release(slot);
        self.swap_ins.inc();
        debug!("swap: {} -> page {:#x}", slot, page.addr());
        Ok(())
    }
}

fn transfer_out(device: &Block, slot: SwapSlot, bytes: &[u8]) -> Result<(), BlockError> {
    let first = slot.first_sector()?;
    for (sector, chunk) in (first..).zip(bytes.chunks_exact(BLOCK_SECTOR_SIZE)) {
        device.write(sector, chunk)?;
    }
    Ok(())
}

fn transfer_in(device: &Block, slot: SwapSlot, bytes: &mut [u8]) -> Result<(), BlockError> {
    let first = slot.first_sector()?;
    for (sector, chunk) in (first..).zip(bytes.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
        device.read(sector, chunk)?;
    }
    Ok(())
}

impl fmt::Debug for SwapSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SwapSpace")
            .field("capacity", &self.capacity())
            .field("free", &self.free_slots())
            .finish_non_exhaustive()
    }
}
