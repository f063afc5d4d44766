use crate::block::{BlockError, BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

/// A block device driver backed by kernel memory.
///
/// Used for swap when the machine has no spare disk, and by tests. Reads and writes
/// can be made to fail to exercise the I/O error paths.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl RamDisk {
    pub fn new(sector_count: BlockSector) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sector_count as usize * BLOCK_SECTOR_SIZE]),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn range(sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(BlockError::ReadError);
        }
        let sectors = self.sectors.lock();
        let src = sectors
            .get(Self::range(sector))
            .ok_or(BlockError::SectorOutOfBounds)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(BlockError::WriteError);
        }
        let mut sectors = self.sectors.lock();
        let dst = sectors
            .get_mut(Self::range(sector))
            .ok_or(BlockError::SectorOutOfBounds)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
