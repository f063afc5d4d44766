use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Error type for block operations
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    SectorOutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    BufferInvalid,
    /// Error reading from the disk
    ReadError,
    /// Error writing to the disk
    WriteError,
    /// Attempted to write to a block owned by another operating system
    ReadOnly,
}

impl Debug for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockError::SectorOutOfBounds => write!(f, "SectorOutOfBounds"),
            BlockError::BufferInvalid => write!(f, "BufferInvalid"),
            BlockError::ReadError => write!(f, "ReadError"),
            BlockError::WriteError => write!(f, "WriteError"),
            BlockError::ReadOnly => write!(f, "ReadOnly"),
        }
    }
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let message = match self {
            BlockError::SectorOutOfBounds => "sector out of bounds (greater than the block size)",
            BlockError::BufferInvalid => "invalid buffer size (not `BLOCK_SECTOR_SIZE`)",
            BlockError::ReadError => "error reading from the block device",
            BlockError::WriteError => "error writing to the block device",
            BlockError::ReadOnly => "block device is not writable",
        };
        f.write_str(message)
    }
}

impl Error for BlockError {}
