use crate::block::BlockError;
use core::error::Error;
use core::fmt::{Display, Formatter};

/// Everything that can go wrong resolving, mapping or copying a user page.
///
/// Only recoverable conditions are represented here. Broken locking invariants panic
/// at the point they are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page covers the address and it is not a valid stack access.
    NoSuchPage(usize),
    /// A page already covers the address.
    AlreadyMapped(usize),
    /// The address or file offset must be page-aligned.
    NotPageAligned(usize),
    /// The address belongs to the kernel.
    KernelAddress(usize),
    /// A write was requested on a read-only page.
    ReadOnly(usize),
    /// No frame could be found or reclaimed after every retry.
    OutOfFrames,
    /// Every swap slot is in use, or there is no swap device.
    SwapExhausted,
    /// The page is expected to be in a frame but is not.
    NotResident(usize),
    /// A file-backed page could not be read in full.
    ShortRead { expected: usize, actual: usize },
    /// The swap device failed.
    Block(BlockError),
    /// The page directory refused the mapping.
    MappingFailed(usize),
    /// Mapping a zero-length region.
    EmptyMapping,
    /// A user string has no terminator within the allowed length.
    UnterminatedString(usize),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::NoSuchPage(addr) => write!(f, "no page at {addr:#x}"),
            VmError::AlreadyMapped(addr) => write!(f, "{addr:#x} is already mapped"),
            VmError::NotPageAligned(addr) => write!(f, "{addr:#x} is not page-aligned"),
            VmError::KernelAddress(addr) => write!(f, "{addr:#x} is a kernel address"),
            VmError::ReadOnly(addr) => write!(f, "page at {addr:#x} is read-only"),
            VmError::OutOfFrames => write!(f, "out of physical frames"),
            VmError::SwapExhausted => write!(f, "swap space exhausted"),
            VmError::NotResident(addr) => write!(f, "page at {addr:#x} is not resident"),
            VmError::ShortRead { expected, actual } => {
                write!(f, "short read: expected {expected} bytes, got {actual}")
            }
            VmError::Block(err) => write!(f, "swap device: {err}"),
            VmError::MappingFailed(addr) => write!(f, "could not map {addr:#x}"),
            VmError::EmptyMapping => write!(f, "cannot map an empty region"),
            VmError::UnterminatedString(addr) => {
                write!(f, "string at {addr:#x} is not terminated")
            }
        }
    }
}

impl Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Block(err)
    }
}
