//! Copying between kernel buffers and user memory.
//!
//! User pages may be swapped out or not loaded yet, so each page is brought in and
//! pinned for the duration of the copy to or from it.

use crate::vm::{SupplementalPageTable, VmError};
use alloc::ffi::CString;
use alloc::vec::Vec;
use vmkernel_shared::mem::{pg_ofs, PAGE_FRAME_SIZE};
use zerocopy::{AsBytes, FromBytes};

fn check_range(
    spt: &SupplementalPageTable,
    pointer: usize,
    count: usize,
) -> Result<(), VmError> {
    let range_end = pointer
        .checked_add(count)
        .ok_or(VmError::KernelAddress(pointer))?;

    // Trying to touch kernel memory.
    if range_end > spt.vm().config().user_top {
        return Err(VmError::KernelAddress(pointer));
    }
    Ok(())
}

/// Call `f` with the pinned bytes of each page `pointer..pointer + count` spans, and
/// how many bytes came before them.
fn for_each_chunk(
    spt: &SupplementalPageTable,
    pointer: usize,
    count: usize,
    will_write: bool,
    mut f: impl FnMut(&mut [u8], usize),
) -> Result<(), VmError> {
    check_range(spt, pointer, count)?;
    let mut done = 0;
    while done < count {
        let address = pointer + done;
        let start = pg_ofs(address);
        let len = (PAGE_FRAME_SIZE - start).min(count - done);
        spt.with_pinned(address, will_write, |page| f(&mut page[start..start + len], done))?;
        done += len;
    }
    Ok(())
}

/// Copy `dst.len()` bytes from user address `src` into `dst`.
pub fn copy_in(spt: &SupplementalPageTable, dst: &mut [u8], src: usize) -> Result<(), VmError> {
    let count = dst.len();
    for_each_chunk(spt, src, count, false, |chunk, done| {
        dst[done..done + chunk.len()].copy_from_slice(chunk);
    })
}

/// Copy `src` to user address `dst`.
pub fn copy_out(spt: &SupplementalPageTable, dst: usize, src: &[u8]) -> Result<(), VmError> {
    for_each_chunk(spt, dst, src.len(), true, |chunk, done| {
        chunk.copy_from_slice(&src[done..done + chunk.len()]);
    })
}

/// Read a NUL-terminated string of at most `max_len` bytes (terminator excluded)
/// from user address `src`.
pub fn copy_in_string(
    spt: &SupplementalPageTable,
    src: usize,
    max_len: usize,
) -> Result<CString, VmError> {
    let mut bytes = Vec::new();
    let mut address = src;
    loop {
        let start = pg_ofs(address);
        let limit = (PAGE_FRAME_SIZE - start).min(max_len.saturating_add(1) - bytes.len());
        check_range(spt, address, 1)?;
        let terminated = spt.with_pinned(address, false, |page| {
            let chunk = &page[start..start + limit];
            match chunk.iter().position(|b| *b == 0) {
                Some(nul) => {
                    bytes.extend_from_slice(&chunk[..=nul]);
                    true
                }
                None => {
                    bytes.extend_from_slice(chunk);
                    false
                }
            }
        })?;
        if terminated {
            return CString::from_vec_with_nul(bytes)
                .map_err(|_| VmError::UnterminatedString(src));
        }
        if bytes.len() > max_len {
            return Err(VmError::UnterminatedString(src));
        }
        address += limit;
    }
}

/// Read a `T` from user address `src`.
pub fn copy_in_value<T: FromBytes + AsBytes>(
    spt: &SupplementalPageTable,
    src: usize,
) -> Result<T, VmError> {
    let mut value = T::new_zeroed();
    copy_in(spt, value.as_bytes_mut(), src)?;
    Ok(value)
}

/// Write `value` to user address `dst`.
pub fn copy_out_value<T: AsBytes>(
    spt: &SupplementalPageTable,
    dst: usize,
    value: &T,
) -> Result<(), VmError> {
    copy_out(spt, dst, value.as_bytes())
}
