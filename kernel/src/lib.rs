#![cfg_attr(target_os = "none", no_std)]

//! Demand paging for a small x86 teaching kernel: frame table, supplemental page
//! tables and swap, plus the pieces of the kernel they sit on.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod logging;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod threading;
pub mod vm;
