//! Locks used by the VM layer.
//!
//! Leaf critical sections use the spinning `Mutex` from `spin`. Frames are pinned
//! with [`FrameLock`], which remembers its holder.

pub mod frame_lock;

pub use self::frame_lock::FrameLock;
pub use spin::{Mutex, MutexGuard};
