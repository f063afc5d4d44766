use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// An event counter. Relaxed: the numbers are for reporting, not synchronization.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicUsize);

impl Counter {
    pub(crate) const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// A snapshot of the VM layer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub frames_total: usize,
    pub frames_in_use: usize,
    pub swap_slots_total: usize,
    pub swap_slots_free: usize,
    pub evictions: usize,
    pub file_discards: usize,
    pub swap_outs: usize,
    pub swap_ins: usize,
    pub alloc_retries: usize,
    pub alloc_failures: usize,
}

impl fmt::Display for VmStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Virtual Memory:")?;
        writeln!(
            f,
            "    frames: {:04} / {:04} in use, {:04} evictions ({:04} file pages discarded)",
            self.frames_in_use, self.frames_total, self.evictions, self.file_discards
        )?;
        writeln!(
            f,
            "    swap:   {:04} / {:04} slots free, {:04} out, {:04} in",
            self.swap_slots_free, self.swap_slots_total, self.swap_outs, self.swap_ins
        )?;
        write!(
            f,
            "    alloc:  {:04} retries, {:04} failures",
            self.alloc_retries, self.alloc_failures
        )
    }
}
