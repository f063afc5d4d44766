use vmkernel_shared::mem::{OFFSET, STACK_MAX, STACK_SLACK};

/// How the clock hand picks a victim once no frame is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Evict the first frame the hand can lock without blocking.
    Clock,
    /// Spare a frame whose page was accessed since the hand last passed it (clearing
    /// the accessed bit), or that was claimed during the current rotation. Evict it
    /// on the next encounter.
    SecondChance,
}

#[cfg(not(feature = "second_chance"))]
const DEFAULT_POLICY: ReplacementPolicy = ReplacementPolicy::Clock;
#[cfg(feature = "second_chance")]
const DEFAULT_POLICY: ReplacementPolicy = ReplacementPolicy::SecondChance;

/// Tunables of the VM layer, fixed when the [`VmSystem`](super::VmSystem) is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Scan attempts made by frame allocation before it reports exhaustion.
    pub frame_alloc_attempts: usize,
    /// Sleep between two scan attempts.
    pub frame_alloc_backoff_ms: u64,
    /// Maximum size of the user stack, measured down from `user_top`.
    pub stack_max: usize,
    /// How far below the stack pointer a fault may land and still grow the stack.
    pub stack_slack: usize,
    /// First address that is not a user address.
    pub user_top: usize,
    /// Full turns of the clock hand per scan attempt.
    pub sweep_rotations: usize,
    pub policy: ReplacementPolicy,
}

impl VmConfig {
    pub const DEFAULT: Self = Self {
        frame_alloc_attempts: 3,
        frame_alloc_backoff_ms: 100,
        stack_max: STACK_MAX,
        stack_slack: STACK_SLACK,
        user_top: OFFSET,
        sweep_rotations: 2,
        policy: DEFAULT_POLICY,
    };

    /// Lowest address the stack may grow down to.
    pub fn stack_bottom(&self) -> usize {
        self.user_top.saturating_sub(self.stack_max)
    }

    /// Whether a fault at `address` with stack pointer `esp` is a push onto the stack.
    pub fn is_stack_access(&self, address: usize, esp: usize) -> bool {
        address < self.user_top
            && address >= self.stack_bottom()
            && address >= esp.saturating_sub(self.stack_slack)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
