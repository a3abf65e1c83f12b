//! Compiler configuration

/// Selection policy used when picking the next ready operator
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Take operators in the order they became ready
    ///
    /// Operators that became ready during the same step are taken in their
    /// original program order.
    #[default]
    Fifo,

    /// Prefer the ready operator with the longest remaining dependency chain
    ///
    /// Ties are broken by current program order.
    CriticalPath,
}

impl std::fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulePolicy::Fifo => write!(f, "fifo"),
            SchedulePolicy::CriticalPath => write!(f, "critical-path"),
        }
    }
}

/// Settings which control a single compilation
#[derive(Clone, Debug)]
pub struct Options {
    /// Allow operators touching memory outside the stack frame to be
    /// reordered relative to each other
    ///
    /// This is only safe if the state and output buffers never alias.
    pub relaxed_memory: bool,

    /// Ready-list selection policy for the list scheduler
    pub policy: SchedulePolicy,

    /// Hoist register/memory moves ahead of earlier instructions
    pub bubble: bool,

    /// Maximum number of exchanges performed by the bubbler
    ///
    /// `None` means unbounded; this is mostly useful to bound compile time
    /// (or to bisect a miscompile) when investigating the bubbler.
    pub max_bubble_swaps: Option<usize>,

    /// Largest stack frame (in bytes) that the assembler will reserve
    pub max_frame_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            relaxed_memory: false,
            policy: SchedulePolicy::default(),
            bubble: true,
            max_bubble_swaps: None,
            max_frame_size: 1 << 20,
        }
    }
}
