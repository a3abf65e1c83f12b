//! Compiler passes, run in order on a finished [`Program`]
//!
//! 1. [`analyze`] builds dependency edges within each span
//! 2. [`schedule`] reorders each span, respecting those edges
//! 3. [`allocate`] places variables in vector registers, attaching moves
//! 4. [`bubble`] hoists those moves as early as hazards allow
//!
//! [`run`] performs all four.
mod alloc;
mod bubble;
mod deps;
mod lru;
mod schedule;

pub use alloc::{allocate, PlacementStats, XMM_LIMIT};
pub use bubble::{bubble, BubbleStats};
pub use deps::analyze;
pub use schedule::schedule;

use crate::{config::Options, program::Program, Error};

/// Summary of the work done by [`run`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Number of dependency edges
    pub edges: usize,
    /// Moves inserted by register placement
    pub placement: PlacementStats,
    /// Work done by the bubbler (zero if bubbling is disabled)
    pub bubble: BubbleStats,
}

/// Finishes the program (if needed) and runs every pass
pub fn run(p: &mut Program, opts: &Options) -> Result<PassStats, Error> {
    p.finish()?;
    let edges = analyze(p, opts)?;
    schedule(p, opts)?;
    let placement = allocate(p)?;
    let bubbled = if opts.bubble {
        bubble(p, opts)
    } else {
        BubbleStats::default()
    };
    Ok(PassStats {
        edges,
        placement,
        bubble: bubbled,
    })
}
