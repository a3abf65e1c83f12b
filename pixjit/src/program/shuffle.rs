//! Register and stack-slot moves attached to operators
use crate::program::op::{Location, OpFlags, Operator, Reg, VarId};

/// Index of a [`Shuffle`] within a program's shuffle arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShuffleId(pub(crate) u32);

/// A single move, performed immediately before its owning operator
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Shuffle {
    /// Stack slot to vector register
    Load {
        /// Variable being read from the frame
        var: VarId,
        /// Destination `xmm` register
        reg: u8,
    },
    /// Vector register to stack slot
    Store {
        /// Source `xmm` register
        reg: u8,
        /// Variable being written to the frame
        var: VarId,
    },
    /// Vector register to vector register
    Copy {
        /// Source `xmm` register
        src: u8,
        /// Destination `xmm` register
        dst: u8,
    },
}

impl Shuffle {
    /// Location read by this move
    pub fn src(&self) -> Location {
        match *self {
            Shuffle::Load { var, .. } => Location::Var(var),
            Shuffle::Store { reg, .. } => Location::Reg(Reg::Xmm(reg)),
            Shuffle::Copy { src, .. } => Location::Reg(Reg::Xmm(src)),
        }
    }

    /// Location written by this move
    pub fn dst(&self) -> Location {
        match *self {
            Shuffle::Load { reg, .. } => Location::Reg(Reg::Xmm(reg)),
            Shuffle::Store { var, .. } => Location::Var(var),
            Shuffle::Copy { dst, .. } => Location::Reg(Reg::Xmm(dst)),
        }
    }
}

impl std::fmt::Display for Shuffle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <- {}", self.dst(), self.src())
    }
}

/// Checks whether two adjacent moves may swap places
///
/// They may not if either one writes what the other reads, or if both write
/// the same location.
pub fn can_exchange(a: &Shuffle, b: &Shuffle) -> bool {
    a.dst() != b.src() && b.dst() != a.src() && a.dst() != b.dst()
}

/// Checks whether a move may be hoisted above an operator's instruction
pub fn can_exchange_with_instruction(m: &Shuffle, op: &Operator) -> bool {
    if op.flags.contains(OpFlags::NO_BUBBLE) {
        return false;
    }
    let (src, dst) = (m.src(), m.dst());
    !op.declared().any(|loc| loc == dst) && !op.clobbers().any(|loc| loc == src)
}
