//! Stack frame layout and reservation
use arrayvec::ArrayVec;

use crate::program::{Gpr, Location, Program, Reg};

/// Granularity at which the OS commits stack pages
pub const PAGE_SIZE: usize = 4096;

/// Callee-saved registers, in push order
const CALLEE_SAVED: [Gpr; 5] =
    [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// One step of the prologue's stack reservation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameStep {
    /// `sub rsp, n`
    Reserve(u32),
    /// Dummy read of `[rsp]`, faulting in the guard page
    Touch,
    /// `and rsp, -16`
    Align,
}

/// Plans the reservation of `size` bytes of stack
///
/// Frames larger than a page are reserved one page at a time, touching each
/// page as it is reserved, so the stack never skips over its guard page.
pub fn reservation_plan(size: usize) -> Vec<FrameStep> {
    let mut out = vec![];
    let mut remaining = size;
    while remaining > PAGE_SIZE {
        out.push(FrameStep::Reserve(PAGE_SIZE as u32));
        out.push(FrameStep::Touch);
        remaining -= PAGE_SIZE;
    }
    if remaining > 0 {
        out.push(FrameStep::Reserve(remaining as u32));
    }
    out.push(FrameStep::Align);
    if size > PAGE_SIZE {
        out.push(FrameStep::Touch);
    }
    out
}

/// Everything the prologue and epilogue need to know
#[derive(Clone, Debug)]
pub struct Frame {
    /// Callee-saved registers written by the program, in push order
    pub saved: ArrayVec<Gpr, 5>,
    /// Bytes reserved for variable slots
    pub size: usize,
    /// Reservation steps emitted by the prologue
    pub plan: Vec<FrameStep>,
}

impl Frame {
    /// Builds the frame for a finished program
    pub fn new(p: &Program) -> Self {
        let mut written = [false; 16];
        for op in p.iter() {
            for loc in op.writes() {
                if let Location::Reg(Reg::Gpr(g)) = loc {
                    written[g.index() as usize] = true;
                }
            }
        }
        let saved = CALLEE_SAVED
            .into_iter()
            .filter(|g| written[g.index() as usize])
            .collect();
        let size = p.mapper().frame_size();
        Self {
            saved,
            size,
            plan: reservation_plan(size),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::{Constant, MemRef, Opcode};

    #[test]
    fn test_small_frame() {
        assert_eq!(reservation_plan(0), vec![FrameStep::Align]);
        assert_eq!(
            reservation_plan(48),
            vec![FrameStep::Reserve(48), FrameStep::Align]
        );
        assert_eq!(
            reservation_plan(PAGE_SIZE),
            vec![FrameStep::Reserve(4096), FrameStep::Align]
        );
    }

    #[test]
    fn test_page_boundary() {
        // One byte past a page still touches after the first page
        assert_eq!(
            reservation_plan(PAGE_SIZE + 1),
            vec![
                FrameStep::Reserve(4096),
                FrameStep::Touch,
                FrameStep::Reserve(1),
                FrameStep::Align,
                FrameStep::Touch,
            ]
        );
        let plan = reservation_plan(3 * PAGE_SIZE);
        let reserved: u32 = plan
            .iter()
            .map(|s| match s {
                FrameStep::Reserve(n) => *n,
                _ => 0,
            })
            .sum();
        assert_eq!(reserved as usize, 3 * PAGE_SIZE);
        assert_eq!(plan.iter().filter(|s| **s == FrameStep::Touch).count(), 3);
    }

    #[test]
    fn test_saved_registers() {
        let mut p = Program::new();
        let a = p.load_mem(MemRef::base(Gpr::R12, 0)).unwrap();
        let b = p.binary(Opcode::AddPs, a, a).unwrap();
        p.store_mem(MemRef::base(Gpr::R8, 0), b).unwrap();
        p.add_gpr_imm(Gpr::R12, 16).unwrap();
        p.add_gpr_imm(Gpr::Rbx, 1).unwrap();
        p.add_gpr_imm(Gpr::R8, 16).unwrap();
        let _ = p.load_const(Constant::splat(1.0)).unwrap();
        p.finish().unwrap();
        let f = Frame::new(&p);
        assert_eq!(f.saved.as_slice(), &[Gpr::Rbx, Gpr::R12]);
        assert_eq!(f.size, 48);
    }
}
