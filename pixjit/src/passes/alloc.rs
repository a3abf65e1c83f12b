//! Register placement, run after scheduling
use arrayvec::ArrayVec;

use crate::{
    passes::lru::Lru,
    program::{OpId, Opcode, Program, Shuffle, VarId},
    Error,
};

/// Number of vector registers available for variables
pub const XMM_LIMIT: usize = 16;

/// Counts of moves inserted by register placement
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementStats {
    /// Stack slot to register moves
    pub loads: usize,
    /// Register to stack slot moves
    pub stores: usize,
}

/// Single-pass, per-span register cache with least-recently-used eviction
struct Placer {
    /// Register holding each variable, if any
    homes: Vec<Option<u8>>,

    /// Variable held by each register, and whether the register is newer
    /// than the variable's stack slot
    regs: [Option<(VarId, bool)>; XMM_LIMIT],

    lru: Lru<XMM_LIMIT>,

    /// Unoccupied registers; the next one handed out is at the back
    spare: ArrayVec<u8, XMM_LIMIT>,

    stats: PlacementStats,
}

impl Placer {
    fn new(var_count: usize) -> Self {
        let mut out = Self {
            homes: vec![None; var_count],
            regs: [None; XMM_LIMIT],
            lru: Lru::new(),
            spare: ArrayVec::new(),
            stats: PlacementStats::default(),
        };
        out.reset();
        out
    }

    /// Forgets every cached variable
    fn reset(&mut self) {
        for (v, _) in self.regs.iter_mut().filter_map(Option::take) {
            self.homes[v.index()] = None;
        }
        self.spare.clear();
        self.spare.extend((0..XMM_LIMIT as u8).rev());
    }

    fn attach(
        &mut self,
        p: &mut Program,
        id: OpId,
        s: Shuffle,
    ) -> Result<(), Error> {
        match s {
            Shuffle::Load { .. } => self.stats.loads += 1,
            Shuffle::Store { .. } => self.stats.stores += 1,
            Shuffle::Copy { .. } => (),
        }
        p.attach_shuffle(id, s)?;
        Ok(())
    }

    /// Returns an unoccupied register, evicting the oldest one if needed
    fn get_register(&mut self, p: &mut Program, id: OpId) -> Result<u8, Error> {
        if let Some(reg) = self.spare.pop() {
            debug_assert!(self.regs[reg as usize].is_none());
            self.lru.touch(reg);
            return Ok(reg);
        }
        let reg = self.lru.evict();
        if let Some((var, dirty)) = self.regs[reg as usize].take() {
            self.homes[var.index()] = None;
            if dirty {
                self.attach(p, id, Shuffle::Store { reg, var })?;
            }
        }
        Ok(reg)
    }

    /// Stores every register that is newer than its stack slot
    fn flush(&mut self, p: &mut Program, id: OpId) -> Result<(), Error> {
        for reg in 0..XMM_LIMIT {
            if let Some((var, true)) = self.regs[reg] {
                self.attach(p, id, Shuffle::Store { reg: reg as u8, var })?;
                self.regs[reg] = Some((var, false));
            }
        }
        Ok(())
    }

    fn place(&mut self, p: &mut Program, id: OpId) -> Result<(), Error> {
        let op = p.op(id);
        if op.is_control() {
            if op.opcode != Opcode::Return {
                self.flush(p, id)?;
            }
            self.reset();
            return Ok(());
        }

        let operands = op.operands.map(|o| o.var());
        let result = op.result.var();
        let mut placed = [None; 4];
        for (slot, var) in operands.into_iter().enumerate() {
            let Some(var) = var else {
                continue;
            };
            let reg = match self.homes[var.index()] {
                Some(reg) => {
                    self.lru.touch(reg);
                    reg
                }
                None => {
                    let reg = self.get_register(p, id)?;
                    self.attach(p, id, Shuffle::Load { var, reg })?;
                    self.regs[reg as usize] = Some((var, false));
                    self.homes[var.index()] = Some(reg);
                    reg
                }
            };
            placed[slot] = Some(reg);
        }

        if let Some(var) = result {
            let reg = match self.homes[var.index()] {
                Some(reg) => {
                    self.lru.touch(reg);
                    reg
                }
                None => {
                    let reg = self.get_register(p, id)?;
                    self.homes[var.index()] = Some(reg);
                    reg
                }
            };
            self.regs[reg as usize] = Some((var, true));
            placed[3] = Some(reg);
        }
        p.ops[id.index()].placed = placed;
        Ok(())
    }
}

/// Assigns vector registers to every variable operand, inserting moves
///
/// Each span starts with an empty register cache; dirty registers are
/// written back before every control operator except the final return.
///
/// # Panics
/// If the program has already been placed
pub fn allocate(p: &mut Program) -> Result<PlacementStats, Error> {
    assert!(p.is_finished(), "program must be finished before placement");
    assert!(!p.placed, "registers have already been placed");
    let mut placer = Placer::new(p.var_count());
    for i in 0..p.seq.len() {
        let id = p.seq[i];
        placer.place(p, id)?;
    }
    p.placed = true;
    Ok(placer.stats)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::Options,
        passes::{analyze, schedule},
        program::{Constant, Gpr, MemRef, Opcode},
    };

    fn prepare(p: &mut Program) -> PlacementStats {
        let opts = Options::default();
        p.finish().unwrap();
        analyze(p, &opts).unwrap();
        schedule(p, &opts).unwrap();
        allocate(p).unwrap()
    }

    #[test]
    fn test_single_span() {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let b = p.binary(Opcode::AddPs, a, a).unwrap();
        p.store_mem(MemRef::base(Gpr::R8, 0), b).unwrap();
        let stats = prepare(&mut p);

        // Everything fits in registers, and nothing survives the return
        assert_eq!(stats, PlacementStats::default());
        let ops: Vec<_> = p.iter().collect();
        assert_eq!(ops[0].result_reg(), 0);
        assert_eq!(ops[1].operand_reg(0), 0);
        assert_eq!(ops[1].operand_reg(1), 0);
        assert_eq!(ops[1].result_reg(), 1);
        assert_eq!(ops[2].operand_reg(0), 1);
    }

    #[test]
    fn test_spill_across_spans() {
        let mut p = Program::new();
        let l = p.label();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        p.place_label(l).unwrap();
        let b = p.binary(Opcode::AddPs, a, a).unwrap();
        p.store_mem(MemRef::base(Gpr::R8, 0), b).unwrap();
        p.dec_gpr(Gpr::Rcx).unwrap();
        p.jump_if_not_zero(l).unwrap();
        let stats = prepare(&mut p);

        assert_eq!(stats, PlacementStats { loads: 1, stores: 2 });
        let label = p.sequence()[1];
        assert_eq!(
            p.shuffles(label).copied().collect::<Vec<_>>(),
            vec![Shuffle::Store { reg: 0, var: a }]
        );
        let add = p
            .sequence()
            .iter()
            .copied()
            .find(|id| p.op(*id).opcode == Opcode::AddPs)
            .unwrap();
        assert_eq!(
            p.shuffles(add).copied().collect::<Vec<_>>(),
            vec![Shuffle::Load { var: a, reg: 0 }]
        );
    }

    #[test]
    fn test_eviction() {
        let mut p = Program::new();
        let vars: Vec<_> = (0..XMM_LIMIT + 1)
            .map(|i| p.load_const(Constant::splat(i as f32)).unwrap())
            .collect();
        let mut sum = vars[0];
        for v in &vars[1..] {
            sum = p.binary(Opcode::AddPs, sum, *v).unwrap();
        }
        p.store_mem(MemRef::base(Gpr::R8, 0), sum).unwrap();
        let stats = prepare(&mut p);

        // Every store is eventually matched by a load of the same variable
        assert!(stats.stores > 0);
        let mut stored = vec![];
        for &id in p.sequence() {
            for s in p.shuffles(id) {
                match *s {
                    Shuffle::Store { var, .. } => stored.push(var),
                    Shuffle::Load { var, .. } => assert!(stored.contains(&var)),
                    Shuffle::Copy { .. } => unreachable!(),
                }
            }
        }
        for op in p.iter().filter(|op| !op.is_control()) {
            for r in op.placed.iter().flatten() {
                assert!((*r as usize) < XMM_LIMIT);
            }
        }
    }
}
