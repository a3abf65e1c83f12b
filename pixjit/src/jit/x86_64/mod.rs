//! Code generation for `x86_64` with AVX
//!
//! Every vector variable is placed in one of `xmm0-15` by the placement pass
//! before we get here, so the assembler is a straight walk over the program
//! sequence: each operator's moves are emitted first, then the operator
//! itself.
//!
//! The stack is configured as follows (offsets relative to `rbp`):
//!
//! ```text
//! | Position | Value         | Notes                                      |
//! |----------|---------------|--------------------------------------------|
//! | 0x00     | `rbp`         | Previous value for base pointer            |
//! |----------|---------------|--------------------------------------------|
//! | -0x08    | `rbx`, `r12`  | Callee-saved registers which the program   |
//! | ...      | ...           | writes, in push order                      |
//! |----------|---------------|--------------------------------------------|
//! | ...      | padding       | From aligning `rsp` to 16 bytes            |
//! |----------|---------------|--------------------------------------------|
//! | ...      | variables     | 16-byte slots, addressed as `[rsp + off]`  |
//! ```
//!
//! Literals live in pools after the code, and are addressed relative to
//! `rip`.  Their displacements are unknown until the code length is known,
//! so the program is assembled twice; every instruction has the same length
//! in both passes.
use std::ops::Range;

use dynasmrt::{
    dynasm, x64::X64Relocation, DynamicLabel, DynasmApi, DynasmLabelApi,
    VecAssembler,
};

use crate::{
    jit::{
        frame::{Frame, FrameStep},
        pool::{PoolLayout, Pools},
    },
    program::{
        Constant, MemRef, OpClass, OpFlags, OpId, Opcode, Operand, Operator,
        Payload, Program, Reg, Scale, Shuffle, VarId,
    },
    Error,
};

pub mod vex;

use vex::{encode_rip_load, encode_rr, encoding, ConstLoad, Encoding};

/// Output of a single assembly pass
pub struct Assembled {
    /// Machine code, without literal pools
    pub code: Vec<u8>,
    /// Byte range covered by each operator, including its moves
    pub ranges: Vec<(OpId, Range<usize>)>,
}

/// Single-pass assembler over a placed [`Program`]
pub struct ProgramAssembler<'a> {
    ops: VecAssembler<X64Relocation>,
    program: &'a Program,
    frame: &'a Frame,
    pools: &'a Pools,

    /// Pool positions; `None` during the measuring pass
    layout: Option<&'a PoolLayout>,

    labels: Vec<DynamicLabel>,
    uses_avx: bool,
}

impl<'a> ProgramAssembler<'a> {
    /// Builds an assembler
    ///
    /// If `layout` is `None`, literal displacements are emitted as zero.
    pub fn new(
        program: &'a Program,
        frame: &'a Frame,
        pools: &'a Pools,
        layout: Option<&'a PoolLayout>,
    ) -> Self {
        let mut ops = VecAssembler::new(0);
        let labels = (0..program.label_count())
            .map(|_| ops.new_dynamic_label())
            .collect();
        let uses_avx = program
            .iter()
            .any(|op| op.flags.contains(OpFlags::USES_AVX));
        Self {
            ops,
            program,
            frame,
            pools,
            layout,
            labels,
            uses_avx,
        }
    }

    /// Emits the whole program, resolving jumps
    pub fn run(mut self) -> Result<Assembled, Error> {
        let program = self.program;
        self.prologue();
        let mut ranges = Vec::with_capacity(program.len());
        for &id in program.sequence() {
            let start = self.ops.offset().0;
            for s in program.shuffles(id) {
                self.shuffle(*s);
            }
            self.operator(program.op(id))?;
            ranges.push((id, start..self.ops.offset().0));
        }
        let code = self.ops.finalize()?;
        Ok(Assembled { code, ranges })
    }

    fn prologue(&mut self) {
        let frame = self.frame;
        dynasm!(self.ops
            ; push rbp
            ; mov rbp, rsp
        );
        for g in &frame.saved {
            dynasm!(self.ops
                ; push Rq(g.index())
            );
        }
        for step in &frame.plan {
            match *step {
                FrameStep::Reserve(n) => dynasm!(self.ops
                    ; sub rsp, n as i32
                ),
                FrameStep::Touch => dynasm!(self.ops
                    ; test [rsp], rsp
                ),
                FrameStep::Align => dynasm!(self.ops
                    ; and rsp, -16
                ),
            }
        }
    }

    fn epilogue(&mut self) {
        let frame = self.frame;
        if self.uses_avx {
            dynasm!(self.ops
                ; vzeroupper
            );
        }
        let saved = -8 * frame.saved.len() as i32;
        dynasm!(self.ops
            ; lea rsp, [rbp + saved]
        );
        for g in frame.saved.iter().rev() {
            dynasm!(self.ops
                ; pop Rq(g.index())
            );
        }
        dynasm!(self.ops
            ; pop rbp
            ; ret
        );
    }

    fn slot(&self, v: VarId) -> i32 {
        self.program.mapper().offset_of(v) as i32
    }

    fn shuffle(&mut self, s: Shuffle) {
        match s {
            Shuffle::Load { var, reg } => {
                let off = self.slot(var);
                dynasm!(self.ops
                    ; vmovaps Rx(reg), [rsp + off]
                );
            }
            Shuffle::Store { reg, var } => {
                let off = self.slot(var);
                dynasm!(self.ops
                    ; vmovaps [rsp + off], Rx(reg)
                );
            }
            Shuffle::Copy { src, dst } => {
                dynasm!(self.ops
                    ; vmovaps Rx(dst), Rx(src)
                );
            }
        }
    }

    fn operator(&mut self, op: &Operator) -> Result<(), Error> {
        match op.opcode.class() {
            OpClass::Unary => self.regular(op, encode_unary),
            OpClass::Binary => self.regular(op, encode_binary),
            OpClass::Ternary => Err(Error::Unimplemented(op.opcode)),
            OpClass::Irregular => self.irregular(op),
            OpClass::MemDst => {
                let Payload::Mem(m) = op.payload else {
                    panic!("{} without a memory reference", op.opcode);
                };
                self.store_mem(op.operand_reg(0), m);
                Ok(())
            }
            OpClass::Control => {
                self.control(op);
                Ok(())
            }
        }
    }

    fn regular(
        &mut self,
        op: &Operator,
        f: fn(Encoding, &Operator) -> [u8; 5],
    ) -> Result<(), Error> {
        match encoding(op.opcode) {
            enc @ Encoding::Vex { .. } => {
                self.ops.extend(f(enc, op));
                Ok(())
            }
            Encoding::Unimplemented => Err(Error::Unimplemented(op.opcode)),
            Encoding::Custom => {
                panic!("{} has no table encoding", op.opcode)
            }
        }
    }

    fn irregular(&mut self, op: &Operator) -> Result<(), Error> {
        match (op.opcode, op.payload) {
            (Opcode::LoadConst, Payload::Const(c)) => {
                self.load_const(op.result_reg(), c)
            }
            (Opcode::LoadMem, Payload::Mem(m)) => {
                self.load_mem(op.result_reg(), m);
            }
            (Opcode::SplatGpr, _) => {
                let g = gpr_operand(op);
                let r = op.result_reg();
                dynasm!(self.ops
                    ; vcvtsi2ss Rx(r), Rx(r), Rd(g)
                    ; vshufps Rx(r), Rx(r), Rx(r), 0
                );
            }
            (Opcode::AddGprImm, Payload::Imm(imm)) => {
                let g = gpr_operand(op);
                dynasm!(self.ops
                    ; add Rq(g), imm
                );
            }
            (Opcode::DecGpr, _) => {
                let g = gpr_operand(op);
                dynasm!(self.ops
                    ; dec Rd(g)
                );
            }
            (Opcode::TestGpr, _) => {
                let g = gpr_operand(op);
                dynasm!(self.ops
                    ; test Rd(g), Rd(g)
                );
            }
            (opcode, payload) => {
                panic!("invalid payload {payload:?} for {opcode}")
            }
        }
        Ok(())
    }

    fn load_const(&mut self, r: u8, c: Constant) {
        let kind = match c {
            Constant::Four(..) => ConstLoad::Broadcast4,
            Constant::Eight(..) => ConstLoad::Broadcast8,
            Constant::Sixteen(..) => ConstLoad::Full16,
        };
        // Displacements are relative to the end of the instruction
        let disp = match self.layout {
            Some(layout) => {
                let target = self.pools.offset(layout, c);
                let next = self.ops.offset().0 + vex::RIP_LOAD_LEN;
                (target as i64 - next as i64) as i32
            }
            None => 0,
        };
        self.ops.extend(encode_rip_load(kind, r, disp));
    }

    fn load_mem(&mut self, r: u8, m: MemRef) {
        let b = m.base.index();
        let d = m.disp;
        match m.index {
            None => dynasm!(self.ops
                ; vmovups Rx(r), [Rq(b) + d]
            ),
            Some((i, s)) => {
                let i = i.index();
                match s {
                    Scale::X1 => dynasm!(self.ops
                        ; vmovups Rx(r), [Rq(b) + Rq(i) + d]
                    ),
                    Scale::X2 => dynasm!(self.ops
                        ; vmovups Rx(r), [Rq(b) + Rq(i) * 2 + d]
                    ),
                    Scale::X4 => dynasm!(self.ops
                        ; vmovups Rx(r), [Rq(b) + Rq(i) * 4 + d]
                    ),
                    Scale::X8 => dynasm!(self.ops
                        ; vmovups Rx(r), [Rq(b) + Rq(i) * 8 + d]
                    ),
                }
            }
        }
    }

    fn store_mem(&mut self, r: u8, m: MemRef) {
        let b = m.base.index();
        let d = m.disp;
        match m.index {
            None => dynasm!(self.ops
                ; vmovups [Rq(b) + d], Rx(r)
            ),
            Some((i, s)) => {
                let i = i.index();
                match s {
                    Scale::X1 => dynasm!(self.ops
                        ; vmovups [Rq(b) + Rq(i) + d], Rx(r)
                    ),
                    Scale::X2 => dynasm!(self.ops
                        ; vmovups [Rq(b) + Rq(i) * 2 + d], Rx(r)
                    ),
                    Scale::X4 => dynasm!(self.ops
                        ; vmovups [Rq(b) + Rq(i) * 4 + d], Rx(r)
                    ),
                    Scale::X8 => dynasm!(self.ops
                        ; vmovups [Rq(b) + Rq(i) * 8 + d], Rx(r)
                    ),
                }
            }
        }
    }

    fn control(&mut self, op: &Operator) {
        let label = |p: Payload| match p {
            Payload::Label(l) => l,
            p => panic!("invalid payload {p:?} for {}", op.opcode),
        };
        match op.opcode {
            Opcode::Label => {
                let l = self.labels[label(op.payload).index()];
                dynasm!(self.ops
                    ; =>l
                );
            }
            Opcode::Jump => {
                let l = self.labels[label(op.payload).index()];
                dynasm!(self.ops
                    ; jmp =>l
                );
            }
            Opcode::JumpIfZero => {
                let l = self.labels[label(op.payload).index()];
                dynasm!(self.ops
                    ; jz =>l
                );
            }
            Opcode::JumpIfNotZero => {
                let l = self.labels[label(op.payload).index()];
                dynasm!(self.ops
                    ; jnz =>l
                );
            }
            Opcode::Return => self.epilogue(),
            opcode => panic!("{opcode} is not a control opcode"),
        }
    }
}

/// Returns the hardware number of the first operand, which must be a GPR
fn gpr_operand(op: &Operator) -> u8 {
    match op.operands[0] {
        Operand::Reg(Reg::Gpr(g)) => g.index(),
        o => panic!(
            "{} expects a general-purpose register, got {o:?}",
            op.opcode
        ),
    }
}

fn encode_unary(enc: Encoding, op: &Operator) -> [u8; 5] {
    encode_rr(enc, op.result_reg(), 0, op.operand_reg(0))
}

fn encode_binary(enc: Encoding, op: &Operator) -> [u8; 5] {
    encode_rr(enc, op.result_reg(), op.operand_reg(0), op.operand_reg(1))
}
