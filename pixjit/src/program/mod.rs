//! Operator graphs and their construction
//!
//! A [`Program`] owns every operator, edge, and move that the compiler
//! passes work with.  Front ends build it by calling the construction methods
//! below (optionally splitting into parallel [flows](Program::split_flow)),
//! then call [`Program::finish`] to divide it into spans and map variables
//! to stack slots.
//!
//! ```
//! use pixjit::program::{Constant, Opcode, Program};
//!
//! let mut p = Program::new();
//! let a = p.load_const(Constant::splat(1.5))?;
//! let b = p.binary(Opcode::AddPs, a, a)?;
//! p.finish()?;
//!
//! assert_eq!(p.spans().len(), 1);
//! assert_eq!(p.len(), 3); // two operators plus the implicit return
//! assert_ne!(p.mapper().offset_of(a), p.mapper().offset_of(b));
//! # Ok::<(), pixjit::Error>(())
//! ```
mod flow;
mod hook;
mod mapper;
mod op;
mod shuffle;

pub use flow::MAX_FLOWS;
pub(crate) use hook::Hooks;
pub use mapper::{Mapper, SLOT_SIZE};
pub use op::{
    Constant, Gpr, LabelId, Location, MemRef, OpClass, OpFlags, OpId, Opcode,
    Operand, Operator, Payload, RefKind, Reg, Scale, VarId,
};
pub use shuffle::{
    can_exchange, can_exchange_with_instruction, Shuffle, ShuffleId,
};

use crate::Error;
use flow::{Flow, FlowState};

/// A basic block: operators `first..last` of the program sequence
///
/// Every span ends with a control operator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Span {
    /// Position of the first operator
    pub first: usize,
    /// One past the position of the last operator
    pub last: usize,
    /// Longest dependency chain found while scheduling
    pub longest_chain_size: u32,
    /// Largest ready-list size observed while scheduling
    pub variety: u32,
}

impl Span {
    /// Number of operators in the span
    pub fn len(&self) -> usize {
        self.last - self.first
    }

    /// Checks whether the span is empty
    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }
}

/// An operator graph under construction or compilation
#[derive(Default)]
pub struct Program {
    /// Arena of every operator ever pushed
    pub(crate) ops: Vec<Operator>,
    /// Active operator sequence (the main flow, or a side flow when split)
    pub(crate) seq: Vec<OpId>,

    state: FlowState,
    /// Main flow, parked here while a side flow is active
    main: Vec<OpId>,
    flows: [Flow; MAX_FLOWS],

    var_count: u32,
    labels: Vec<bool>,
    jump_targets: Vec<LabelId>,

    pub(crate) spans: Vec<Span>,
    pub(crate) hooks: Hooks,
    pub(crate) shuffles: Vec<Shuffle>,
    pub(crate) mapper: Mapper,

    finished: bool,
    pub(crate) placed: bool,
}

impl Program {
    /// Builds an empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh variable
    pub fn var(&mut self) -> VarId {
        let v = VarId(self.var_count);
        self.var_count += 1;
        v
    }

    /// Allocates a fresh label, to be placed with [`Program::place_label`]
    pub fn label(&mut self) -> LabelId {
        let l = LabelId(self.labels.len() as u32);
        self.labels.push(false);
        l
    }

    /// Number of variables allocated
    pub fn var_count(&self) -> usize {
        self.var_count as usize
    }

    /// Number of labels allocated
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Appends an operator to the active flow
    ///
    /// # Panics
    /// If the program has already been finished
    pub fn push(&mut self, op: Operator) -> Result<OpId, Error> {
        assert!(!self.finished, "cannot push into a finished program");
        for v in op.operands.iter().chain([&op.result]).filter_map(Operand::var)
        {
            assert!(v.0 < self.var_count, "unknown variable {v}");
        }
        let id = OpId(
            u32::try_from(self.ops.len()).map_err(|_| Error::OutOfMemory)?,
        );
        self.ops.try_reserve(1)?;
        self.seq.try_reserve(1)?;

        let mut op = op;
        op.order = self.seq.len() as u32;
        self.ops.push(op);
        self.seq.push(id);
        Ok(id)
    }

    fn emit(
        &mut self,
        opcode: Opcode,
        result: Operand,
        operands: [Operand; 3],
        payload: Payload,
    ) -> Result<OpId, Error> {
        self.push(Operator::new(opcode, result, operands, payload))
    }

    fn emit_var(
        &mut self,
        opcode: Opcode,
        operands: [Operand; 3],
        payload: Payload,
    ) -> Result<VarId, Error> {
        let out = self.var();
        self.emit(opcode, out.into(), operands, payload)?;
        Ok(out)
    }

    /// Appends a unary vector operator, returning its result
    ///
    /// # Panics
    /// If `opcode` is not [`OpClass::Unary`]
    pub fn unary(
        &mut self,
        opcode: Opcode,
        arg: VarId,
    ) -> Result<VarId, Error> {
        assert_eq!(opcode.class(), OpClass::Unary, "{opcode} is not unary");
        self.emit_var(
            opcode,
            [arg.into(), Operand::None, Operand::None],
            Payload::None,
        )
    }

    /// Appends a binary vector operator, returning its result
    ///
    /// # Panics
    /// If `opcode` is not [`OpClass::Binary`]
    pub fn binary(
        &mut self,
        opcode: Opcode,
        lhs: VarId,
        rhs: VarId,
    ) -> Result<VarId, Error> {
        assert_eq!(opcode.class(), OpClass::Binary, "{opcode} is not binary");
        self.emit_var(
            opcode,
            [lhs.into(), rhs.into(), Operand::None],
            Payload::None,
        )
    }

    /// Appends a ternary vector operator, returning its result
    ///
    /// # Panics
    /// If `opcode` is not [`OpClass::Ternary`]
    pub fn ternary(
        &mut self,
        opcode: Opcode,
        a: VarId,
        b: VarId,
        c: VarId,
    ) -> Result<VarId, Error> {
        assert_eq!(opcode.class(), OpClass::Ternary, "{opcode} is not ternary");
        self.emit_var(opcode, [a.into(), b.into(), c.into()], Payload::None)
    }

    /// Overwrites an existing variable with a binary operator's result
    pub fn binary_into(
        &mut self,
        opcode: Opcode,
        out: VarId,
        lhs: VarId,
        rhs: VarId,
    ) -> Result<OpId, Error> {
        assert_eq!(opcode.class(), OpClass::Binary, "{opcode} is not binary");
        self.emit(
            opcode,
            out.into(),
            [lhs.into(), rhs.into(), Operand::None],
            Payload::None,
        )
    }

    /// Copies one variable into another
    pub fn copy(&mut self, out: VarId, src: VarId) -> Result<OpId, Error> {
        self.emit(
            Opcode::Copy,
            out.into(),
            [src.into(), Operand::None, Operand::None],
            Payload::None,
        )
    }

    /// Loads a pooled literal into a fresh variable
    pub fn load_const(&mut self, c: Constant) -> Result<VarId, Error> {
        self.emit_var(Opcode::LoadConst, Default::default(), Payload::Const(c))
    }

    /// Loads 16 bytes of outside memory into a fresh variable
    ///
    /// # Panics
    /// If `m` addresses through `rsp` or `rbp`
    pub fn load_mem(&mut self, m: MemRef) -> Result<VarId, Error> {
        self.emit_var(Opcode::LoadMem, Default::default(), Payload::Mem(m))
    }

    /// Stores a variable to 16 bytes of outside memory
    ///
    /// # Panics
    /// If `m` addresses through `rsp` or `rbp`
    pub fn store_mem(&mut self, m: MemRef, v: VarId) -> Result<OpId, Error> {
        self.emit(
            Opcode::StoreMem,
            Operand::None,
            [v.into(), Operand::None, Operand::None],
            Payload::Mem(m),
        )
    }

    /// Converts a 32-bit integer register to `f32`, splatted to every lane
    pub fn splat_gpr(&mut self, g: Gpr) -> Result<VarId, Error> {
        assert!(!g.is_reserved(), "{g:?} is reserved");
        self.emit_var(
            Opcode::SplatGpr,
            [g.into(), Operand::None, Operand::None],
            Payload::None,
        )
    }

    /// Adds an immediate to a general-purpose register
    ///
    /// The zero flag is set from the full 64-bit result.
    pub fn add_gpr_imm(&mut self, g: Gpr, imm: i32) -> Result<OpId, Error> {
        assert!(!g.is_reserved(), "{g:?} is reserved");
        self.emit(
            Opcode::AddGprImm,
            g.into(),
            [g.into(), Operand::None, Operand::None],
            Payload::Imm(imm),
        )
    }

    /// Decrements a general-purpose register, setting the zero flag
    pub fn dec_gpr(&mut self, g: Gpr) -> Result<OpId, Error> {
        assert!(!g.is_reserved(), "{g:?} is reserved");
        self.emit(
            Opcode::DecGpr,
            g.into(),
            [g.into(), Operand::None, Operand::None],
            Payload::None,
        )
    }

    /// Sets the zero flag if a general-purpose register is zero
    pub fn test_gpr(&mut self, g: Gpr) -> Result<OpId, Error> {
        self.emit(
            Opcode::TestGpr,
            Operand::None,
            [g.into(), Operand::None, Operand::None],
            Payload::None,
        )
    }

    /// Marks the current position as the target of `label`
    ///
    /// # Panics
    /// If the label has already been placed
    pub fn place_label(&mut self, label: LabelId) -> Result<OpId, Error> {
        let placed = &mut self.labels[label.index()];
        assert!(!*placed, "label {} placed twice", label.index());
        *placed = true;
        self.emit(
            Opcode::Label,
            Operand::None,
            Default::default(),
            Payload::Label(label),
        )
    }

    fn emit_jump(
        &mut self,
        opcode: Opcode,
        label: LabelId,
    ) -> Result<OpId, Error> {
        assert!(label.index() < self.labels.len(), "unknown label");
        self.jump_targets.try_reserve(1)?;
        self.jump_targets.push(label);
        self.emit(
            opcode,
            Operand::None,
            Default::default(),
            Payload::Label(label),
        )
    }

    /// Unconditional jump
    pub fn jump(&mut self, label: LabelId) -> Result<OpId, Error> {
        self.emit_jump(Opcode::Jump, label)
    }

    /// Jumps if the zero flag is set
    pub fn jump_if_zero(&mut self, label: LabelId) -> Result<OpId, Error> {
        self.emit_jump(Opcode::JumpIfZero, label)
    }

    /// Jumps if the zero flag is clear
    pub fn jump_if_not_zero(&mut self, label: LabelId) -> Result<OpId, Error> {
        self.emit_jump(Opcode::JumpIfNotZero, label)
    }

    /// Returns from the compiled function
    pub fn ret(&mut self) -> Result<OpId, Error> {
        self.emit(
            Opcode::Return,
            Operand::None,
            Default::default(),
            Payload::None,
        )
    }

    /// Seals the program, dividing it into spans and mapping variables
    ///
    /// A trailing [`Opcode::Return`] is appended if the program does not
    /// already end with one.  Calling this more than once has no further
    /// effect.
    ///
    /// # Panics
    /// If a jump targets a label that was never placed
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.finished {
            return Ok(());
        }
        if self.state != FlowState::Main {
            return Err(Error::UnmergedFlow);
        }
        for l in &self.jump_targets {
            assert!(
                self.labels[l.index()],
                "label {} is never placed",
                l.index()
            );
        }
        let ends_in_return = self
            .seq
            .last()
            .is_some_and(|id| self.ops[id.index()].opcode == Opcode::Return);
        if !ends_in_return {
            self.ret()?;
        }

        self.spans.clear();
        let mut first = 0;
        for (i, id) in self.seq.iter().enumerate() {
            let op = &mut self.ops[id.index()];
            op.order = i as u32;
            op.span = self.spans.len() as u32;
            if op.is_control() {
                self.spans.try_reserve(1)?;
                self.spans.push(Span {
                    first,
                    last: i + 1,
                    ..Span::default()
                });
                first = i + 1;
            }
        }

        let vars = self.seq.iter().flat_map(|id| {
            let op = &self.ops[id.index()];
            op.operands.iter().chain([&op.result]).filter_map(Operand::var)
        });
        self.mapper = Mapper::new(self.var_count as usize, vars);
        self.finished = true;
        Ok(())
    }

    /// Checks whether [`Program::finish`] has been called
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of operators in the active flow
    pub fn len(&self) -> usize {
        self.seq.len()
    }

    /// Checks whether the active flow is empty
    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    /// Operator ids of the active flow, in their current order
    pub fn sequence(&self) -> &[OpId] {
        &self.seq
    }

    /// Looks up an operator by id
    pub fn op(&self, id: OpId) -> &Operator {
        &self.ops[id.index()]
    }

    /// Mutable access to an operator, e.g. to add flags
    pub fn op_mut(&mut self, id: OpId) -> &mut Operator {
        &mut self.ops[id.index()]
    }

    /// Iterates over operators of the active flow, in their current order
    pub fn iter(&self) -> impl Iterator<Item = &Operator> + '_ {
        self.seq.iter().map(|id| &self.ops[id.index()])
    }

    /// Span table, populated by [`Program::finish`]
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Variable-to-slot mapping, populated by [`Program::finish`]
    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    /// Iterates over operators which depend on the given one
    pub fn dependents(&self, id: OpId) -> impl Iterator<Item = OpId> + '_ {
        self.hooks.iter(self.ops[id.index()].dependents)
    }

    /// Iterates over the moves attached to an operator, in execution order
    pub fn shuffles(&self, id: OpId) -> impl Iterator<Item = &Shuffle> + '_ {
        self.ops[id.index()]
            .shuffles
            .iter()
            .map(|s| &self.shuffles[s.0 as usize])
    }

    /// Attaches a move to the end of an operator's shuffle list
    pub(crate) fn attach_shuffle(
        &mut self,
        id: OpId,
        s: Shuffle,
    ) -> Result<ShuffleId, Error> {
        let sid = ShuffleId(
            u32::try_from(self.shuffles.len())
                .map_err(|_| Error::OutOfMemory)?,
        );
        self.shuffles.try_reserve(1)?;
        self.shuffles.push(s);
        let list = &mut self.ops[id.index()].shuffles;
        list.try_reserve(1)?;
        list.push(sid);
        Ok(sid)
    }

    pub(crate) fn shuffle(&self, s: ShuffleId) -> &Shuffle {
        &self.shuffles[s.0 as usize]
    }

    /// Recycles every dependency edge, so that analysis can run again
    pub fn reset_graph(&mut self) {
        for id in &self.seq {
            let op = &mut self.ops[id.index()];
            self.hooks.recycle_list(op.dependents.take());
            op.blockers = 0;
            op.chain_size = 1;
            op.height = 1;
        }
        for s in &mut self.spans {
            s.longest_chain_size = 0;
            s.variety = 0;
        }
    }
}
