//! Operators and their operands
use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter, IntoStaticStr};

use crate::program::{hook::HookId, shuffle::ShuffleId};

/// Index of an operator within a [`Program`](super::Program)'s arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) u32);

impl OpId {
    /// Returns the arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbolic variable, backed by a 16-byte slot in the stack frame
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub(crate) u32);

impl VarId {
    /// Returns the variable index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Jump target, placed with
/// [`Program::place_label`](super::Program::place_label)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LabelId(pub(crate) u32);

impl LabelId {
    /// Returns the label index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// General-purpose register, numbered by its hardware encoding
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Gpr {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Gpr {
    /// Hardware register number
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Checks whether the callee must preserve this register
    pub fn is_callee_saved(self) -> bool {
        matches!(self, Gpr::Rbx | Gpr::R12 | Gpr::R13 | Gpr::R14 | Gpr::R15)
    }

    /// Checks whether the register is owned by the stack frame
    pub fn is_reserved(self) -> bool {
        matches!(self, Gpr::Rsp | Gpr::Rbp)
    }
}

/// Physical register
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reg {
    /// General-purpose register
    Gpr(Gpr),
    /// Vector register `xmm0-15`
    Xmm(u8),
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reg::Gpr(g) => write!(f, "{}", <&'static str>::from(*g)),
            Reg::Xmm(i) => write!(f, "xmm{i}"),
        }
    }
}

/// A storage location which an operator or move reads or writes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// Physical register
    Reg(Reg),
    /// Stack-frame slot of a variable
    Var(VarId),
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Reg(r) => write!(f, "{r}"),
            Location::Var(v) => write!(f, "[{v}]"),
        }
    }
}

/// Operand reference of an operator
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Unused operand slot
    #[default]
    None,
    /// Physical register
    Reg(Reg),
    /// Symbolic variable
    Var(VarId),
}

impl Operand {
    /// Returns the location referenced by this operand, if any
    pub fn location(&self) -> Option<Location> {
        match *self {
            Operand::None => None,
            Operand::Reg(r) => Some(Location::Reg(r)),
            Operand::Var(v) => Some(Location::Var(v)),
        }
    }

    /// Returns the variable referenced by this operand, if any
    pub fn var(&self) -> Option<VarId> {
        match *self {
            Operand::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl From<VarId> for Operand {
    fn from(v: VarId) -> Self {
        Operand::Var(v)
    }
}

impl From<Gpr> for Operand {
    fn from(g: Gpr) -> Self {
        Operand::Reg(Reg::Gpr(g))
    }
}

/// Index scale in a [`MemRef`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Scale {
    X1 = 1,
    X2 = 2,
    X4 = 4,
    X8 = 8,
}

/// How an operator reaches memory outside the private stack frame
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Only registers and frame slots are touched
    Private,
    /// `[base + disp]`
    Base,
    /// `[base + index * scale + disp]`
    Indexed(Scale),
}

/// Reference to memory outside the stack frame
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemRef {
    /// Base register
    pub base: Gpr,
    /// Optional scaled index register
    pub index: Option<(Gpr, Scale)>,
    /// Byte displacement
    pub disp: i32,
}

impl MemRef {
    /// Builds a `[base + disp]` reference
    pub fn base(base: Gpr, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    /// Builds a `[base + index * scale + disp]` reference
    pub fn indexed(base: Gpr, index: Gpr, scale: Scale, disp: i32) -> Self {
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }

    /// Returns the addressing mode
    pub fn kind(&self) -> RefKind {
        match self.index {
            None => RefKind::Base,
            Some((_, s)) => RefKind::Indexed(s),
        }
    }
}

/// Literal loaded by [`Opcode::LoadConst`]
///
/// Narrow constants are broadcast across all four lanes when loaded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    /// 32-bit pattern, broadcast to every lane
    Four(u32),
    /// 64-bit pattern, broadcast to both halves
    Eight(u64),
    /// Full 128-bit vector
    Sixteen([u32; 4]),
}

impl Constant {
    /// Broadcasts a single `f32` to every lane
    pub fn splat(f: f32) -> Self {
        Constant::Four(f.to_bits())
    }

    /// Builds a vector from four `f32` lanes
    pub fn vector(v: [f32; 4]) -> Self {
        Constant::Sixteen(v.map(f32::to_bits))
    }

    /// Width of the pooled literal, in bytes
    pub fn width(&self) -> usize {
        match self {
            Constant::Four(..) => 4,
            Constant::Eight(..) => 8,
            Constant::Sixteen(..) => 16,
        }
    }
}

/// Extra data carried by some opcodes
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum Payload {
    /// No extra data
    #[default]
    None,
    /// Literal for [`Opcode::LoadConst`]
    Const(Constant),
    /// Memory reference for [`Opcode::LoadMem`] and [`Opcode::StoreMem`]
    Mem(MemRef),
    /// Immediate for [`Opcode::AddGprImm`]
    Imm(i32),
    /// Target of a label or jump
    Label(LabelId),
}

/// Broad classification, used to dispatch code generation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// `out = op(arg)` on vector registers
    Unary,
    /// `out = op(lhs, rhs)` on vector registers
    Binary,
    /// `out = op(a, b, c)` on vector registers
    Ternary,
    /// Anything with a bespoke encoding
    Irregular,
    /// Writes a vector register to outside memory
    MemDst,
    /// Labels, jumps, and returns
    Control,
}

/// Operation performed by an [`Operator`]
///
/// Vector opcodes treat every variable as four lanes of `f32` (or `i32` for
/// the `*I32` opcodes).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumCount, EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    /// Lane-wise addition
    AddPs,
    /// Lane-wise subtraction
    SubPs,
    /// Lane-wise multiplication
    MulPs,
    /// Lane-wise division
    DivPs,
    /// Lane-wise minimum
    MinPs,
    /// Lane-wise maximum
    MaxPs,
    /// Bitwise and
    AndPs,
    /// Bitwise `!lhs & rhs`
    AndNotPs,
    /// Bitwise or
    OrPs,
    /// Bitwise exclusive or
    XorPs,
    /// Interleaves the low halves: `[l0, r0, l1, r1]`
    UnpackLoPs,
    /// Joins the low halves: `[l0, l1, r0, r1]`
    MoveLowHighPs,
    /// Lane-wise integer addition
    AddI32,
    /// Lane-wise integer subtraction
    SubI32,
    /// Lane-wise integer multiplication (low 32 bits)
    MulI32,

    /// Register copy
    Copy,
    /// Lane-wise square root
    SqrtPs,
    /// Approximate reciprocal
    RcpPs,
    /// Approximate reciprocal square root
    RsqrtPs,
    /// Integer to float conversion
    CvtI32ToPs,
    /// Float to integer conversion, truncating
    CvtPsToI32,

    /// Fused `a * b + c`
    MulAddPs,

    /// Loads a pooled literal
    LoadConst,
    /// Loads 16 bytes from outside memory
    LoadMem,
    /// Converts a 32-bit integer register to `f32` and broadcasts it
    SplatGpr,
    /// Adds an immediate to a general-purpose register
    AddGprImm,
    /// Decrements the low 32 bits of a register, setting the zero flag
    DecGpr,
    /// Tests the low 32 bits of a register against zero
    TestGpr,

    /// Stores 16 bytes to outside memory
    StoreMem,

    /// Jump target
    Label,
    /// Unconditional jump
    Jump,
    /// Jumps if the zero flag is set
    JumpIfZero,
    /// Jumps if the zero flag is clear
    JumpIfNotZero,
    /// Function epilogue
    Return,
}

impl Opcode {
    /// Returns the dispatch class of this opcode
    pub fn class(self) -> OpClass {
        use Opcode::*;
        match self {
            AddPs | SubPs | MulPs | DivPs | MinPs | MaxPs | AndPs
            | AndNotPs | OrPs | XorPs | UnpackLoPs | MoveLowHighPs | AddI32
            | SubI32 | MulI32 => OpClass::Binary,
            Copy | SqrtPs | RcpPs | RsqrtPs | CvtI32ToPs | CvtPsToI32 => {
                OpClass::Unary
            }
            MulAddPs => OpClass::Ternary,
            LoadConst | LoadMem | SplatGpr | AddGprImm | DecGpr | TestGpr => {
                OpClass::Irregular
            }
            StoreMem => OpClass::MemDst,
            Label | Jump | JumpIfZero | JumpIfNotZero | Return => {
                OpClass::Control
            }
        }
    }

    /// Flags that every operator with this opcode carries
    pub fn default_flags(self) -> OpFlags {
        use Opcode::*;
        match self {
            AddGprImm | DecGpr | TestGpr => {
                OpFlags::CHANGES_ZF | OpFlags::CALCULATES_ZF
            }
            LoadMem => OpFlags::USES_AVX | OpFlags::HAS_OUTSIDE_DEPENDENCY,
            StoreMem => OpFlags::USES_AVX | OpFlags::HAS_OUTSIDE_EFFECT,
            Label | Jump | Return => OpFlags::IS_CONTROL | OpFlags::NO_BUBBLE,
            JumpIfZero | JumpIfNotZero => {
                OpFlags::IS_CONTROL
                    | OpFlags::NO_BUBBLE
                    | OpFlags::CONSUMES_ZF
            }
            _ => OpFlags::USES_AVX,
        }
    }
}

bitflags! {
    /// Classification flags of an operator
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OpFlags: u16 {
        /// Transfers control or marks a jump target; ends a span
        const IS_CONTROL = 1 << 0;
        /// Reads the zero flag
        const CONSUMES_ZF = 1 << 1;
        /// Clobbers the zero flag
        const CHANGES_ZF = 1 << 2;
        /// Sets the zero flag to a meaningful value
        const CALCULATES_ZF = 1 << 3;
        /// Reads state that lives outside the stack frame
        const HAS_OUTSIDE_DEPENDENCY = 1 << 4;
        /// Writes state that lives outside the stack frame
        const HAS_OUTSIDE_EFFECT = 1 << 5;
        /// Moves may not be hoisted across this operator
        const NO_BUBBLE = 1 << 6;
        /// Emits VEX-encoded instructions (requires `vzeroupper` on exit)
        const USES_AVX = 1 << 7;
    }
}

/// One IR instruction
#[derive(Clone, Debug)]
pub struct Operator {
    /// Operation performed
    pub opcode: Opcode,
    /// Up to three source operands
    pub operands: [Operand; 3],
    /// Destination operand
    pub result: Operand,
    /// Classification flags
    pub flags: OpFlags,
    /// Opcode-specific data
    pub payload: Payload,

    /// Position in the owning flow (before scheduling) or program
    pub(crate) order: u32,
    /// Index of the span containing this operator
    pub(crate) span: u32,
    /// Number of predecessors which have not been scheduled yet
    pub(crate) blockers: u32,
    /// Head of the list of operators which must follow this one
    pub(crate) dependents: Option<HookId>,
    /// Longest dependency chain ending at this operator
    pub(crate) chain_size: u32,
    /// Longest dependency chain starting at this operator
    pub(crate) height: u32,
    /// Moves performed immediately before this operator, in order
    pub(crate) shuffles: Vec<ShuffleId>,
    /// Vector registers placed for each operand (`0..3`) and the result (`3`)
    pub(crate) placed: [Option<u8>; 4],
}

impl Operator {
    /// Builds a new operator, applying the opcode's default flags
    ///
    /// Memory payloads also add their base and index registers as operands,
    /// so they must leave the corresponding operand slots unused.
    ///
    /// # Panics
    /// If a memory payload addresses through `rsp` or `rbp`
    pub fn new(
        opcode: Opcode,
        result: Operand,
        operands: [Operand; 3],
        payload: Payload,
    ) -> Self {
        let mut operands = operands;
        if let Payload::Mem(m) = payload {
            assert!(!m.base.is_reserved(), "{:?} is reserved", m.base);
            if let Some((index, _)) = m.index {
                assert!(!index.is_reserved(), "{index:?} is reserved");
            }
            let Some(slot) =
                operands.iter().position(|o| *o == Operand::None)
            else {
                panic!("no operand slot for memory base");
            };
            operands[slot] = m.base.into();
            if let Some((index, _)) = m.index {
                let slot = slot + 1;
                assert!(
                    slot < operands.len() && operands[slot] == Operand::None,
                    "no operand slot for memory index"
                );
                operands[slot] = index.into();
            }
        }
        Self {
            opcode,
            operands,
            result,
            flags: opcode.default_flags(),
            payload,

            order: 0,
            span: 0,
            blockers: 0,
            dependents: None,
            chain_size: 1,
            height: 1,
            shuffles: vec![],
            placed: [None; 4],
        }
    }

    /// Adds extra flags (e.g. [`OpFlags::NO_BUBBLE`])
    pub fn with_flags(mut self, flags: OpFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Position of this operator (its final position, once scheduled)
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Index of the span containing this operator
    pub fn span(&self) -> u32 {
        self.span
    }

    /// Longest dependency chain ending at this operator
    pub fn chain_size(&self) -> u32 {
        self.chain_size
    }

    /// Checks whether this operator is a control operator
    pub fn is_control(&self) -> bool {
        self.flags.contains(OpFlags::IS_CONTROL)
    }

    /// Returns how this operator reaches outside memory
    pub fn ref_kind(&self) -> RefKind {
        match self.payload {
            Payload::Mem(m) => m.kind(),
            _ => RefKind::Private,
        }
    }

    /// Checks whether this operator must stay ordered with other operators
    /// that reach outside the stack frame
    pub fn touches_outside(&self) -> bool {
        self.ref_kind() != RefKind::Private
            || self.flags.intersects(
                OpFlags::HAS_OUTSIDE_DEPENDENCY | OpFlags::HAS_OUTSIDE_EFFECT,
            )
    }

    /// Checks whether this operator reads or clobbers the zero flag
    pub fn touches_flags(&self) -> bool {
        self.flags
            .intersects(OpFlags::CHANGES_ZF | OpFlags::CALCULATES_ZF)
    }

    /// Iterates over locations read by this operator
    pub fn reads(&self) -> impl Iterator<Item = Location> + '_ {
        self.operands.iter().filter_map(Operand::location)
    }

    /// Iterates over locations written by this operator
    pub fn writes(&self) -> impl Iterator<Item = Location> + '_ {
        self.result.location().into_iter()
    }

    /// Vector register placed for the given operand slot
    ///
    /// # Panics
    /// If register placement has not run, or the slot holds no variable
    pub fn operand_reg(&self, i: usize) -> u8 {
        self.placed[i].unwrap_or_else(|| {
            panic!("operand {i} of {} is not placed", self.opcode)
        })
    }

    /// Vector register placed for the result
    ///
    /// # Panics
    /// If register placement has not run, or the result is not a variable
    pub fn result_reg(&self) -> u8 {
        self.placed[3].unwrap_or_else(|| {
            panic!("result of {} is not placed", self.opcode)
        })
    }

    /// Locations that a move must not write when crossing this operator
    pub(crate) fn declared(&self) -> impl Iterator<Item = Location> + '_ {
        self.reads()
            .chain(self.writes())
            .chain(
                self.placed
                    .iter()
                    .flatten()
                    .map(|r| Location::Reg(Reg::Xmm(*r))),
            )
    }

    /// Locations written by the emitted instruction, including placed
    /// registers
    pub(crate) fn clobbers(&self) -> impl Iterator<Item = Location> + '_ {
        self.writes()
            .chain(self.placed[3].map(|r| Location::Reg(Reg::Xmm(r))))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_memref_operands() {
        let v = VarId(0);
        let op = Operator::new(
            Opcode::StoreMem,
            Operand::None,
            [v.into(), Operand::None, Operand::None],
            Payload::Mem(MemRef::indexed(Gpr::R8, Gpr::Rax, Scale::X4, 16)),
        );
        let reads: Vec<_> = op.reads().collect();
        assert_eq!(
            reads,
            vec![
                Location::Var(v),
                Location::Reg(Reg::Gpr(Gpr::R8)),
                Location::Reg(Reg::Gpr(Gpr::Rax)),
            ]
        );
        assert_eq!(op.ref_kind(), RefKind::Indexed(Scale::X4));
        assert!(op.touches_outside());
        assert!(op.writes().next().is_none());
    }

    #[test]
    fn test_control_flags() {
        for op in Opcode::iter() {
            let f = op.default_flags();
            assert_eq!(
                op.class() == OpClass::Control,
                f.contains(OpFlags::IS_CONTROL),
                "{op}"
            );
            if f.contains(OpFlags::CALCULATES_ZF) {
                assert!(f.contains(OpFlags::CHANGES_ZF), "{op}");
            }
        }
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(Opcode::AddPs.to_string(), "add_ps");
        assert_eq!(Opcode::JumpIfNotZero.to_string(), "jump_if_not_zero");
        assert_eq!(Reg::Gpr(Gpr::R8).to_string(), "r8");
        assert_eq!(Location::Var(VarId(3)).to_string(), "[v3]");
    }
}
