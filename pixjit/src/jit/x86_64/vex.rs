//! VEX encodings for the regular vector opcodes
//!
//! Every regular (unary or binary) opcode maps to a single 128-bit VEX
//! instruction of the form `op dst, src1, src2`, with `src1` in `VEX.vvvv`
//! and `src2` in `ModRM.rm`.  Unary opcodes leave `vvvv` unused.
use crate::program::Opcode;
use strum::EnumCount;

/// How an opcode is turned into machine code
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Three-byte VEX prefix, opcode byte, and register-direct ModRM
    Vex {
        /// Implied legacy prefix (`0 = none, 1 = 66, 2 = F3, 3 = F2`)
        pp: u8,
        /// Opcode map (`1 = 0F, 2 = 0F38, 3 = 0F3A`)
        map: u8,
        /// Opcode byte
        opcode: u8,
        /// `VEX.W`
        w: bool,
    },
    /// Emitted by hand in the assembler
    Custom,
    /// Not available on the baseline target
    Unimplemented,
}

const fn vex(pp: u8, map: u8, opcode: u8) -> Encoding {
    Encoding::Vex {
        pp,
        map,
        opcode,
        w: false,
    }
}

/// Encoding table, indexed by opcode discriminant
pub static ENCODINGS: [(Opcode, Encoding); Opcode::COUNT] = [
    (Opcode::AddPs, vex(0, 1, 0x58)),
    (Opcode::SubPs, vex(0, 1, 0x5C)),
    (Opcode::MulPs, vex(0, 1, 0x59)),
    (Opcode::DivPs, vex(0, 1, 0x5E)),
    (Opcode::MinPs, vex(0, 1, 0x5D)),
    (Opcode::MaxPs, vex(0, 1, 0x5F)),
    (Opcode::AndPs, vex(0, 1, 0x54)),
    (Opcode::AndNotPs, vex(0, 1, 0x55)),
    (Opcode::OrPs, vex(0, 1, 0x56)),
    (Opcode::XorPs, vex(0, 1, 0x57)),
    (Opcode::UnpackLoPs, vex(0, 1, 0x14)),
    (Opcode::MoveLowHighPs, vex(0, 1, 0x16)),
    (Opcode::AddI32, vex(1, 1, 0xFE)),
    (Opcode::SubI32, vex(1, 1, 0xFA)),
    (Opcode::MulI32, vex(1, 2, 0x40)),
    (Opcode::Copy, vex(0, 1, 0x28)),
    (Opcode::SqrtPs, vex(0, 1, 0x51)),
    (Opcode::RcpPs, vex(0, 1, 0x53)),
    (Opcode::RsqrtPs, vex(0, 1, 0x52)),
    (Opcode::CvtI32ToPs, vex(0, 1, 0x5B)),
    (Opcode::CvtPsToI32, vex(2, 1, 0x5B)),
    // Fused multiply-add needs FMA3, which is not implied by AVX
    (Opcode::MulAddPs, Encoding::Unimplemented),
    (Opcode::LoadConst, Encoding::Custom),
    (Opcode::LoadMem, Encoding::Custom),
    (Opcode::SplatGpr, Encoding::Custom),
    (Opcode::AddGprImm, Encoding::Custom),
    (Opcode::DecGpr, Encoding::Custom),
    (Opcode::TestGpr, Encoding::Custom),
    (Opcode::StoreMem, Encoding::Custom),
    (Opcode::Label, Encoding::Custom),
    (Opcode::Jump, Encoding::Custom),
    (Opcode::JumpIfZero, Encoding::Custom),
    (Opcode::JumpIfNotZero, Encoding::Custom),
    (Opcode::Return, Encoding::Custom),
];

/// Looks up the encoding of an opcode
pub fn encoding(op: Opcode) -> Encoding {
    let (o, e) = ENCODINGS[op as usize];
    debug_assert_eq!(o, op);
    e
}

/// Builds a three-byte VEX prefix
///
/// `reg` and `rm` supply the high bits of the ModRM fields; `vvvv` is the
/// (un-inverted) extra source register, or 0 if unused.
fn vex3(pp: u8, map: u8, w: bool, reg: u8, rm: u8, vvvv: u8) -> [u8; 3] {
    let r = (!reg >> 3) & 1;
    let b = (!rm >> 3) & 1;
    [
        0xC4,
        (r << 7) | (1 << 6) | (b << 5) | (map & 0x1F),
        (u8::from(w) << 7) | ((!vvvv & 0xF) << 3) | (pp & 0x3),
    ]
}

/// Encodes a register-to-register instruction
///
/// # Panics
/// If `enc` is not [`Encoding::Vex`]
pub fn encode_rr(enc: Encoding, dst: u8, src1: u8, src2: u8) -> [u8; 5] {
    let Encoding::Vex { pp, map, opcode, w } = enc else {
        panic!("cannot encode {enc:?} as a VEX instruction");
    };
    let [c4, p1, p2] = vex3(pp, map, w, dst, src2, src1);
    [c4, p1, p2, opcode, 0xC0 | ((dst & 7) << 3) | (src2 & 7)]
}

/// Width of a pooled literal load
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstLoad {
    /// `vbroadcastss xmm, [rip + disp]`
    Broadcast4,
    /// `vmovddup xmm, [rip + disp]`
    Broadcast8,
    /// `vmovaps xmm, [rip + disp]`
    Full16,
}

/// Length of every instruction built by [`encode_rip_load`]
pub const RIP_LOAD_LEN: usize = 9;

/// Encodes a RIP-relative literal load
///
/// `disp` is relative to the end of the instruction.
pub fn encode_rip_load(
    kind: ConstLoad,
    dst: u8,
    disp: i32,
) -> [u8; RIP_LOAD_LEN] {
    let (pp, map, opcode) = match kind {
        ConstLoad::Broadcast4 => (1, 2, 0x18),
        ConstLoad::Broadcast8 => (3, 1, 0x12),
        ConstLoad::Full16 => (0, 1, 0x28),
    };
    let [c4, p1, p2] = vex3(pp, map, false, dst, 0, 0);
    let d = disp.to_le_bytes();
    [c4, p1, p2, opcode, ((dst & 7) << 3) | 0b101, d[0], d[1], d[2], d[3]]
}

#[cfg(test)]
mod test {
    use super::*;
    use iced_x86::{
        Decoder, DecoderOptions, Formatter, IntelFormatter, Mnemonic, Register,
    };
    use strum::IntoEnumIterator;

    fn disasm(bytes: &[u8]) -> String {
        let mut decoder = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
        let instr = decoder.decode();
        assert!(!instr.is_invalid(), "invalid encoding {bytes:02x?}");
        assert_eq!(instr.len(), bytes.len());
        let mut out = String::new();
        IntelFormatter::new().format(&instr, &mut out);
        out
    }

    #[test]
    fn test_table_order() {
        for op in Opcode::iter() {
            assert_eq!(ENCODINGS[op as usize].0, op);
        }
    }

    #[test]
    fn test_binary() {
        let cases = [
            (Opcode::AddPs, "vaddps xmm1,xmm2,xmm3"),
            (Opcode::AndNotPs, "vandnps xmm1,xmm2,xmm3"),
            (Opcode::UnpackLoPs, "vunpcklps xmm1,xmm2,xmm3"),
            (Opcode::MoveLowHighPs, "vmovlhps xmm1,xmm2,xmm3"),
            (Opcode::AddI32, "vpaddd xmm1,xmm2,xmm3"),
            (Opcode::MulI32, "vpmulld xmm1,xmm2,xmm3"),
        ];
        for (op, text) in cases {
            assert_eq!(disasm(&encode_rr(encoding(op), 1, 2, 3)), text);
        }
        // Extended registers in every position
        assert_eq!(
            disasm(&encode_rr(encoding(Opcode::MaxPs), 9, 14, 15)),
            "vmaxps xmm9,xmm14,xmm15"
        );
    }

    #[test]
    fn test_unary() {
        let cases = [
            (Opcode::Copy, "vmovaps xmm12,xmm3"),
            (Opcode::SqrtPs, "vsqrtps xmm12,xmm3"),
            (Opcode::RsqrtPs, "vrsqrtps xmm12,xmm3"),
            (Opcode::CvtI32ToPs, "vcvtdq2ps xmm12,xmm3"),
            (Opcode::CvtPsToI32, "vcvttps2dq xmm12,xmm3"),
        ];
        for (op, text) in cases {
            assert_eq!(disasm(&encode_rr(encoding(op), 12, 0, 3)), text);
        }
    }

    #[test]
    fn test_rip_loads() {
        let cases = [
            (ConstLoad::Full16, 10, 0x20, Mnemonic::Vmovaps, Register::XMM10),
            (ConstLoad::Broadcast8, 2, -4, Mnemonic::Vmovddup, Register::XMM2),
            (
                ConstLoad::Broadcast4,
                15,
                7,
                Mnemonic::Vbroadcastss,
                Register::XMM15,
            ),
        ];
        for (kind, dst, disp, mnemonic, reg) in cases {
            let bytes = encode_rip_load(kind, dst, disp);
            let mut decoder =
                Decoder::with_ip(64, &bytes, 0x1000, DecoderOptions::NONE);
            let instr = decoder.decode();
            assert_eq!(instr.len(), RIP_LOAD_LEN);
            assert_eq!(instr.mnemonic(), mnemonic);
            assert_eq!(instr.op0_register(), reg);
            assert!(instr.is_ip_rel_memory_operand());
            assert_eq!(
                instr.ip_rel_memory_address() as i64,
                0x1000 + RIP_LOAD_LEN as i64 + disp as i64
            );
        }
    }
}
