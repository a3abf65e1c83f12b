//! Operator-by-operator disassembly
use std::fmt::Write;
use std::ops::Range;

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::program::{Operand, Operator, Payload};

/// Describes an operator in a single line, e.g. `[v2] = add_ps [v0], [v1]`
pub fn describe(op: &Operator) -> String {
    let mut out = String::new();
    if let Some(loc) = op.result.location() {
        write!(&mut out, "{loc} = ").unwrap();
    }
    write!(&mut out, "{}", op.opcode).unwrap();
    let mut sep = " ";
    for loc in op.operands.iter().filter_map(Operand::location) {
        write!(&mut out, "{sep}{loc}").unwrap();
        sep = ", ";
    }
    match op.payload {
        Payload::None => (),
        Payload::Const(c) => write!(&mut out, "{sep}{c:x?}").unwrap(),
        Payload::Mem(m) => write!(&mut out, " @ {:+}", m.disp).unwrap(),
        Payload::Imm(i) => write!(&mut out, "{sep}{i}").unwrap(),
        Payload::Label(l) => write!(&mut out, "{sep}L{}", l.index()).unwrap(),
    }
    out
}

/// Disassembles `code`, grouping instructions under operator headers
///
/// `ops` pairs each header with the byte range of its instructions; bytes
/// outside every range (the prologue) are listed first.
pub fn listing(code: &[u8], ops: &[(String, Range<usize>)]) -> String {
    let mut out = String::new();
    let mut fmt = IntelFormatter::new();
    let mut text = String::new();
    let mut dump = |out: &mut String, range: Range<usize>| {
        let mut decoder = Decoder::with_ip(
            64,
            &code[range.clone()],
            range.start as u64,
            DecoderOptions::NONE,
        );
        for instr in &mut decoder {
            text.clear();
            fmt.format(&instr, &mut text);
            writeln!(out, "  {:06x}  {text}", instr.ip()).unwrap();
        }
    };
    let prologue = ops.first().map(|(_, r)| r.start).unwrap_or(code.len());
    writeln!(&mut out, "; prologue").unwrap();
    dump(&mut out, 0..prologue);
    for (header, range) in ops {
        writeln!(&mut out, "; {header}").unwrap();
        dump(&mut out, range.clone());
    }
    out
}
