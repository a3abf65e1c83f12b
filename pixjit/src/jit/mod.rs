//! Compilation down to native machine code
//!
//! [`compile`] runs every pass on a [`Program`], then assembles it into an
//! executable [`JitFunction`].
//!
//! ```no_run
//! use pixjit::{
//!     abi,
//!     config::Options,
//!     jit::compile,
//!     program::{Constant, MemRef, Opcode, Program},
//! };
//!
//! let mut p = Program::new();
//! let x = p.splat_gpr(abi::X)?;
//! let half = p.load_const(Constant::splat(0.5))?;
//! let v = p.binary(Opcode::MulPs, x, half)?;
//! p.store_mem(MemRef::base(abi::OUT, 0), v)?;
//!
//! let f = compile(p, &Options::default())?;
//! let mut out = [0f32; 4];
//! unsafe {
//!     f.call(std::ptr::null(), 3, 0, 1, out.as_mut_ptr() as *mut u8);
//! }
//! assert_eq!(out, [1.5; 4]);
//! # Ok::<(), pixjit::Error>(())
//! ```
use std::ops::Range;

use log::{debug, log_enabled, trace, Level};

use crate::{
    config::Options,
    passes::{self, PassStats},
    program::{Payload, Program},
    Error,
};

mod frame;
mod listing;
mod mmap;
mod pool;

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(not(target_arch = "x86_64"))]
compile_error!(
    "The `jit` module only builds on x86_64; \
    please disable the `jit` feature"
);

pub use frame::{reservation_plan, FrameStep, PAGE_SIZE};

use frame::Frame;
use mmap::Mmap;
use pool::Pools;
use x86_64::ProgramAssembler;

/// Native entry point
///
/// Arguments are passed in the registers named in [`crate::abi`].
type EntryPoint =
    unsafe extern "sysv64" fn(*const u8, i32, i32, u32, *mut u8);

/// Summary of a single compilation
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Work done by the compiler passes
    pub passes: PassStats,
    /// Number of spans
    pub spans: usize,
    /// Bytes of machine code, excluding literal pools
    pub code_len: usize,
    /// Bytes of literal pools, including alignment padding
    pub pool_len: usize,
    /// Bytes of stack reserved for variables
    pub frame_size: usize,
}

/// Handle owning a compiled function
///
/// The memory map is read-only and executable, so the function can be
/// shared between threads and called concurrently.
pub struct JitFunction {
    mmap: Mmap,
    code_len: usize,
    ops: Vec<(String, Range<usize>)>,
    stats: CompileStats,
}

static_assertions::assert_impl_all!(JitFunction: Send, Sync);

impl JitFunction {
    /// Calls the compiled function
    ///
    /// # Safety
    /// The compiled program's memory operators must only reach memory which
    /// is valid for the given `state` and `out` pointers (and `count`).
    /// The host must support AVX.
    pub unsafe fn call(
        &self,
        state: *const u8,
        x: i32,
        y: i32,
        count: u32,
        out: *mut u8,
    ) {
        debug_assert!(self.mmap.is_executable());
        let f: EntryPoint =
            unsafe { std::mem::transmute(self.mmap.as_ptr()) };
        unsafe { f(state, x, y, count, out) }
    }

    /// Returns the machine code, excluding literal pools
    pub fn code(&self) -> &[u8] {
        &self.mmap.as_slice()[..self.code_len]
    }

    /// Returns the code and literal pools, exactly as mapped
    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_slice()
    }

    /// Returns statistics about the compilation
    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// Disassembles the code, operator by operator
    pub fn listing(&self) -> String {
        listing::listing(self.code(), &self.ops)
    }
}

/// Compiles a program into native code
///
/// The program is finished (if needed), analyzed, scheduled, placed, and
/// bubbled according to `opts`, then assembled in two passes.
pub fn compile(
    mut program: Program,
    opts: &Options,
) -> Result<JitFunction, Error> {
    let passes = passes::run(&mut program, opts)?;

    let frame = Frame::new(&program);
    if frame.size > opts.max_frame_size {
        return Err(Error::FrameTooLarge(frame.size, opts.max_frame_size));
    }

    let mut pools = Pools::default();
    for op in program.iter() {
        if let Payload::Const(c) = op.payload {
            pools.intern(c);
        }
    }

    // The first pass measures, the second pass resolves literals
    let first = ProgramAssembler::new(&program, &frame, &pools, None).run()?;
    let layout = pools.layout(first.code.len())?;
    let second =
        ProgramAssembler::new(&program, &frame, &pools, Some(&layout)).run()?;
    if second.code.len() != first.code.len() {
        return Err(Error::LayoutMismatch(
            first.code.len(),
            second.code.len(),
        ));
    }

    let code_len = second.code.len();
    let mut code = second.code;
    pools.write(&layout, &mut code);

    let mut mmap = Mmap::from_bytes(&code)?;
    mmap.make_executable()?;

    let ops = second
        .ranges
        .into_iter()
        .map(|(id, r)| (listing::describe(program.op(id)), r))
        .collect();
    let stats = CompileStats {
        passes,
        spans: program.spans().len(),
        code_len,
        pool_len: layout.end - code_len,
        frame_size: frame.size,
    };
    debug!(
        "compiled {} operators into {} bytes of code, {} bytes of literals \
         ({} distinct), and a {} byte frame",
        program.len(),
        stats.code_len,
        stats.pool_len,
        pools.len(),
        stats.frame_size,
    );
    let out = JitFunction {
        mmap,
        code_len,
        ops,
        stats,
    };
    if log_enabled!(Level::Trace) {
        trace!("{}", out.listing());
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::{Constant, Gpr, MemRef, Opcode};

    fn sample() -> Program {
        let mut p = Program::new();
        let a = p.load_const(Constant::splat(1.0)).unwrap();
        let b = p.load_const(Constant::vector([1.0, 2.0, 3.0, 4.0])).unwrap();
        let c = p.binary(Opcode::AddPs, a, b).unwrap();
        p.store_mem(MemRef::base(Gpr::R8, 0), c).unwrap();
        p
    }

    #[test]
    fn test_compile() {
        let f = compile(sample(), &Options::default()).unwrap();
        let stats = *f.stats();
        assert_eq!(stats.spans, 1);
        assert_eq!(stats.frame_size, 48);
        assert_eq!(stats.code_len, f.code().len());
        assert_eq!(f.bytes().len(), stats.code_len + stats.pool_len);

        // 16-byte pool first, then the 4-byte pool
        let base = stats.code_len.next_multiple_of(16);
        assert_eq!(f.bytes().len(), base + 16 + 4);
        assert_eq!(&f.bytes()[base..base + 4], &1.0f32.to_le_bytes());
        assert_eq!(&f.bytes()[base + 16..], &1.0f32.to_le_bytes());

        let text = f.listing();
        assert!(text.starts_with("; prologue\n  000000  push rbp\n"));
        assert!(text.contains("; [v2] = add_ps [v0], [v1]\n"));
        assert!(text.contains("vaddps"));
        assert!(text.trim_end().ends_with("ret"));
    }

    #[test]
    fn test_frame_too_large() {
        let opts = Options {
            max_frame_size: 32,
            ..Options::default()
        };
        assert!(matches!(
            compile(sample(), &opts),
            Err(Error::FrameTooLarge(48, 32))
        ));
    }

    #[test]
    fn test_unmerged_flow() {
        let mut p = sample();
        p.split_flow();
        assert!(matches!(
            compile(p, &Options::default()),
            Err(Error::UnmergedFlow)
        ));
    }

    #[test]
    fn test_large_frame_prologue() {
        // 257 variables need 4112 bytes of stack, so the prologue reserves
        // and touches the first page before reserving the rest
        let mut p = Program::new();
        let mut acc = p.load_const(Constant::splat(0.0)).unwrap();
        for _ in 0..256 {
            acc = p.binary(Opcode::AddPs, acc, acc).unwrap();
        }
        p.store_mem(MemRef::base(Gpr::R8, 0), acc).unwrap();
        let f = compile(p, &Options::default()).unwrap();
        assert_eq!(f.stats().frame_size, 257 * 16);

        let text = f.listing();
        let prologue: Vec<_> = text
            .lines()
            .skip(1)
            .take_while(|line| !line.starts_with(';'))
            .map(|line| line.trim_start().split_once("  ").unwrap().1)
            .collect();
        assert_eq!(
            prologue,
            vec![
                "push rbp",
                "mov rbp,rsp",
                "sub rsp,1000h",
                "test [rsp],rsp",
                "sub rsp,10h",
                "and rsp,0FFFFFFFFFFFFFFF0h",
                "test [rsp],rsp",
            ]
        );
    }
}
