//! `pixjit` is a scheduling assembler for per-pixel vector programs.
//!
//! A front end describes a small program (an effect applied to a run of
//! pixels) as a graph of operators on 128-bit vector variables, plus a few
//! general-purpose register and control-flow operators for the pixel loop.
//! The compiler then
//!
//! - divides the program into **spans** (straight-line runs, each ending in
//!   a control operator),
//! - builds a dependency graph within each span, covering data, flag, and
//!   outside-memory hazards,
//! - reorders each span with a list scheduler,
//! - places variables in vector registers, inserting moves to and from their
//!   stack slots,
//! - hoists those moves as early as hazards allow ("bubbling"),
//! - and assembles the result in two passes, with literal pools after the
//!   code.
//!
//! # Building a program
//! Programs are built with methods on [`Program`](crate::program::Program),
//! which return fresh variables:
//! ```
//! use pixjit::program::{Constant, MemRef, Opcode, Program};
//! use pixjit::abi;
//!
//! let mut p = Program::new();
//! let x = p.splat_gpr(abi::X)?;
//! let scale = p.load_const(Constant::splat(0.25))?;
//! let v = p.binary(Opcode::MulPs, x, scale)?;
//! p.store_mem(MemRef::base(abi::OUT, 0), v)?;
//! # Ok::<(), pixjit::Error>(())
//! ```
//!
//! Independent chains of work can be written as parallel
//! [flows](crate::program::Program::split_flow), which are concatenated when
//! merged; the scheduler is then free to interleave them.
//!
//! # Compiling
//! The [`passes`] can be run individually (which is useful for inspecting
//! the schedule), but most users will call [`jit::compile`], which runs them
//! all and returns a callable function:
//! ```
//! # use pixjit::program::{Constant, Program};
//! use pixjit::{config::Options, passes};
//!
//! let mut p = Program::new();
//! p.load_const(Constant::splat(1.0))?;
//! let stats = passes::run(&mut p, &Options::default())?;
//! assert_eq!(stats.placement.loads, 0);
//! # Ok::<(), pixjit::Error>(())
//! ```
//!
//! # Feature flags
//! - `jit` (enabled by default): native code generation in the [`jit`]
//!   module.  Only `x86_64` targets are supported.
#![warn(missing_docs)]

mod error;
pub use error::Error;

pub mod config;
pub mod passes;
pub mod program;

#[cfg(feature = "jit")]
pub mod jit;

/// Registers holding the arguments of a compiled function
///
/// Compiled functions have the signature
/// `extern "sysv64" fn(state, x, y, count, out)`; each argument arrives in
/// the register named here.  Programs may read and modify these registers
/// freely (e.g. advancing [`OUT`] and decrementing [`COUNT`] in a loop).
pub mod abi {
    use crate::program::Gpr;

    /// Pointer to read-only effect state
    pub const STATE: Gpr = Gpr::Rdi;
    /// Horizontal position of the first pixel
    pub const X: Gpr = Gpr::Rsi;
    /// Vertical position of the row
    pub const Y: Gpr = Gpr::Rdx;
    /// Number of pixels to process
    pub const COUNT: Gpr = Gpr::Rcx;
    /// Pointer to the output pixels (16 bytes each)
    pub const OUT: Gpr = Gpr::R8;
}
