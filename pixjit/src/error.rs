//! Module containing the `pixjit` universal error type
use crate::program::Opcode;
use thiserror::Error;

/// Universal error type for `pixjit`
///
/// Any error aborts the whole compilation; callers are expected to fall back
/// to a non-JIT path rather than retry with the same [`Program`].
///
/// [`Program`]: crate::program::Program
#[derive(Error, Debug)]
pub enum Error {
    /// Allocation failed while growing an operator, hook, or shuffle array
    #[error("out of memory")]
    OutOfMemory,

    /// Compilation was requested while parallel flows were still split
    #[error("flows are still split; call `merge_flow` before compiling")]
    UnmergedFlow,

    /// The stack frame exceeds the configured limit
    #[error("stack frame of {0} bytes exceeds the limit of {1} bytes")]
    FrameTooLarge(usize, usize),

    /// Code plus literal pools exceed the reach of a 32-bit displacement
    #[error("literal pools end at {0} bytes, beyond 32-bit displacement range")]
    PoolOverflow(usize),

    /// The opcode has no encoding on this target
    #[error("opcode `{0}` has no encoding on this target")]
    Unimplemented(Opcode),

    /// The second assembly pass disagreed with the first about code size
    #[error("pass 1 measured {0} bytes, but pass 2 emitted {1} bytes")]
    LayoutMismatch(usize, usize),

    /// IO error; see inner code for details
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "jit")]
    /// Dynasm error; see inner code for details
    #[error("dynasm error")]
    DynasmError(#[from] dynasmrt::DynasmError),
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
