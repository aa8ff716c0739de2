//! Ilex Core
//!
//! Shared bytecode foundation for the Ilex compiler and virtual machine:
//! the opcode set, compiled chunks with their constant pools and line
//! tables, and the function prototypes the compiler produces.
//!
//! This crate is deliberately free of any heap or interpreter state so
//! that compilation output is plain, address-independent data: compiling
//! the same source twice yields byte-identical chunks.

pub mod chunk;
pub mod function;

pub use chunk::{Chunk, Constant, OpCode};
pub use function::{AccessLevel, ClassKind, CompiledFunction, FunctionKind};

/// Interpreter version reported by `ilex -v`.
pub const ILEX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date reported by `ilex -i`.
pub const ILEX_DATE: &str = "2026";

/// Process exit codes used by the CLI driver.
pub mod exit_code {
    /// Command line usage error.
    pub const USAGE: i32 = 64;
    /// Out of memory.
    pub const OOM: i32 = 69;
    /// Input file could not be read.
    pub const IO: i32 = 74;
    /// An `assert` in user code failed.
    pub const ASSERT: i32 = 97;
    /// The source did not compile.
    pub const COMPILE: i32 = 99;
    /// User code executed `panic!`.
    pub const PANIC: i32 = 112;
    /// The interpreter raised a runtime error.
    pub const RUNTIME: i32 = 114;
}
