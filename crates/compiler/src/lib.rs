//! Ilex Compiler
//!
//! Lexer and single-pass Pratt compiler for the Ilex language. Source
//! goes in, a [`CompiledFunction`](ilex_core::CompiledFunction) prototype
//! comes out; there is no AST stage and no coupling to the runtime heap.
//!
//! ```rust
//! use ilex_compiler::{compile, CompilerOptions};
//!
//! let function = compile("var x = 1 + 2;", &CompilerOptions::default()).unwrap();
//! assert!(!function.chunk.code.is_empty());
//! ```

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod token;

pub use compiler::{compile, Compiler, CompilerOptions};
pub use error::CompileError;
pub use lexer::Lexer;
pub use token::{Token, TokenKind};
