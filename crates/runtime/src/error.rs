//! Interpreter error kinds
//!
//! Four terminal error channels, each with its own exit code: compile
//! errors (surfaced before execution), runtime errors (with a stack
//! trace), failed assertions, and explicit panics. There is no
//! user-level exception mechanism; all four unwind the interpreter.

use std::fmt;

use ilex_core::exit_code;
use ilex_compiler::CompileError;

#[derive(Debug)]
pub enum VmError {
    Compile(CompileError),
    Runtime(String),
    Assert(String),
    Panic(String),
}

impl VmError {
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::Compile(_) => exit_code::COMPILE,
            VmError::Runtime(_) => exit_code::RUNTIME,
            VmError::Assert(_) => exit_code::ASSERT,
            VmError::Panic(_) => exit_code::PANIC,
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Compile(err) => write!(f, "{err}"),
            VmError::Runtime(msg) | VmError::Assert(msg) | VmError::Panic(msg) => {
                write!(f, "{msg}")
            }
        }
    }
}

impl std::error::Error for VmError {}

impl From<CompileError> for VmError {
    fn from(err: CompileError) -> Self {
        VmError::Compile(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_error_kinds() {
        assert_eq!(VmError::Runtime("x".into()).exit_code(), 114);
        assert_eq!(VmError::Assert("x".into()).exit_code(), 97);
        assert_eq!(VmError::Panic("x".into()).exit_code(), 112);
        assert_eq!(
            VmError::Compile(CompileError::new(vec![])).exit_code(),
            99
        );
    }
}
