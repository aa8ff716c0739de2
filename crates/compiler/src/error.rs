//! Compile-error collection.

use std::fmt;

/// All diagnostics produced by one compilation.
///
/// The compiler keeps parsing after the first error (with panic-mode
/// recovery at statement boundaries), so a single run can report several
/// messages.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub messages: Vec<String>,
}

impl CompileError {
    pub fn new(messages: Vec<String>) -> Self {
        CompileError { messages }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, message) in self.messages.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}
