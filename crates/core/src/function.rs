//! Compiled-function prototypes
//!
//! The compiler produces a tree of `CompiledFunction`s (nested functions
//! live in their parent's constant pool). Prototypes are immutable plain
//! data; the VM wraps them in heap function objects at closure-creation
//! time.

use std::rc::Rc;

use num_enum::TryFromPrimitive;

use crate::chunk::Chunk;

/// What kind of callable a prototype is. Drives `this` binding, implicit
/// returns (`init` returns its receiver) and static-dispatch checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    Static,
    Abstract,
}

/// Visibility of a class member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Public,
    Private,
}

/// Kind byte carried by `OP_CLASS` / `OP_INHERIT`.
///
/// Only default classes can be instantiated; abstract classes exist to be
/// inherited from, static classes are namespaces of static members.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ClassKind {
    Default,
    Abstract,
    Static,
}

/// The output of compiling one function body (or a whole script).
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    /// Required parameter count.
    pub arity: u8,
    /// Optional (defaulted) parameter count.
    pub arity_default: u8,
    /// Number of upvalues captured by closures over this function.
    pub upvalue_count: u16,
    pub kind: FunctionKind,
    pub access: AccessLevel,
    /// Qualified name; empty for the top-level script function.
    pub name: Rc<str>,
    pub chunk: Chunk,
}

impl CompiledFunction {
    pub fn new(kind: FunctionKind, name: Rc<str>) -> Self {
        CompiledFunction {
            arity: 0,
            arity_default: 0,
            upvalue_count: 0,
            kind,
            access: AccessLevel::Public,
            name,
            chunk: Chunk::new(),
        }
    }

    /// True for the synthetic function wrapping top-level script code.
    pub fn is_script(&self) -> bool {
        self.kind == FunctionKind::Script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_kind_byte_roundtrip() {
        for kind in [ClassKind::Default, ClassKind::Abstract, ClassKind::Static] {
            assert_eq!(ClassKind::try_from(kind as u8).unwrap(), kind);
        }
        assert!(ClassKind::try_from(9).is_err());
    }

    #[test]
    fn new_prototype_is_empty() {
        let f = CompiledFunction::new(FunctionKind::Script, "".into());
        assert!(f.is_script());
        assert_eq!(f.arity, 0);
        assert!(f.chunk.code.is_empty());
    }
}
