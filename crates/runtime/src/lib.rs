//! Ilex Runtime
//!
//! The Ilex virtual machine: NaN-boxed values, a garbage-collected
//! object heap with an interned string pool, the bytecode interpreter,
//! the module loader, and the native extension interface.
//!
//! ```rust
//! use ilex_runtime::{Vm, VmOptions};
//!
//! let mut vm = Vm::new(VmOptions::default());
//! vm.interpret("demo", "var x = 1 + 2; assert(x == 3);").unwrap();
//! ```

pub mod config;
pub mod error;
pub mod heap;
pub mod map;
pub mod natives;
pub mod object;
pub mod table;
pub mod value;
pub mod vm;

pub use config::VmOptions;
pub use error::VmError;
pub use natives::TypeTable;
pub use object::{BuiltInLib, Gc, GcObject, NativeFn, ObjScript};
pub use value::Value;
pub use vm::Vm;
