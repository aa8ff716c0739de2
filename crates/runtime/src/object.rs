//! Heap object model
//!
//! Every heap value starts with an `ObjHeader` carrying its type tag,
//! the GC mark bit and the intrusive next-pointer of the allocator's
//! global object list. `#[repr(C)]` keeps the header at offset zero so
//! a header pointer can be cast to the concrete object type and back.
//!
//! `Gc<T>` is a copyable raw handle. Objects live until a sweep proves
//! them unreachable, so handles held from rooted structures are always
//! valid; holding one across an allocation requires rooting it first
//! (push it on the VM stack), since any allocation may collect.

use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::rc::Rc;

use ilex_core::{ClassKind, CompiledFunction};

use crate::map::{ValueMap, ValueSet};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Host callback signature for native functions. For type methods the
/// receiver is passed as `args[0]`. An `Err` message means the native
/// failed; the interpreter reports it as a runtime error and unwinds.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// Factory for a builtin library; returns the library's script value.
pub type BuiltInLib = fn(&mut Vm) -> Result<Value, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    BoundMethod,
    Class,
    Closure,
    Function,
    Instance,
    Script,
    Native,
    String,
    Upvalue,
    Enum,
    Array,
    File,
    Map,
    Set,
}

#[repr(C)]
#[derive(Debug)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub marked: bool,
    pub next: Option<NonNull<ObjHeader>>,
}

impl ObjHeader {
    pub fn new(kind: ObjKind) -> Self {
        ObjHeader {
            kind,
            marked: false,
            next: None,
        }
    }
}

/// Copyable raw handle to a GC-owned object.
pub struct Gc<T> {
    ptr: NonNull<T>,
}

impl<T> Gc<T> {
    /// # Safety
    /// `ptr` must point to a live heap object owned by the collector.
    pub unsafe fn from_non_null(ptr: NonNull<T>) -> Self {
        Gc { ptr }
    }

    pub fn as_ptr(self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(self) -> NonNull<T> {
        self.ptr
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Gc<T> {}

impl<T> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gc({:p})", self.ptr.as_ptr())
    }
}

/// Implemented by every concrete object type; ties the type to its kind
/// tag so values and the dispatcher can cast header pointers safely.
pub trait GcObject {
    const KIND: ObjKind;
    fn header(&self) -> &ObjHeader;
    fn header_mut(&mut self) -> &mut ObjHeader;
}

macro_rules! gc_object {
    ($ty:ty, $kind:expr) => {
        impl GcObject for $ty {
            const KIND: ObjKind = $kind;
            fn header(&self) -> &ObjHeader {
                &self.header
            }
            fn header_mut(&mut self) -> &mut ObjHeader {
                &mut self.header
            }
        }
    };
}

/// Interned, immutable string with its precomputed FNV-1a hash.
#[repr(C)]
#[derive(Debug)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u32,
    pub chars: String,
}
gc_object!(ObjString, ObjKind::String);

impl ObjString {
    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

/// A function prototype materialized for execution: the compiler's plain
/// constants are resolved into live values (strings interned) exactly
/// once, and the owning script is attached.
#[repr(C)]
#[derive(Debug)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub proto: Rc<CompiledFunction>,
    /// Number and string constants as values; function constants stay in
    /// the prototype and are materialized by OP_CLOSURE.
    pub constants: Vec<Value>,
    pub name: Option<Gc<ObjString>>,
    pub script: Gc<ObjScript>,
}
gc_object!(ObjFunction, ObjKind::Function);

#[repr(C)]
#[derive(Debug)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub function: NativeFn,
}
gc_object!(ObjNative, ObjKind::Native);

/// Captured variable. Open upvalues watch a live operand-stack slot (by
/// index, so stack growth never invalidates them) and chain together in
/// descending slot order; closing copies the value inline.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[repr(C)]
#[derive(Debug)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: UpvalueState,
    pub next: Option<Gc<ObjUpvalue>>,
}
gc_object!(ObjUpvalue, ObjKind::Upvalue);

#[repr(C)]
#[derive(Debug)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: Gc<ObjFunction>,
    pub upvalues: Vec<Gc<ObjUpvalue>>,
}
gc_object!(ObjClosure, ObjKind::Closure);

#[repr(C)]
#[derive(Debug)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: Gc<ObjString>,
    pub super_class: Option<Gc<ObjClass>>,
    pub kind: ClassKind,
    pub methods: Table,
    pub abstract_methods: Table,
    pub private_methods: Table,
    /// Instance-field initial values, copied into each new instance.
    pub fields: Table,
    pub private_fields: Table,
    pub static_vars: Table,
    pub static_consts: Table,
}
gc_object!(ObjClass, ObjKind::Class);

#[repr(C)]
#[derive(Debug)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: Gc<ObjClass>,
    pub fields: Table,
    pub private_fields: Table,
}
gc_object!(ObjInstance, ObjKind::Instance);

#[repr(C)]
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: Gc<ObjClosure>,
}
gc_object!(ObjBoundMethod, ObjKind::BoundMethod);

#[repr(C)]
#[derive(Debug)]
pub struct ObjEnum {
    pub header: ObjHeader,
    pub name: Gc<ObjString>,
    pub values: Table,
}
gc_object!(ObjEnum, ObjKind::Enum);

#[repr(C)]
#[derive(Debug)]
pub struct ObjArray {
    pub header: ObjHeader,
    pub data: Vec<Value>,
}
gc_object!(ObjArray, ObjKind::Array);

#[repr(C)]
#[derive(Debug)]
pub struct ObjMap {
    pub header: ObjHeader,
    pub data: ValueMap,
}
gc_object!(ObjMap, ObjKind::Map);

#[repr(C)]
#[derive(Debug)]
pub struct ObjSet {
    pub header: ObjHeader,
    pub data: ValueSet,
}
gc_object!(ObjSet, ObjKind::Set);

/// An open file handle; `None` once closed by `OP_CLOSE_FILE`.
#[repr(C)]
#[derive(Debug)]
pub struct ObjFile {
    pub header: ObjHeader,
    pub file: Option<File>,
    pub path: String,
    pub flags: String,
}
gc_object!(ObjFile, ObjKind::File);

/// An importable source unit: its resolved identity, the directory
/// sibling imports resolve against, and its exported bindings.
#[repr(C)]
#[derive(Debug)]
pub struct ObjScript {
    pub header: ObjHeader,
    pub name: Gc<ObjString>,
    /// Directory of the script, for resolving its `use` statements.
    pub path: Gc<ObjString>,
    pub values: Table,
    /// Set once the script has been executed; cache hits re-use it.
    pub used: bool,
}
gc_object!(ObjScript, ObjKind::Script);

/// Typed view of an object header, for dispatch by kind.
#[derive(Debug, Clone, Copy)]
pub enum ObjRef {
    String(Gc<ObjString>),
    Function(Gc<ObjFunction>),
    Native(Gc<ObjNative>),
    Upvalue(Gc<ObjUpvalue>),
    Closure(Gc<ObjClosure>),
    Class(Gc<ObjClass>),
    Instance(Gc<ObjInstance>),
    BoundMethod(Gc<ObjBoundMethod>),
    Enum(Gc<ObjEnum>),
    Array(Gc<ObjArray>),
    Map(Gc<ObjMap>),
    Set(Gc<ObjSet>),
    File(Gc<ObjFile>),
    Script(Gc<ObjScript>),
}

impl ObjRef {
    /// # Safety
    /// `header` must point at a live object allocated by the heap.
    pub unsafe fn from_header(header: NonNull<ObjHeader>) -> ObjRef {
        unsafe {
            let kind = header.as_ref().kind;
            match kind {
                ObjKind::String => ObjRef::String(Gc::from_non_null(header.cast())),
                ObjKind::Function => ObjRef::Function(Gc::from_non_null(header.cast())),
                ObjKind::Native => ObjRef::Native(Gc::from_non_null(header.cast())),
                ObjKind::Upvalue => ObjRef::Upvalue(Gc::from_non_null(header.cast())),
                ObjKind::Closure => ObjRef::Closure(Gc::from_non_null(header.cast())),
                ObjKind::Class => ObjRef::Class(Gc::from_non_null(header.cast())),
                ObjKind::Instance => ObjRef::Instance(Gc::from_non_null(header.cast())),
                ObjKind::BoundMethod => ObjRef::BoundMethod(Gc::from_non_null(header.cast())),
                ObjKind::Enum => ObjRef::Enum(Gc::from_non_null(header.cast())),
                ObjKind::Array => ObjRef::Array(Gc::from_non_null(header.cast())),
                ObjKind::Map => ObjRef::Map(Gc::from_non_null(header.cast())),
                ObjKind::Set => ObjRef::Set(Gc::from_non_null(header.cast())),
                ObjKind::File => ObjRef::File(Gc::from_non_null(header.cast())),
                ObjKind::Script => ObjRef::Script(Gc::from_non_null(header.cast())),
            }
        }
    }

    pub fn kind(self) -> ObjKind {
        match self {
            ObjRef::String(_) => ObjKind::String,
            ObjRef::Function(_) => ObjKind::Function,
            ObjRef::Native(_) => ObjKind::Native,
            ObjRef::Upvalue(_) => ObjKind::Upvalue,
            ObjRef::Closure(_) => ObjKind::Closure,
            ObjRef::Class(_) => ObjKind::Class,
            ObjRef::Instance(_) => ObjKind::Instance,
            ObjRef::BoundMethod(_) => ObjKind::BoundMethod,
            ObjRef::Enum(_) => ObjKind::Enum,
            ObjRef::Array(_) => ObjKind::Array,
            ObjRef::Map(_) => ObjKind::Map,
            ObjRef::Set(_) => ObjKind::Set,
            ObjRef::File(_) => ObjKind::File,
            ObjRef::Script(_) => ObjKind::Script,
        }
    }

    pub fn header_ptr(self) -> NonNull<ObjHeader> {
        match self {
            ObjRef::String(o) => o.as_non_null().cast(),
            ObjRef::Function(o) => o.as_non_null().cast(),
            ObjRef::Native(o) => o.as_non_null().cast(),
            ObjRef::Upvalue(o) => o.as_non_null().cast(),
            ObjRef::Closure(o) => o.as_non_null().cast(),
            ObjRef::Class(o) => o.as_non_null().cast(),
            ObjRef::Instance(o) => o.as_non_null().cast(),
            ObjRef::BoundMethod(o) => o.as_non_null().cast(),
            ObjRef::Enum(o) => o.as_non_null().cast(),
            ObjRef::Array(o) => o.as_non_null().cast(),
            ObjRef::Map(o) => o.as_non_null().cast(),
            ObjRef::Set(o) => o.as_non_null().cast(),
            ObjRef::File(o) => o.as_non_null().cast(),
            ObjRef::Script(o) => o.as_non_null().cast(),
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            ObjRef::String(_) => "string",
            ObjRef::Function(_) | ObjRef::Closure(_) => "function",
            ObjRef::Native(_) => "native function",
            ObjRef::Upvalue(_) => "upvalue",
            ObjRef::Class(_) => "class",
            ObjRef::Instance(_) => "instance",
            ObjRef::BoundMethod(_) => "bound method",
            ObjRef::Enum(_) => "enum",
            ObjRef::Array(_) => "array",
            ObjRef::Map(_) => "map",
            ObjRef::Set(_) => "set",
            ObjRef::File(_) => "file",
            ObjRef::Script(_) => "script",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_at_offset_zero() {
        assert_eq!(std::mem::offset_of!(ObjString, header), 0);
        assert_eq!(std::mem::offset_of!(ObjFunction, header), 0);
        assert_eq!(std::mem::offset_of!(ObjClosure, header), 0);
        assert_eq!(std::mem::offset_of!(ObjClass, header), 0);
        assert_eq!(std::mem::offset_of!(ObjInstance, header), 0);
        assert_eq!(std::mem::offset_of!(ObjArray, header), 0);
        assert_eq!(std::mem::offset_of!(ObjScript, header), 0);
    }

    #[test]
    fn obj_ref_roundtrips_through_header() {
        let mut boxed = Box::new(ObjString {
            header: ObjHeader::new(ObjKind::String),
            hash: 0,
            chars: "x".to_string(),
        });
        let header = NonNull::from(boxed.header_mut());
        let obj = unsafe { ObjRef::from_header(header.cast()) };
        assert_eq!(obj.kind(), ObjKind::String);
        match obj {
            ObjRef::String(s) => assert_eq!(s.as_str(), "x"),
            _ => panic!("wrong variant"),
        }
    }
}
