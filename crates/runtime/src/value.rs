//! NaN-Boxed Values
//!
//! An Ilex value is a single 64-bit word. Any bit pattern that is a
//! valid (non-signalling-NaN) IEEE 754 double is itself a number; the
//! quiet-NaN space encodes everything else:
//!
//! ```text
//! number:  [any double whose bits don't match the QNAN pattern]
//! null:    QNAN | 1
//! false:   QNAN | 2
//! true:    QNAN | 3
//! empty:   QNAN | 4      (open slice bound / "no value")
//! object:  SIGN | QNAN | 48-bit pointer to an ObjHeader
//! ```

use std::ptr::NonNull;

use crate::object::{
    Gc, GcObject, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjEnum, ObjFile, ObjFunction,
    ObjHeader, ObjInstance, ObjKind, ObjMap, ObjNative, ObjRef, ObjScript, ObjSet, ObjString,
    ObjUpvalue,
};

const QNAN: u64 = 0x7ffc_0000_0000_0000;
const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

const TAG_NULL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;
const TAG_EMPTY: u64 = 4;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value(u64);

impl Value {
    pub const NULL: Value = Value(QNAN | TAG_NULL);
    pub const FALSE: Value = Value(QNAN | TAG_FALSE);
    pub const TRUE: Value = Value(QNAN | TAG_TRUE);
    /// Sentinel for "no value": open slice bounds and `OP_EMPTY`.
    pub const EMPTY: Value = Value(QNAN | TAG_EMPTY);

    #[inline(always)]
    pub fn number(n: f64) -> Value {
        Value(n.to_bits())
    }

    #[inline(always)]
    pub fn boolean(b: bool) -> Value {
        if b { Value::TRUE } else { Value::FALSE }
    }

    #[inline(always)]
    pub fn object<T: GcObject>(obj: Gc<T>) -> Value {
        Value(SIGN_BIT | QNAN | obj.as_ptr() as u64)
    }

    #[inline(always)]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    #[inline(always)]
    pub fn is_number(self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    #[inline(always)]
    pub fn is_bool(self) -> bool {
        (self.0 | 1) == Value::TRUE.0
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self == Value::NULL
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self == Value::EMPTY
    }

    #[inline(always)]
    pub fn is_obj(self) -> bool {
        (self.0 & (QNAN | SIGN_BIT)) == (QNAN | SIGN_BIT)
    }

    /// A value is falsy iff it is null, false, or the empty sentinel.
    #[inline(always)]
    pub fn is_falsy(self) -> bool {
        self == Value::NULL || self == Value::FALSE || self == Value::EMPTY
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline(always)]
    pub fn as_number(self) -> f64 {
        debug_assert!(self.is_number(), "as_number() on a non-number value");
        f64::from_bits(self.0)
    }

    #[inline(always)]
    pub fn as_bool(self) -> bool {
        debug_assert!(self.is_bool(), "as_bool() on a non-bool value");
        self == Value::TRUE
    }

    #[inline(always)]
    pub fn as_obj(self) -> ObjRef {
        debug_assert!(self.is_obj(), "as_obj() on a non-object value");
        let ptr = (self.0 & !(SIGN_BIT | QNAN)) as *mut ObjHeader;
        unsafe { ObjRef::from_header(NonNull::new_unchecked(ptr)) }
    }

    pub fn obj_kind(self) -> Option<ObjKind> {
        if self.is_obj() {
            Some(self.as_obj().kind())
        } else {
            None
        }
    }

    pub fn as_string(self) -> Option<Gc<ObjString>> {
        match self.obj() {
            Some(ObjRef::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(self) -> Option<Gc<ObjFunction>> {
        match self.obj() {
            Some(ObjRef::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn as_closure(self) -> Option<Gc<ObjClosure>> {
        match self.obj() {
            Some(ObjRef::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn as_native(self) -> Option<Gc<ObjNative>> {
        match self.obj() {
            Some(ObjRef::Native(n)) => Some(n),
            _ => None,
        }
    }

    pub fn as_upvalue(self) -> Option<Gc<ObjUpvalue>> {
        match self.obj() {
            Some(ObjRef::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn as_class(self) -> Option<Gc<ObjClass>> {
        match self.obj() {
            Some(ObjRef::Class(c)) => Some(c),
            _ => None,
        }
    }

    pub fn as_instance(self) -> Option<Gc<ObjInstance>> {
        match self.obj() {
            Some(ObjRef::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn as_bound_method(self) -> Option<Gc<ObjBoundMethod>> {
        match self.obj() {
            Some(ObjRef::BoundMethod(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_enum(self) -> Option<Gc<ObjEnum>> {
        match self.obj() {
            Some(ObjRef::Enum(e)) => Some(e),
            _ => None,
        }
    }

    pub fn as_array(self) -> Option<Gc<ObjArray>> {
        match self.obj() {
            Some(ObjRef::Array(a)) => Some(a),
            _ => None,
        }
    }

    pub fn as_map(self) -> Option<Gc<ObjMap>> {
        match self.obj() {
            Some(ObjRef::Map(m)) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(self) -> Option<Gc<ObjSet>> {
        match self.obj() {
            Some(ObjRef::Set(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_file(self) -> Option<Gc<ObjFile>> {
        match self.obj() {
            Some(ObjRef::File(f)) => Some(f),
            _ => None,
        }
    }

    pub fn as_script(self) -> Option<Gc<ObjScript>> {
        match self.obj() {
            Some(ObjRef::Script(s)) => Some(s),
            _ => None,
        }
    }

    fn obj(self) -> Option<ObjRef> {
        if self.is_obj() {
            Some(self.as_obj())
        } else {
            None
        }
    }

    // =========================================================================
    // Semantics
    // =========================================================================

    /// Numbers compare by IEEE equality; everything else by identity.
    /// Interned strings make identity coincide with content equality.
    pub fn equals(self, other: Value) -> bool {
        if self.is_number() && other.is_number() {
            return self.as_number() == other.as_number();
        }
        self.0 == other.0
    }

    /// Map/set keys must be strings or finite numbers.
    pub fn is_valid_key(self) -> bool {
        if self.is_number() {
            return self.as_number().is_finite();
        }
        self.as_string().is_some()
    }

    /// Content hash for map/set keys. Strings use their interned hash.
    pub fn key_hash(self) -> u32 {
        if let Some(s) = self.as_string() {
            return s.hash;
        }
        if self.is_number() {
            let bits = self.0;
            return (bits ^ (bits >> 32)) as u32;
        }
        0
    }

    pub fn type_name(self) -> &'static str {
        if self.is_bool() {
            "bool"
        } else if self.is_number() {
            "number"
        } else if self.is_null() {
            "null"
        } else if self.is_empty() {
            "empty"
        } else {
            self.as_obj().type_name()
        }
    }

    /// Printable form, as `println` shows it.
    pub fn display(self) -> String {
        if self.is_bool() {
            return if self.as_bool() { "true" } else { "false" }.to_string();
        }
        if self.is_null() {
            return "null".to_string();
        }
        if self.is_empty() {
            return "empty".to_string();
        }
        if self.is_number() {
            return number_to_string(self.as_number());
        }
        object_to_string(self.as_obj())
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Integral doubles print without a fractional part, like `%.15g`.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    format!("{n}")
}

fn object_to_string(obj: ObjRef) -> String {
    match obj {
        ObjRef::String(s) => s.chars.clone(),
        ObjRef::Function(f) => match f.name {
            Some(name) => format!("<fn {}>", name.as_str()),
            None => "<script>".to_string(),
        },
        ObjRef::Closure(c) => match c.function.name {
            Some(name) => format!("<fn {}>", name.as_str()),
            None => "<script>".to_string(),
        },
        ObjRef::Native(_) => "<native fn>".to_string(),
        ObjRef::Upvalue(_) => "<upvalue>".to_string(),
        ObjRef::Class(c) => format!("<class {}>", c.name.as_str()),
        ObjRef::Instance(i) => format!("<{} instance>", i.class.name.as_str()),
        ObjRef::BoundMethod(b) => match b.method.function.name {
            Some(name) => format!("<fn {}>", name.as_str()),
            None => "<fn>".to_string(),
        },
        ObjRef::Enum(e) => format!("<enum {}>", e.name.as_str()),
        ObjRef::Array(a) => {
            let items: Vec<String> = a.data.iter().map(|v| quoted(*v)).collect();
            format!("[{}]", items.join(", "))
        }
        ObjRef::Map(m) => {
            let items: Vec<String> = m
                .data
                .iter()
                .map(|(k, v)| format!("{}: {}", quoted(k), quoted(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        ObjRef::Set(s) => {
            let items: Vec<String> = s.data.iter().map(quoted).collect();
            format!("{{{}}}", items.join(", "))
        }
        ObjRef::File(f) => format!("<file {}>", f.path),
        ObjRef::Script(s) => format!("<script {}>", s.name.as_str()),
    }
}

// Strings nested inside containers print quoted.
fn quoted(v: Value) -> String {
    match v.as_string() {
        Some(s) => format!("\"{}\"", s.as_str()),
        None => v.display(),
    }
}
