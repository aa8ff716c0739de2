//! Object heap and garbage collector
//!
//! A non-moving tri-color mark-and-sweep collector. Objects are boxed,
//! leaked into an intrusive singly-linked list threaded through their
//! headers, and freed when a sweep finds their mark bit clear.
//!
//! The heap owns the mechanics (allocation, byte accounting, the gray
//! work list, tracing, the weak intern-pool sweep, the sweep itself);
//! the VM owns the root set and drives full collections. Any allocation
//! can trigger a collection, so callers must keep transient objects
//! reachable — the idiom is to push them onto the VM's operand stack
//! until they are linked into a rooted parent.

use std::fs::File;
use std::mem::size_of;
use std::ptr::NonNull;
use std::rc::Rc;

use ilex_core::{ClassKind, CompiledFunction};
use tracing::debug;

use crate::map::{ValueMap, ValueSet};
use crate::object::{
    Gc, GcObject, NativeFn, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjEnum, ObjFile,
    ObjFunction, ObjHeader, ObjInstance, ObjMap, ObjNative, ObjRef, ObjScript, ObjSet, ObjString,
    ObjUpvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_NEXT_MIN: usize = 1024 * 1024;

pub fn hash_string(chars: &str) -> u32 {
    // FNV-1a
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct Heap {
    head: Option<NonNull<ObjHeader>>,
    /// Weak intern pool: equal strings share one object, and unmarked
    /// entries are evicted between mark and sweep.
    pub strings: Table,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    gray: Vec<ObjRef>,
    pub gc_stress: bool,
    pub gc_log: bool,
    pub gc_runs: u64,
}

impl Heap {
    pub fn new(gc_stress: bool, gc_log: bool) -> Heap {
        Heap {
            head: None,
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: GC_NEXT_MIN,
            gray: Vec::new(),
            gc_stress,
            gc_log,
            gc_runs: 0,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.gc_stress || self.bytes_allocated > self.next_gc
    }

    fn track<T: GcObject>(&mut self, mut boxed: Box<T>, payload: usize) -> Gc<T> {
        self.bytes_allocated += size_of::<T>() + payload;
        boxed.header_mut().next = self.head;
        let ptr = NonNull::from(Box::leak(boxed));
        self.head = Some(ptr.cast());
        unsafe { Gc::from_non_null(ptr) }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Canonicalize a string: returns the existing object for equal
    /// bytes, so string equality degenerates to pointer equality.
    pub fn intern(&mut self, chars: &str) -> Gc<ObjString> {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }

        let payload = chars.len();
        let string = self.track(
            Box::new(ObjString {
                header: ObjHeader::new(ObjString::KIND),
                hash,
                chars: chars.to_string(),
            }),
            payload,
        );
        let _ = self.strings.set(string, Value::NULL, false);
        string
    }

    pub fn alloc_function(
        &mut self,
        proto: Rc<CompiledFunction>,
        constants: Vec<Value>,
        name: Option<Gc<ObjString>>,
        script: Gc<ObjScript>,
    ) -> Gc<ObjFunction> {
        self.track(
            Box::new(ObjFunction {
                header: ObjHeader::new(ObjFunction::KIND),
                proto,
                constants,
                name,
                script,
            }),
            0,
        )
    }

    pub fn alloc_native(&mut self, function: NativeFn) -> Gc<ObjNative> {
        self.track(
            Box::new(ObjNative {
                header: ObjHeader::new(ObjNative::KIND),
                function,
            }),
            0,
        )
    }

    pub fn alloc_closure(&mut self, function: Gc<ObjFunction>) -> Gc<ObjClosure> {
        self.track(
            Box::new(ObjClosure {
                header: ObjHeader::new(ObjClosure::KIND),
                function,
                upvalues: Vec::new(),
            }),
            0,
        )
    }

    pub fn alloc_upvalue(&mut self, state: UpvalueState) -> Gc<ObjUpvalue> {
        self.track(
            Box::new(ObjUpvalue {
                header: ObjHeader::new(ObjUpvalue::KIND),
                state,
                next: None,
            }),
            0,
        )
    }

    pub fn alloc_class(
        &mut self,
        name: Gc<ObjString>,
        super_class: Option<Gc<ObjClass>>,
        kind: ClassKind,
    ) -> Gc<ObjClass> {
        self.track(
            Box::new(ObjClass {
                header: ObjHeader::new(ObjClass::KIND),
                name,
                super_class,
                kind,
                methods: Table::new(),
                abstract_methods: Table::new(),
                private_methods: Table::new(),
                fields: Table::new(),
                private_fields: Table::new(),
                static_vars: Table::new(),
                static_consts: Table::new(),
            }),
            0,
        )
    }

    pub fn alloc_instance(&mut self, class: Gc<ObjClass>) -> Gc<ObjInstance> {
        self.track(
            Box::new(ObjInstance {
                header: ObjHeader::new(ObjInstance::KIND),
                class,
                fields: Table::new(),
                private_fields: Table::new(),
            }),
            0,
        )
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: Gc<ObjClosure>,
    ) -> Gc<ObjBoundMethod> {
        self.track(
            Box::new(ObjBoundMethod {
                header: ObjHeader::new(ObjBoundMethod::KIND),
                receiver,
                method,
            }),
            0,
        )
    }

    pub fn alloc_enum(&mut self, name: Gc<ObjString>) -> Gc<ObjEnum> {
        self.track(
            Box::new(ObjEnum {
                header: ObjHeader::new(ObjEnum::KIND),
                name,
                values: Table::new(),
            }),
            0,
        )
    }

    pub fn alloc_array(&mut self, data: Vec<Value>) -> Gc<ObjArray> {
        let payload = data.len() * size_of::<Value>();
        self.track(
            Box::new(ObjArray {
                header: ObjHeader::new(ObjArray::KIND),
                data,
            }),
            payload,
        )
    }

    pub fn alloc_map(&mut self) -> Gc<ObjMap> {
        self.track(
            Box::new(ObjMap {
                header: ObjHeader::new(ObjMap::KIND),
                data: ValueMap::new(),
            }),
            0,
        )
    }

    pub fn alloc_set(&mut self) -> Gc<ObjSet> {
        self.track(
            Box::new(ObjSet {
                header: ObjHeader::new(ObjSet::KIND),
                data: ValueSet::new(),
            }),
            0,
        )
    }

    pub fn alloc_file(&mut self, file: File, path: String, flags: String) -> Gc<ObjFile> {
        self.track(
            Box::new(ObjFile {
                header: ObjHeader::new(ObjFile::KIND),
                file: Some(file),
                path,
                flags,
            }),
            0,
        )
    }

    pub fn alloc_script(&mut self, name: Gc<ObjString>, path: Gc<ObjString>) -> Gc<ObjScript> {
        self.track(
            Box::new(ObjScript {
                header: ObjHeader::new(ObjScript::KIND),
                name,
                path,
                values: Table::new(),
                used: false,
            }),
            0,
        )
    }

    // =========================================================================
    // Mark phase
    // =========================================================================

    pub fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_obj());
        }
    }

    pub fn mark_object(&mut self, obj: ObjRef) {
        let mut header = obj.header_ptr();
        let header = unsafe { header.as_mut() };
        if header.marked {
            return;
        }
        header.marked = true;
        self.gray.push(obj);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value, _) in table.iter() {
            self.mark_object(ObjRef::String(key));
            self.mark_value(value);
        }
    }

    /// Darken every reachable object starting from the marked roots.
    pub fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        match obj {
            ObjRef::String(_) | ObjRef::Native(_) | ObjRef::File(_) => {}
            ObjRef::Function(f) => {
                for value in &f.constants {
                    self.mark_value(*value);
                }
                if let Some(name) = f.name {
                    self.mark_object(ObjRef::String(name));
                }
                self.mark_object(ObjRef::Script(f.script));
            }
            ObjRef::Upvalue(u) => {
                if let UpvalueState::Closed(value) = u.state {
                    self.mark_value(value);
                }
                if let Some(next) = u.next {
                    self.mark_object(ObjRef::Upvalue(next));
                }
            }
            ObjRef::Closure(c) => {
                self.mark_object(ObjRef::Function(c.function));
                for upvalue in &c.upvalues {
                    self.mark_object(ObjRef::Upvalue(*upvalue));
                }
            }
            ObjRef::Class(c) => {
                self.mark_object(ObjRef::String(c.name));
                if let Some(super_class) = c.super_class {
                    self.mark_object(ObjRef::Class(super_class));
                }
                self.mark_table(&c.methods);
                self.mark_table(&c.abstract_methods);
                self.mark_table(&c.private_methods);
                self.mark_table(&c.fields);
                self.mark_table(&c.private_fields);
                self.mark_table(&c.static_vars);
                self.mark_table(&c.static_consts);
            }
            ObjRef::Instance(i) => {
                self.mark_object(ObjRef::Class(i.class));
                self.mark_table(&i.fields);
                self.mark_table(&i.private_fields);
            }
            ObjRef::BoundMethod(b) => {
                self.mark_value(b.receiver);
                self.mark_object(ObjRef::Closure(b.method));
            }
            ObjRef::Enum(e) => {
                self.mark_object(ObjRef::String(e.name));
                self.mark_table(&e.values);
            }
            ObjRef::Array(a) => {
                for value in &a.data {
                    self.mark_value(*value);
                }
            }
            ObjRef::Map(m) => {
                for (key, value) in m.data.iter() {
                    self.mark_value(key);
                    self.mark_value(value);
                }
            }
            ObjRef::Set(s) => {
                for value in s.data.iter() {
                    self.mark_value(value);
                }
            }
            ObjRef::Script(s) => {
                self.mark_object(ObjRef::String(s.name));
                self.mark_object(ObjRef::String(s.path));
                self.mark_table(&s.values);
            }
        }
    }

    // =========================================================================
    // Sweep phase
    // =========================================================================

    /// Evict interned strings that did not survive the mark phase. Must
    /// run after tracing and before the sweep.
    pub fn remove_white_strings(&mut self) {
        self.strings.remove_white();
    }

    /// Free every unmarked object and clear the marks on survivors.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0usize;
        let mut prev: Option<NonNull<ObjHeader>> = None;
        let mut current = self.head;

        while let Some(mut ptr) = current {
            let header = unsafe { ptr.as_mut() };
            if header.marked {
                header.marked = false;
                prev = Some(ptr);
                current = header.next;
            } else {
                let next = header.next;
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = next },
                    None => self.head = next,
                }
                self.free_object(ptr);
                freed += 1;
                current = next;
            }
        }

        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_NEXT_MIN);
        self.gc_runs += 1;
        freed
    }

    fn free_object(&mut self, header: NonNull<ObjHeader>) {
        let obj = unsafe { ObjRef::from_header(header) };
        unsafe {
            match obj {
                ObjRef::String(s) => {
                    self.release(size_of::<ObjString>() + s.chars.len());
                    drop(Box::from_raw(s.as_ptr()));
                }
                ObjRef::Function(f) => {
                    self.release(size_of::<ObjFunction>());
                    drop(Box::from_raw(f.as_ptr()));
                }
                ObjRef::Native(n) => {
                    self.release(size_of::<ObjNative>());
                    drop(Box::from_raw(n.as_ptr()));
                }
                ObjRef::Upvalue(u) => {
                    self.release(size_of::<ObjUpvalue>());
                    drop(Box::from_raw(u.as_ptr()));
                }
                ObjRef::Closure(c) => {
                    self.release(size_of::<ObjClosure>());
                    drop(Box::from_raw(c.as_ptr()));
                }
                ObjRef::Class(c) => {
                    self.release(size_of::<ObjClass>());
                    drop(Box::from_raw(c.as_ptr()));
                }
                ObjRef::Instance(i) => {
                    self.release(size_of::<ObjInstance>());
                    drop(Box::from_raw(i.as_ptr()));
                }
                ObjRef::BoundMethod(b) => {
                    self.release(size_of::<ObjBoundMethod>());
                    drop(Box::from_raw(b.as_ptr()));
                }
                ObjRef::Enum(e) => {
                    self.release(size_of::<ObjEnum>());
                    drop(Box::from_raw(e.as_ptr()));
                }
                ObjRef::Array(a) => {
                    self.release(size_of::<ObjArray>());
                    drop(Box::from_raw(a.as_ptr()));
                }
                ObjRef::Map(m) => {
                    self.release(size_of::<ObjMap>());
                    drop(Box::from_raw(m.as_ptr()));
                }
                ObjRef::Set(s) => {
                    self.release(size_of::<ObjSet>());
                    drop(Box::from_raw(s.as_ptr()));
                }
                ObjRef::File(f) => {
                    self.release(size_of::<ObjFile>());
                    drop(Box::from_raw(f.as_ptr()));
                }
                ObjRef::Script(s) => {
                    self.release(size_of::<ObjScript>());
                    drop(Box::from_raw(s.as_ptr()));
                }
            }
        }
    }

    fn release(&mut self, bytes: usize) {
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
    }

    #[cfg(test)]
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while let Some(ptr) = current {
            count += 1;
            current = unsafe { ptr.as_ref().next };
        }
        count
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.head;
        let mut freed = 0usize;
        while let Some(ptr) = current {
            current = unsafe { ptr.as_ref().next };
            self.free_object(ptr);
            freed += 1;
        }
        self.head = None;
        debug!(freed, "heap dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_canonicalizes() {
        let mut heap = Heap::new(false, false);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "hello");
    }

    #[test]
    fn fnv1a_known_values() {
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
    }

    #[test]
    fn allocation_tracks_bytes() {
        let mut heap = Heap::new(false, false);
        assert_eq!(heap.bytes_allocated, 0);
        heap.intern("abcdef");
        assert!(heap.bytes_allocated >= size_of::<ObjString>() + 6);
    }

    #[test]
    fn unreachable_objects_are_swept_once() {
        let mut heap = Heap::new(false, false);
        let keep = heap.intern("keep");
        heap.intern("drop1");
        heap.intern("drop2");
        assert_eq!(heap.object_count(), 3);

        heap.mark_object(ObjRef::String(keep));
        heap.trace_references();
        heap.remove_white_strings();
        let freed = heap.sweep();

        assert_eq!(freed, 2);
        assert_eq!(heap.object_count(), 1);
        // Survivor is unmarked again, and still interned.
        assert!(!keep.header.marked);
        assert_eq!(heap.intern("keep"), keep);
    }

    #[test]
    fn weak_intern_pool_forgets_dead_strings() {
        let mut heap = Heap::new(false, false);
        let dead = heap.intern("ghost");
        let hash = dead.hash;

        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        assert!(heap.strings.find_string("ghost", hash).is_none());
        // A new intern of the same text builds a fresh object.
        let reborn = heap.intern("ghost");
        assert_eq!(reborn.as_str(), "ghost");
    }

    #[test]
    fn sweep_is_idempotent_when_quiescent() {
        let mut heap = Heap::new(false, false);
        let keep = heap.intern("stay");

        heap.mark_object(ObjRef::String(keep));
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();

        heap.mark_object(ObjRef::String(keep));
        heap.trace_references();
        heap.remove_white_strings();
        let freed = heap.sweep();
        assert_eq!(freed, 0);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn next_gc_scales_with_live_bytes() {
        let mut heap = Heap::new(false, false);
        heap.intern("x");
        heap.trace_references();
        heap.remove_white_strings();
        heap.sweep();
        assert!(heap.next_gc >= GC_NEXT_MIN);
    }
}
