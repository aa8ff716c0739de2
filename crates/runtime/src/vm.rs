//! The Ilex virtual machine
//!
//! A stack-based interpreter over the bytecode the compiler emits. One
//! `run` call executes until the frame that was on top when it started
//! returns; `OP_USE` pushes frames for imported scripts into the same
//! loop. The instruction pointer is cached in a local and written back
//! to the frame before anything that can re-enter the loop or report an
//! error.
//!
//! The VM owns the heap and the entire GC root set: the operand stack,
//! call frames, open upvalues, the global/const tables, the per-type
//! method tables, the script cache and the interned service strings.
//! Every allocation goes through wrappers that collect first when the
//! heap is over budget, so composing objects across allocations
//! requires keeping the pieces on the operand stack.

use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use ilex_core::{ClassKind, CompiledFunction, Constant, FunctionKind, OpCode};
use ilex_compiler::CompilerOptions;
use tracing::debug;

use crate::config::VmOptions;
use crate::error::VmError;
use crate::heap::Heap;
use crate::natives;
use crate::object::{
    BuiltInLib, Gc, NativeFn, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjEnum, ObjFile,
    ObjFunction, ObjInstance, ObjMap, ObjNative, ObjRef, ObjScript, ObjSet, ObjString,
    ObjUpvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

pub const FRAMES_MAX: usize = 256;

pub(crate) struct CallFrame {
    pub closure: Gc<ObjClosure>,
    pub ip: usize,
    /// Operand-stack index of slot zero (the callee / receiver).
    pub slots: usize,
}

pub struct Vm {
    pub(crate) heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Option<Gc<ObjUpvalue>>,

    pub(crate) globals: Table,
    /// Names declared `const` at script level; consulted on property
    /// writes to scripts.
    pub(crate) consts: Table,
    /// Module cache keyed by canonical absolute path. Permanent.
    scripts: Table,

    pub(crate) string_methods: Table,
    pub(crate) array_methods: Table,
    pub(crate) file_methods: Table,
    pub(crate) map_methods: Table,
    pub(crate) set_methods: Table,
    pub(crate) enum_methods: Table,

    init_string: Option<Gc<ObjString>>,
    script_name: Option<Gc<ObjString>>,
    last_script: Option<Gc<ObjScript>>,

    libs: Vec<(String, BuiltInLib)>,

    fall_through: bool,
    pub(crate) options: VmOptions,
    pub(crate) out: Box<dyn Write>,

    runtime_callback: Option<Box<dyn Fn(&str)>>,
    assert_callback: Option<Box<dyn Fn(&str)>>,
    panic_callback: Option<Box<dyn Fn(&str)>>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Vm {
        let mut vm = Vm {
            heap: Heap::new(options.gc_stress, options.gc_log),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            globals: Table::new(),
            consts: Table::new(),
            scripts: Table::new(),
            string_methods: Table::new(),
            array_methods: Table::new(),
            file_methods: Table::new(),
            map_methods: Table::new(),
            set_methods: Table::new(),
            enum_methods: Table::new(),
            init_string: None,
            script_name: None,
            last_script: None,
            libs: Vec::new(),
            fall_through: false,
            options,
            out: Box::new(std::io::stdout()),
            runtime_callback: None,
            assert_callback: None,
            panic_callback: None,
        };

        let init = vm.intern("init");
        vm.init_string = Some(init);
        natives::install(&mut vm);
        vm
    }

    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = out;
    }

    pub fn is_test_mode(&self) -> bool {
        self.options.test_mode
    }

    /// Live heap bytes currently accounted to objects.
    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated
    }

    /// Number of completed collection cycles.
    pub fn gc_cycle_count(&self) -> u64 {
        self.heap.gc_runs
    }

    pub fn set_runtime_error_callback(&mut self, callback: impl Fn(&str) + 'static) {
        self.runtime_callback = Some(Box::new(callback));
    }

    pub fn set_assert_error_callback(&mut self, callback: impl Fn(&str) + 'static) {
        self.assert_callback = Some(Box::new(callback));
    }

    pub fn set_panic_error_callback(&mut self, callback: impl Fn(&str) + 'static) {
        self.panic_callback = Some(Box::new(callback));
    }

    // =========================================================================
    // Stack
    // =========================================================================

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    pub fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        self.fall_through = false;
    }

    // =========================================================================
    // Allocation (every call is a GC safepoint)
    // =========================================================================

    fn collect_if_needed(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn intern(&mut self, chars: &str) -> Gc<ObjString> {
        self.collect_if_needed();
        self.heap.intern(chars)
    }

    fn alloc_function(
        &mut self,
        proto: Rc<CompiledFunction>,
        constants: Vec<Value>,
        name: Option<Gc<ObjString>>,
        script: Gc<ObjScript>,
    ) -> Gc<ObjFunction> {
        self.collect_if_needed();
        self.heap.alloc_function(proto, constants, name, script)
    }

    pub(crate) fn alloc_native(&mut self, function: NativeFn) -> Gc<ObjNative> {
        self.collect_if_needed();
        self.heap.alloc_native(function)
    }

    fn alloc_closure(&mut self, function: Gc<ObjFunction>) -> Gc<ObjClosure> {
        self.collect_if_needed();
        self.heap.alloc_closure(function)
    }

    fn alloc_upvalue(&mut self, state: UpvalueState) -> Gc<ObjUpvalue> {
        self.collect_if_needed();
        self.heap.alloc_upvalue(state)
    }

    fn alloc_class(
        &mut self,
        name: Gc<ObjString>,
        super_class: Option<Gc<ObjClass>>,
        kind: ClassKind,
    ) -> Gc<ObjClass> {
        self.collect_if_needed();
        self.heap.alloc_class(name, super_class, kind)
    }

    fn alloc_instance(&mut self, class: Gc<ObjClass>) -> Gc<ObjInstance> {
        self.collect_if_needed();
        self.heap.alloc_instance(class)
    }

    fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: Gc<ObjClosure>,
    ) -> Gc<ObjBoundMethod> {
        self.collect_if_needed();
        self.heap.alloc_bound_method(receiver, method)
    }

    fn alloc_enum(&mut self, name: Gc<ObjString>) -> Gc<ObjEnum> {
        self.collect_if_needed();
        self.heap.alloc_enum(name)
    }

    pub(crate) fn alloc_array(&mut self, data: Vec<Value>) -> Gc<ObjArray> {
        self.collect_if_needed();
        self.heap.alloc_array(data)
    }

    fn alloc_map(&mut self) -> Gc<ObjMap> {
        self.collect_if_needed();
        self.heap.alloc_map()
    }

    fn alloc_set(&mut self) -> Gc<ObjSet> {
        self.collect_if_needed();
        self.heap.alloc_set()
    }

    fn alloc_file(&mut self, file: std::fs::File, path: String, flags: String) -> Gc<ObjFile> {
        self.collect_if_needed();
        self.heap.alloc_file(file, path, flags)
    }

    pub(crate) fn alloc_script(
        &mut self,
        name: Gc<ObjString>,
        path: Gc<ObjString>,
    ) -> Gc<ObjScript> {
        self.collect_if_needed();
        self.heap.alloc_script(name, path)
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated;

        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(ObjRef::Closure(closure));
        }
        let mut upvalue = self.open_upvalues;
        while let Some(u) = upvalue {
            self.heap.mark_object(ObjRef::Upvalue(u));
            upvalue = u.next;
        }

        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.consts);
        self.heap.mark_table(&self.scripts);
        self.heap.mark_table(&self.string_methods);
        self.heap.mark_table(&self.array_methods);
        self.heap.mark_table(&self.file_methods);
        self.heap.mark_table(&self.map_methods);
        self.heap.mark_table(&self.set_methods);
        self.heap.mark_table(&self.enum_methods);

        if let Some(init) = self.init_string {
            self.heap.mark_object(ObjRef::String(init));
        }
        if let Some(name) = self.script_name {
            self.heap.mark_object(ObjRef::String(name));
        }
        if let Some(script) = self.last_script {
            self.heap.mark_object(ObjRef::Script(script));
        }

        self.heap.trace_references();
        self.heap.remove_white_strings();
        let freed = self.heap.sweep();

        debug!(
            before,
            after = self.heap.bytes_allocated,
            freed,
            next_gc = self.heap.next_gc,
            run = self.heap.gc_runs,
            "gc cycle"
        );
    }

    // =========================================================================
    // Error reporting
    // =========================================================================

    /// `[line N] in function F in script S` per frame, innermost first,
    /// ending at the innermost script frame.
    fn stack_trace(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.iter().rev() {
            let function = frame.closure.function;
            let line = function.proto.chunk.line_at(frame.ip.saturating_sub(1));
            out.push_str(&format!("[line {line}] in "));
            match function.name {
                None => {
                    out.push_str(&format!("script {}\n", function.script.name.as_str()));
                    break;
                }
                Some(name) => {
                    out.push_str(&format!(
                        "function '{}' in script {}\n",
                        name.as_str(),
                        function.script.name.as_str()
                    ));
                }
            }
        }
        out
    }

    pub(crate) fn runtime_error(&mut self, message: &str) -> VmError {
        let trace = self.stack_trace();
        let full = format!("Runtime Error: {message}\n{trace}");
        if let Some(callback) = &self.runtime_callback {
            callback(&full);
        } else {
            eprint!("\x1b[31mRuntime Error:\x1b[0m {message}\n{trace}");
        }
        self.reset_stack();
        VmError::Runtime(full)
    }

    fn assert_error(&mut self, message: &str) -> VmError {
        let trace = self.stack_trace();
        let full = format!("{message}\n{trace}");
        if let Some(callback) = &self.assert_callback {
            callback(&full);
        } else {
            eprint!("{full}");
        }
        self.reset_stack();
        VmError::Assert(full)
    }

    fn panic_error(&mut self, message: &str) -> VmError {
        let trace = self.stack_trace();
        let full = format!("Panic! {message}\n{trace}");
        if let Some(callback) = &self.panic_callback {
            callback(&full);
        } else {
            eprint!("\x1b[31mPanic!\x1b[0m {message}\n{trace}");
        }
        self.reset_stack();
        VmError::Panic(full)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn closure_name(closure: Gc<ObjClosure>) -> String {
        match closure.function.name {
            Some(name) => name.as_str().to_string(),
            None => "<script>".to_string(),
        }
    }

    fn call(&mut self, closure: Gc<ObjClosure>, argc: usize) -> Result<(), VmError> {
        let arity = closure.function.proto.arity as usize;
        let arity_default = closure.function.proto.arity_default as usize;
        if argc < arity || argc > arity + arity_default {
            let message = format!(
                "Function '{}' expected {} arguments but got {}.",
                Self::closure_name(closure),
                arity + arity_default,
                argc
            );
            return Err(self.runtime_error(&message));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), VmError> {
        if callee.is_obj() {
            match callee.as_obj() {
                ObjRef::BoundMethod(bound) => {
                    let receiver_slot = self.stack.len() - argc - 1;
                    self.stack[receiver_slot] = bound.receiver;
                    return self.call(bound.method, argc);
                }
                ObjRef::Class(class) => match class.kind {
                    ClassKind::Default => {
                        let instance = self.new_instance(class);
                        let receiver_slot = self.stack.len() - argc - 1;
                        self.stack[receiver_slot] = Value::object(instance);

                        let init = self.init_string.expect("init string interned at startup");
                        if let Some(initializer) = class.methods.get(init) {
                            let closure = initializer
                                .as_closure()
                                .expect("initializers are closures");
                            return self.call(closure, argc);
                        }
                        if argc != 0 {
                            let message =
                                format!("Expected 0 arguments but got {argc}.");
                            return Err(self.runtime_error(&message));
                        }
                        return Ok(());
                    }
                    ClassKind::Abstract => {
                        let message = format!(
                            "Cannot instantiate abstract class '{}'.",
                            class.name.as_str()
                        );
                        return Err(self.runtime_error(&message));
                    }
                    ClassKind::Static => {
                        let message = format!(
                            "Cannot instantiate static class '{}'.",
                            class.name.as_str()
                        );
                        return Err(self.runtime_error(&message));
                    }
                },
                ObjRef::Closure(closure) => {
                    let callee_slot = self.stack.len() - argc - 1;
                    self.stack[callee_slot] = callee;
                    return self.call(closure, argc);
                }
                ObjRef::Native(native) => {
                    let args_start = self.stack.len() - argc;
                    let args: Vec<Value> = self.stack[args_start..].to_vec();
                    let function = native.function;
                    return match function(self, &args) {
                        Ok(result) => {
                            self.stack.truncate(args_start - 1);
                            self.push(result);
                            Ok(())
                        }
                        Err(message) => Err(self.runtime_error(&message)),
                    };
                }
                _ => {}
            }
        }

        let message = format!(
            "Can only call functions and classes. Tried to call '{}' of type '{}'.",
            callee.display(),
            callee.type_name()
        );
        Err(self.runtime_error(&message))
    }

    /// New instance with its field tables seeded from the class.
    fn new_instance(&mut self, class: Gc<ObjClass>) -> Gc<ObjInstance> {
        let mut instance = self.alloc_instance(class);
        instance.fields.add_all(&class.fields);
        instance.private_fields.add_all(&class.private_fields);
        instance
    }

    /// Type-table natives receive the receiver as `args[0]`.
    fn call_native_method(&mut self, native: Gc<ObjNative>, argc: usize) -> Result<(), VmError> {
        let base = self.stack.len() - argc - 1;
        let args: Vec<Value> = self.stack[base..].to_vec();
        let function = native.function;
        match function(self, &args) {
            Ok(result) => {
                self.stack.truncate(base);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(&message)),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: Gc<ObjClass>,
        name: Gc<ObjString>,
        argc: usize,
    ) -> Result<(), VmError> {
        let Some(method) = class.methods.get(name) else {
            let message = format!("Undefined property '{}'.", name.as_str());
            return Err(self.runtime_error(&message));
        };
        let closure = method.as_closure().expect("methods are closures");
        self.call(closure, argc)
    }

    fn invoke_from_this(&mut self, name: Gc<ObjString>, argc: usize) -> Result<(), VmError> {
        let receiver = self.peek(argc);

        if let Some(instance) = receiver.as_instance() {
            if let Some(method) = instance.class.private_methods.get(name) {
                let closure = method.as_closure().expect("methods are closures");
                return self.call(closure, argc);
            }
            if let Some(method) = instance.class.methods.get(name) {
                let closure = method.as_closure().expect("methods are closures");
                return self.call(closure, argc);
            }
            if let Some(value) = instance.class.static_vars.get(name) {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = value;
                return self.call_value(value, argc);
            }
        } else if let Some(class) = receiver.as_class() {
            let found = class
                .private_methods
                .get(name)
                .or_else(|| class.methods.get(name));
            if let Some(method) = found {
                let closure = method.as_closure().expect("methods are closures");
                if closure.function.proto.kind != FunctionKind::Static {
                    let message = format!(
                        "'{}', is not static. Only static methods can be invoked from a class.",
                        name.as_str()
                    );
                    return Err(self.runtime_error(&message));
                }
                return self.call_value(method, argc);
            }
        }

        let message = format!("Undefined property '{}'.", name.as_str());
        Err(self.runtime_error(&message))
    }

    fn invoke(&mut self, name: Gc<ObjString>, argc: usize) -> Result<(), VmError> {
        let receiver = self.peek(argc);

        if !receiver.is_obj() {
            let message = format!(
                "Only objects have methods. Tried to run method on type '{}'.",
                receiver.type_name()
            );
            return Err(self.runtime_error(&message));
        }

        match receiver.as_obj() {
            ObjRef::Instance(instance) => {
                if let Some(value) = instance.fields.get(name) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = value;
                    return self.call_value(value, argc);
                }
                self.invoke_from_class(instance.class, name, argc)
            }
            ObjRef::Class(class) => {
                if let Some(method) = class.methods.get(name) {
                    let closure = method.as_closure().expect("methods are closures");
                    if closure.function.proto.kind != FunctionKind::Static {
                        let message = format!(
                            "'{}', is not static. Only static methods can be invoked from a class.",
                            name.as_str()
                        );
                        return Err(self.runtime_error(&message));
                    }
                    return self.call_value(method, argc);
                }
                if let Some(value) = class.static_vars.get(name) {
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = value;
                    return self.call_value(value, argc);
                }
                let message = format!("Undefined property '{}'.", name.as_str());
                Err(self.runtime_error(&message))
            }
            ObjRef::String(_) => {
                let method = self.string_methods.get(name).and_then(|v| v.as_native());
                self.invoke_type_method(method, "String", name, argc)
            }
            ObjRef::Array(_) => {
                let method = self.array_methods.get(name).and_then(|v| v.as_native());
                self.invoke_type_method(method, "Array", name, argc)
            }
            ObjRef::File(_) => {
                let method = self.file_methods.get(name).and_then(|v| v.as_native());
                self.invoke_type_method(method, "File", name, argc)
            }
            ObjRef::Map(_) => {
                let method = self.map_methods.get(name).and_then(|v| v.as_native());
                self.invoke_type_method(method, "Map", name, argc)
            }
            ObjRef::Set(_) => {
                let method = self.set_methods.get(name).and_then(|v| v.as_native());
                self.invoke_type_method(method, "Set", name, argc)
            }
            ObjRef::Enum(enum_obj) => {
                if let Some(native) = self.enum_methods.get(name).and_then(|v| v.as_native()) {
                    return self.call_native_method(native, argc);
                }
                if let Some(value) = enum_obj.values.get(name) {
                    return self.call_value(value, argc);
                }
                let message = format!(
                    "'{}' enum has no property '{}'.",
                    enum_obj.name.as_str(),
                    name.as_str()
                );
                Err(self.runtime_error(&message))
            }
            ObjRef::Script(script) => {
                let Some(value) = script.values.get(name) else {
                    let message = format!(
                        "Undefined property '{}' on '{}'.",
                        name.as_str(),
                        script.name.as_str()
                    );
                    return Err(self.runtime_error(&message));
                };
                self.call_value(value, argc)
            }
            _ => Err(self.runtime_error("Only instances have methods.")),
        }
    }

    fn invoke_type_method(
        &mut self,
        method: Option<Gc<ObjNative>>,
        type_label: &str,
        name: Gc<ObjString>,
        argc: usize,
    ) -> Result<(), VmError> {
        match method {
            Some(native) => self.call_native_method(native, argc),
            None => {
                let message =
                    format!("{} has no function {}().", type_label, name.as_str());
                Err(self.runtime_error(&message))
            }
        }
    }

    /// Bind `peek(0)` as the receiver of a class method; false if the
    /// class has no such method.
    fn bind_method(&mut self, class: Gc<ObjClass>, name: Gc<ObjString>) -> bool {
        let Some(method) = class.methods.get(name) else {
            return false;
        };
        let Some(closure) = method.as_closure() else {
            return false;
        };
        let bound = self.alloc_bound_method(self.peek(0), closure);
        self.pop();
        self.push(Value::object(bound));
        true
    }

    // =========================================================================
    // Upvalues
    // =========================================================================

    /// Find or create the open upvalue for a stack slot, keeping the
    /// list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> Gc<ObjUpvalue> {
        let mut prev: Option<Gc<ObjUpvalue>> = None;
        let mut current = self.open_upvalues;

        while let Some(upvalue) = current {
            let UpvalueState::Open(existing) = upvalue.state else {
                break;
            };
            if existing <= slot {
                break;
            }
            prev = Some(upvalue);
            current = upvalue.next;
        }

        if let Some(upvalue) = current {
            if let UpvalueState::Open(existing) = upvalue.state {
                if existing == slot {
                    return upvalue;
                }
            }
        }

        let mut created = self.alloc_upvalue(UpvalueState::Open(slot));
        created.next = current;
        match prev {
            Some(mut prev) => prev.next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue watching slot `floor` or above: copy the
    /// live value inline and drop the upvalue from the open list.
    fn close_upvalues(&mut self, floor: usize) {
        while let Some(mut upvalue) = self.open_upvalues {
            let UpvalueState::Open(slot) = upvalue.state else {
                break;
            };
            if slot < floor {
                break;
            }
            upvalue.state = UpvalueState::Closed(self.stack[slot]);
            self.open_upvalues = upvalue.next;
            upvalue.next = None;
        }
    }

    fn read_upvalue(&self, upvalue: Gc<ObjUpvalue>) -> Value {
        match upvalue.state {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, mut upvalue: Gc<ObjUpvalue>, value: Value) {
        match upvalue.state {
            UpvalueState::Open(slot) => self.stack[slot] = value,
            UpvalueState::Closed(_) => upvalue.state = UpvalueState::Closed(value),
        }
    }

    #[cfg(test)]
    pub(crate) fn open_upvalue_slots(&self) -> Vec<usize> {
        let mut slots = Vec::new();
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            if let UpvalueState::Open(slot) = upvalue.state {
                slots.push(slot);
            }
            current = upvalue.next;
        }
        slots
    }

    // =========================================================================
    // Materialization
    // =========================================================================

    /// Turn a compiled prototype into a live function object: numbers
    /// pass through, strings are interned once, nested functions stay in
    /// the prototype until `OP_CLOSURE` reaches them.
    fn materialize_function(
        &mut self,
        proto: Rc<CompiledFunction>,
        script: Gc<ObjScript>,
    ) -> Gc<ObjFunction> {
        let base = self.stack.len();
        for constant in &proto.chunk.constants {
            let value = match constant {
                Constant::Number(n) => Value::number(*n),
                Constant::String(s) => {
                    let interned = self.intern(s);
                    Value::object(interned)
                }
                Constant::Function(_) => Value::EMPTY,
            };
            self.push(value);
        }

        let name = if proto.name.is_empty() {
            None
        } else {
            let interned = self.intern(&proto.name);
            self.push(Value::object(interned));
            Some(interned)
        };

        let constants = self.stack[base..base + proto.chunk.constants.len()].to_vec();
        let function = self.alloc_function(proto, constants, name, script);
        self.stack.truncate(base);
        function
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            globals: self
                .globals
                .keys()
                .map(|k| k.as_str().to_string())
                .collect(),
            builtin_libs: self.libs.iter().map(|(name, _)| name.clone()).collect(),
        }
    }

    /// Compile and run a whole script.
    pub fn interpret(&mut self, script_name: &str, source: &str) -> Result<Value, VmError> {
        let name = self.intern(script_name);
        self.push(Value::object(name));
        self.script_name = Some(name);

        let dir = script_dir(script_name);
        let dir_interned = self.intern(&dir);
        self.push(Value::object(dir_interned));

        let script = self.alloc_script(name, dir_interned);
        self.pop();
        self.pop();
        self.push(Value::object(script));
        self.last_script = Some(script);

        let options = self.compiler_options();
        let proto = match ilex_compiler::compile(source, &options) {
            Ok(proto) => proto,
            Err(err) => {
                self.pop(); // script
                return Err(err.into());
            }
        };

        let function = self.materialize_function(proto, script);
        self.push(Value::object(function));
        let closure = self.alloc_closure(function);
        self.pop(); // function
        self.pop(); // script
        self.push(Value::object(closure));
        self.call(closure, 0)?;

        self.run(0)
    }

    /// Call a callable value with arguments; used by natives and
    /// embedders re-entering the interpreter.
    pub fn call_function_value(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, VmError> {
        let floor = self.frames.len();
        self.push(callee);
        for arg in args {
            self.push(*arg);
        }
        self.call_value(callee, args.len())?;

        if self.frames.len() > floor {
            self.run(floor)
        } else {
            // Native: the result is already on the stack.
            Ok(self.pop())
        }
    }

    pub fn register_library(&mut self, name: &str, lib: BuiltInLib) {
        self.libs.push((name.to_string(), lib));
    }

    /// Create the script object backing a builtin library. It is entered
    /// into the script cache immediately, which also keeps it rooted
    /// while the factory registers its functions.
    pub fn new_library(&mut self, name: &str) -> Gc<ObjScript> {
        let name_interned = self.intern(name);
        self.push(Value::object(name_interned));
        let script = self.alloc_script(name_interned, name_interned);
        let _ = self.scripts.set(name_interned, Value::object(script), false);
        self.pop();
        script
    }

    // =========================================================================
    // The interpreter loop
    // =========================================================================

    fn run(&mut self, frame_floor: usize) -> Result<Value, VmError> {
        let mut frame_index = self.frames.len() - 1;
        let mut closure = self.frames[frame_index].closure;
        let mut function = closure.function;
        let mut proto = function.proto.clone();
        let mut slots = self.frames[frame_index].slots;
        let mut ip = self.frames[frame_index].ip;

        macro_rules! refresh_frame {
            () => {{
                frame_index = self.frames.len() - 1;
                closure = self.frames[frame_index].closure;
                function = closure.function;
                proto = function.proto.clone();
                slots = self.frames[frame_index].slots;
                ip = self.frames[frame_index].ip;
            }};
        }

        macro_rules! read_byte {
            () => {{
                let byte = proto.chunk.code[ip];
                ip += 1;
                byte
            }};
        }

        macro_rules! read_short {
            () => {{
                let hi = proto.chunk.code[ip] as u16;
                let lo = proto.chunk.code[ip + 1] as u16;
                ip += 2;
                (hi << 8) | lo
            }};
        }

        macro_rules! read_constant {
            () => {
                function.constants[read_short!() as usize]
            };
        }

        macro_rules! read_string {
            () => {
                read_constant!()
                    .as_string()
                    .expect("bytecode names are string constants")
            };
        }

        macro_rules! rt_err {
            ($($arg:tt)*) => {{
                self.frames[frame_index].ip = ip;
                let message = format!($($arg)*);
                return Err(self.runtime_error(&message));
            }};
        }

        macro_rules! binary_num_op {
            ($wrap:expr, $op:tt) => {{
                if !self.peek(0).is_number() || !self.peek(1).is_number() {
                    rt_err!(
                        "Operands must be numbers. Got '{}', '{}' ({}, {}).",
                        self.peek(0).type_name(),
                        self.peek(1).type_name(),
                        self.peek(0).display(),
                        self.peek(1).display()
                    );
                }
                let b = self.pop().as_number();
                let a = self.pop().as_number();
                self.push($wrap(a $op b));
            }};
        }

        macro_rules! binary_int_op {
            ($op:tt) => {{
                if !self.peek(0).is_number() || !self.peek(1).is_number() {
                    rt_err!(
                        "Operands must be numbers. Got '{}', '{}' ({}, {}).",
                        self.peek(0).type_name(),
                        self.peek(1).type_name(),
                        self.peek(0).display(),
                        self.peek(1).display()
                    );
                }
                let b = to_int32(self.pop().as_number());
                let a = to_int32(self.pop().as_number());
                self.push(Value::number((a $op b) as f64));
            }};
        }

        loop {
            let instruction = read_byte!();
            let Ok(op) = OpCode::try_from(instruction) else {
                rt_err!("Unknown opcode {instruction}.");
            };

            match op {
                OpCode::Constant => {
                    let constant = read_constant!();
                    self.push(constant);
                }
                OpCode::Null => self.push(Value::NULL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Empty => self.push(Value::EMPTY),
                OpCode::Pop => {
                    self.pop();
                }

                OpCode::GetLocal => {
                    let slot = read_short!() as usize;
                    self.push(self.stack[slots + slot]);
                }
                OpCode::SetLocal => {
                    let slot = read_short!() as usize;
                    self.stack[slots + slot] = self.peek(0);
                }

                OpCode::GetGlobal => {
                    let name = read_string!();
                    let Some(value) = self.globals.get(name) else {
                        rt_err!("Undefined variable '{}'.", name.as_str());
                    };
                    self.push(value);
                }
                OpCode::SetGlobal => {
                    let name = read_string!();
                    match self.globals.set(name, self.peek(0), false) {
                        Err(_) => rt_err!("'{}' is marked as readonly.", name.as_str()),
                        Ok(true) => {
                            self.globals.delete(name);
                            rt_err!("Undefined variable '{}'.", name.as_str());
                        }
                        Ok(false) => {}
                    }
                }
                OpCode::DefineGlobal => {
                    let name = read_string!();
                    let read_only = read_byte!() != 0;
                    let value = self.peek(0);
                    if self.globals.set(name, value, read_only).is_err() {
                        rt_err!("'{}' is marked as readonly.", name.as_str());
                    }
                    self.pop();
                }

                OpCode::GetScript => {
                    let name = read_string!();
                    let Some(value) = function.script.values.get(name) else {
                        rt_err!("Undefined variable '{}'.", name.as_str());
                    };
                    self.push(value);
                }
                OpCode::SetScript => {
                    let name = read_string!();
                    let mut script = function.script;
                    match script.values.set(name, self.peek(0), false) {
                        Err(_) => rt_err!("'{}' is marked as readonly.", name.as_str()),
                        Ok(true) => {
                            script.values.delete(name);
                            rt_err!("Undefined variable '{}'.", name.as_str());
                        }
                        Ok(false) => {}
                    }
                }
                OpCode::DefineScript => {
                    let name = read_string!();
                    let read_only = read_byte!() != 0;
                    let value = self.peek(0);
                    let mut script = function.script;
                    if script.values.set(name, value, read_only).is_err() {
                        rt_err!("'{}' is marked as readonly.", name.as_str());
                    }
                    if read_only {
                        let _ = self.consts.set(name, Value::TRUE, false);
                    }
                    self.pop();
                }

                OpCode::GetUpvalue => {
                    let slot = read_short!() as usize;
                    let value = self.read_upvalue(closure.upvalues[slot]);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = read_short!() as usize;
                    let upvalue = closure.upvalues[slot];
                    let value = self.peek(0);
                    self.write_upvalue(upvalue, value);
                }

                OpCode::GetProperty => {
                    let receiver = self.peek(0);
                    if !receiver.is_obj() {
                        // keep operand decode in sync with the error path
                        let _ = read_short!();
                        rt_err!("Type '{}' has no properties.", receiver.type_name());
                    }

                    match receiver.as_obj() {
                        ObjRef::Instance(instance) => {
                            let name = read_string!();
                            if let Some(value) = instance.fields.get(name) {
                                self.pop();
                                self.push(value);
                            } else if instance.private_fields.get(name).is_some() {
                                rt_err!(
                                    "Can't access private property '{}' on '{}' instance.",
                                    name.as_str(),
                                    instance.class.name.as_str()
                                );
                            } else if !self.bind_method(instance.class, name) {
                                rt_err!(
                                    "'{}' instance does not have property: '{}'.",
                                    instance.class.name.as_str(),
                                    name.as_str()
                                );
                            }
                        }
                        ObjRef::Enum(enum_obj) => {
                            let name = read_string!();
                            let Some(value) = enum_obj.values.get(name) else {
                                rt_err!(
                                    "'{}' enum does not have property: '{}'.",
                                    enum_obj.name.as_str(),
                                    name.as_str()
                                );
                            };
                            self.pop();
                            self.push(value);
                        }
                        ObjRef::Script(script) => {
                            let name = read_string!();
                            let Some(value) = script.values.get(name) else {
                                rt_err!(
                                    "'{}' does not have property: '{}'.",
                                    script.name.as_str(),
                                    name.as_str()
                                );
                            };
                            self.pop();
                            self.push(value);
                        }
                        ObjRef::Class(class) => {
                            let name = read_string!();
                            let mut found = None;
                            let mut current = Some(class);
                            while let Some(c) = current {
                                if let Some(value) = c.static_consts.get(name) {
                                    found = Some(value);
                                    break;
                                }
                                if let Some(value) = c.static_vars.get(name) {
                                    found = Some(value);
                                    break;
                                }
                                current = c.super_class;
                            }
                            let Some(value) = found else {
                                rt_err!(
                                    "'{}' does not have property '{}'.",
                                    class.name.as_str(),
                                    name.as_str()
                                );
                            };
                            self.pop();
                            self.push(value);
                        }
                        ObjRef::Map(map) => {
                            let key = read_constant!();
                            self.pop();
                            match map.data.get(key) {
                                Some(value) => self.push(value),
                                None => self.push(Value::NULL),
                            }
                        }
                        _ => {
                            let _ = read_short!();
                            rt_err!("Type '{}' has no properties.", receiver.type_name());
                        }
                    }
                }
                OpCode::GetPropertyNoPop => {
                    let name = read_string!();
                    let Some(instance) = self.peek(0).as_instance() else {
                        rt_err!("Only instances have properties.");
                    };
                    if let Some(value) = instance.fields.get(name) {
                        self.push(value);
                    } else if self.bind_method(instance.class, name) {
                        // receiver replaced by the bound method
                    } else if instance.private_fields.get(name).is_some() {
                        rt_err!(
                            "Can't access private property '{}' on '{}' instance.",
                            name.as_str(),
                            instance.class.name.as_str()
                        );
                    } else {
                        rt_err!(
                            "'{}' instance does not have property: '{}'.",
                            instance.class.name.as_str(),
                            name.as_str()
                        );
                    }
                }
                OpCode::GetPrivateProperty => {
                    let name = read_string!();
                    let Some(instance) = self.peek(0).as_instance() else {
                        rt_err!("Only instances have properties.");
                    };
                    if let Some(value) = instance.private_fields.get(name) {
                        self.pop();
                        self.push(value);
                    } else if let Some(value) = instance.fields.get(name) {
                        self.pop();
                        self.push(value);
                    } else if !self.bind_method(instance.class, name) {
                        rt_err!(
                            "'{}' instance does not have property: '{}'.",
                            instance.class.name.as_str(),
                            name.as_str()
                        );
                    }
                }
                OpCode::GetPrivatePropertyNoPop => {
                    let name = read_string!();
                    let Some(instance) = self.peek(0).as_instance() else {
                        rt_err!("Only instances have properties.");
                    };
                    if let Some(value) = instance.private_fields.get(name) {
                        self.push(value);
                    } else if let Some(value) = instance.fields.get(name) {
                        self.push(value);
                    } else if !self.bind_method(instance.class, name) {
                        rt_err!(
                            "'{}' instance does not have property: '{}'.",
                            instance.class.name.as_str(),
                            name.as_str()
                        );
                    }
                }
                OpCode::GetSuper => {
                    let name = read_string!();
                    let superclass = self
                        .pop()
                        .as_class()
                        .expect("'super' always resolves to a class");
                    if !self.bind_method(superclass, name) {
                        rt_err!("Undefined property '{}'.", name.as_str());
                    }
                }

                OpCode::SetProperty => {
                    let target = self.peek(1);
                    if let Some(mut script) = target.as_script() {
                        let name = read_string!();
                        if self.consts.get(name).is_some() {
                            rt_err!("Cannot assign to const variable '{}'.", name.as_str());
                        }
                        if script.values.set(name, self.peek(0), false).is_err() {
                            rt_err!("'{}' is marked as readonly.", name.as_str());
                        }
                        let value = self.pop();
                        self.pop(); // script
                        self.push(value);
                    } else if let Some(mut instance) = target.as_instance() {
                        let name = read_string!();
                        if instance.private_fields.get(name).is_some() {
                            rt_err!("Cannot assign to private variable '{}'.", name.as_str());
                        }
                        if instance.fields.get(name).is_none() {
                            rt_err!(
                                "Instance of '{}' contains no variable '{}'.",
                                instance.class.name.as_str(),
                                name.as_str()
                            );
                        }
                        let _ = instance.fields.set(name, self.peek(0), false);
                        let value = self.pop();
                        self.pop(); // instance
                        self.push(value);
                    } else if let Some(mut class) = target.as_class() {
                        let name = read_string!();
                        if class.static_consts.get(name).is_some() {
                            rt_err!("Cannot assign to a class constant '{}'.", name.as_str());
                        }
                        if class.static_vars.get(name).is_some() {
                            let _ = class.static_vars.set(name, self.peek(0), false);
                        } else {
                            let _ = class.fields.set(name, self.peek(0), false);
                        }
                        self.pop(); // value; class stays for the next member
                    } else if let Some(mut map) = target.as_map() {
                        let key = read_constant!();
                        if !map.data.has_key(key) {
                            rt_err!(
                                "Key '{}' not found, cannot add keys to map via the dot operator.",
                                key.display()
                            );
                        }
                        map.data.set(key, self.peek(0));
                        let value = self.pop();
                        self.pop(); // map
                        self.push(value);
                    } else {
                        let _ = read_short!();
                        rt_err!("Can't set property on type '{}'.", target.type_name());
                    }
                }
                OpCode::SetPrivateProperty => {
                    let target = self.peek(1);
                    if let Some(mut instance) = target.as_instance() {
                        let name = read_string!();
                        let _ = instance.private_fields.set(name, self.peek(0), false);
                        self.pop();
                        self.pop();
                        self.push(Value::NULL);
                    } else if let Some(mut class) = target.as_class() {
                        let name = read_string!();
                        let _ = class.private_fields.set(name, self.peek(0), false);
                        self.pop(); // value; class stays
                    } else {
                        let _ = read_short!();
                        rt_err!("Only instances have private properties.");
                    }
                }
                OpCode::SetClassStaticVar => {
                    let name = read_string!();
                    let is_const = read_byte!() != 0;
                    let mut class = self
                        .peek(1)
                        .as_class()
                        .expect("static member targets are classes");
                    let value = self.peek(0);
                    let result = if is_const {
                        class.static_consts.set(name, value, true)
                    } else {
                        class.static_vars.set(name, value, false)
                    };
                    if result.is_err() {
                        rt_err!("'{}' is marked as readonly.", name.as_str());
                    }
                    self.pop();
                }

                OpCode::Eq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a.equals(b)));
                }
                OpCode::NotEq => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(!a.equals(b)));
                }
                OpCode::Gr => binary_num_op!(Value::boolean, >),
                OpCode::GrEq => binary_num_op!(Value::boolean, >=),
                OpCode::Lt => binary_num_op!(Value::boolean, <),
                OpCode::LtEq => binary_num_op!(Value::boolean, <=),

                OpCode::Add => {
                    if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b));
                    } else if self.peek(0).as_string().is_some()
                        && self.peek(1).as_string().is_some()
                    {
                        self.concat();
                    } else {
                        rt_err!("Operands must be two numbers or two strings.");
                    }
                }
                OpCode::Concat => {
                    if self.peek(0).as_string().is_none() || self.peek(1).as_string().is_none() {
                        rt_err!("Concat operands must be two strings.");
                    }
                    self.concat();
                }
                OpCode::Sub => binary_num_op!(Value::number, -),
                OpCode::Mul => binary_num_op!(Value::number, *),
                OpCode::Div => binary_num_op!(Value::number, /),
                OpCode::Pow => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        rt_err!("Operands must be two numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::number(a.powf(b)));
                }
                OpCode::Mod => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        rt_err!("Operands must be two numbers.");
                    }
                    let b = self.pop().as_number();
                    let a = self.pop().as_number();
                    self.push(Value::number(a % b));
                }
                OpCode::Inc => {
                    if !self.peek(0).is_number() {
                        rt_err!("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.push(Value::number(n + 1.0));
                }
                OpCode::Dec => {
                    if !self.peek(0).is_number() {
                        rt_err!("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.push(Value::number(n - 1.0));
                }

                OpCode::BitAnd => binary_int_op!(&),
                OpCode::BitOr => binary_int_op!(|),
                OpCode::BitXor => binary_int_op!(^),
                OpCode::BitLs => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        rt_err!("Operands must be numbers.");
                    }
                    let b = to_int32(self.pop().as_number());
                    let a = to_int32(self.pop().as_number());
                    self.push(Value::number(a.wrapping_shl(b as u32) as f64));
                }
                OpCode::BitRs => {
                    if !self.peek(0).is_number() || !self.peek(1).is_number() {
                        rt_err!("Operands must be numbers.");
                    }
                    let b = to_int32(self.pop().as_number());
                    let a = to_int32(self.pop().as_number());
                    self.push(Value::number(a.wrapping_shr(b as u32) as f64));
                }
                OpCode::BitNot => {
                    if !self.peek(0).is_number() {
                        rt_err!("Operand must be a number.");
                    }
                    let n = to_int32(self.pop().as_number());
                    self.push(Value::number(!n as f64));
                }

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsy()));
                }
                OpCode::Neg => {
                    if !self.peek(0).is_number() {
                        rt_err!("Operand must be a number.");
                    }
                    let n = self.pop().as_number();
                    self.push(Value::number(-n));
                }

                OpCode::NullCoalesce => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(if lhs.is_null() { rhs } else { lhs });
                }
                OpCode::Or => {
                    let rhs = self.pop();
                    let lhs = self.pop();
                    self.push(if lhs.is_falsy() { rhs } else { lhs });
                }

                OpCode::Jump => {
                    let offset = read_short!() as usize;
                    ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_short!() as usize;
                    if self.peek(0).is_falsy() {
                        ip += offset;
                    }
                }
                OpCode::JumpIfTrue => {
                    let offset = read_short!() as usize;
                    if !self.peek(0).is_falsy() {
                        ip += offset;
                    }
                }
                OpCode::JumpDoWhile => {
                    let offset = read_short!() as usize;
                    let condition = self.pop();
                    if !condition.is_falsy() {
                        ip -= offset;
                    }
                }
                OpCode::Loop => {
                    let offset = read_short!() as usize;
                    ip -= offset;
                }

                OpCode::Call => {
                    let argc = read_byte!() as usize;
                    self.frames[frame_index].ip = ip;
                    self.call_value(self.peek(argc), argc)?;
                    refresh_frame!();
                }
                OpCode::Invoke => {
                    let method = read_string!();
                    let argc = read_byte!() as usize;
                    self.frames[frame_index].ip = ip;
                    self.invoke(method, argc)?;
                    refresh_frame!();
                }
                OpCode::InvokeSuper => {
                    let method = read_string!();
                    let argc = read_byte!() as usize;
                    self.frames[frame_index].ip = ip;
                    let superclass = self
                        .pop()
                        .as_class()
                        .expect("'super' always resolves to a class");
                    self.invoke_from_class(superclass, method, argc)?;
                    refresh_frame!();
                }
                OpCode::InvokeThis => {
                    let method = read_string!();
                    let argc = read_byte!() as usize;
                    self.frames[frame_index].ip = ip;
                    self.invoke_from_this(method, argc)?;
                    refresh_frame!();
                }

                OpCode::Closure => {
                    let constant = read_short!() as usize;
                    let Constant::Function(nested) = &proto.chunk.constants[constant] else {
                        rt_err!("Malformed bytecode: closure operand is not a function.");
                    };
                    let nested = nested.clone();
                    let upvalue_count = nested.upvalue_count as usize;

                    let new_function = self.materialize_function(nested, function.script);
                    self.push(Value::object(new_function));
                    let new_closure = self.alloc_closure(new_function);
                    self.pop();
                    self.push(Value::object(new_closure));

                    let mut new_closure = new_closure;
                    for _ in 0..upvalue_count {
                        let is_local = read_byte!() != 0;
                        let index = read_short!() as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(slots + index)
                        } else {
                            closure.upvalues[index]
                        };
                        new_closure.upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    self.close_upvalues(slots);
                    self.frames.pop();

                    self.stack.truncate(slots);
                    if self.frames.len() == frame_floor {
                        return Ok(result);
                    }
                    self.push(result);
                    refresh_frame!();
                }

                OpCode::Class => {
                    let kind = read_byte!();
                    let name = read_string!();
                    let kind = ClassKind::try_from(kind)
                        .expect("class kind byte is compiler-emitted");
                    self.create_class(name, None, kind);
                }
                OpCode::Inherit => {
                    let kind = read_byte!();
                    let name = read_string!();
                    let kind = ClassKind::try_from(kind)
                        .expect("class kind byte is compiler-emitted");
                    let superclass = self.peek(0);
                    let Some(superclass) = superclass.as_class() else {
                        rt_err!(
                            "Superclass must be a class, got a '{}' instead.",
                            superclass.type_name()
                        );
                    };
                    self.create_class(name, Some(superclass), kind);
                }
                OpCode::CheckAbstract => {
                    let class = self
                        .peek(0)
                        .as_class()
                        .expect("abstract check runs on the class being declared");
                    for (key, _, _) in class.abstract_methods.iter() {
                        if class.methods.get(key).is_none() {
                            rt_err!(
                                "Class '{}' doesn't implement abstract method '{}'.",
                                class.name.as_str(),
                                key.as_str()
                            );
                        }
                    }
                }
                OpCode::Method => {
                    let name = read_string!();
                    self.define_method(name);
                }

                OpCode::Assert => {
                    let message = read_string!();
                    let condition = self.pop();
                    if condition.is_falsy() {
                        self.frames[frame_index].ip = ip;
                        let text = if message.as_str().is_empty() {
                            "Assertion Failed with no message.".to_string()
                        } else {
                            format!("Assertion failed with message: {}", message.as_str())
                        };
                        return Err(self.assert_error(&text));
                    }
                }
                OpCode::Panic => {
                    let message = read_string!();
                    self.frames[frame_index].ip = ip;
                    let text = message.as_str().to_string();
                    return Err(self.panic_error(&text));
                }

                OpCode::MultiCase => {
                    let extra = read_byte!() as usize;
                    let mut values = Vec::with_capacity(extra + 1);
                    for _ in 0..=extra {
                        values.push(self.pop());
                    }
                    let switch_value = self.peek(0);
                    let matched = values.iter().any(|v| v.equals(switch_value));
                    self.push(if matched { switch_value } else { values[0] });
                }
                OpCode::CmpJmp => {
                    let offset = read_short!() as usize;
                    let case_value = self.pop();
                    if self.fall_through {
                        self.fall_through = false;
                    } else if self.peek(0).equals(case_value) {
                        self.pop(); // switch value
                    } else {
                        ip += offset;
                    }
                }
                OpCode::CmpJmpFall => {
                    let offset = read_short!() as usize;
                    let case_value = self.pop();
                    if self.fall_through {
                        // stay set for the next case
                    } else if self.peek(0).equals(case_value) {
                        self.pop(); // switch value
                        self.fall_through = true;
                    } else {
                        ip += offset;
                    }
                }

                OpCode::Enum => {
                    let name = read_string!();
                    let enum_obj = self.alloc_enum(name);
                    self.push(Value::object(enum_obj));
                }
                OpCode::EnumSetValue => {
                    let name = read_string!();
                    let value = self.peek(0);
                    let mut enum_obj = self
                        .peek(1)
                        .as_enum()
                        .expect("enum member targets are enums");
                    if enum_obj.values.set(name, value, true).is_err() {
                        rt_err!(
                            "Enum '{}' already has a member '{}'.",
                            enum_obj.name.as_str(),
                            name.as_str()
                        );
                    }
                    self.pop();
                }

                OpCode::Use => {
                    let name = read_string!();
                    self.frames[frame_index].ip = ip;
                    self.use_script(name, function)?;
                    refresh_frame!();
                }
                OpCode::UseVar => {
                    let Some(script) = self.last_script else {
                        rt_err!("No script has been imported.");
                    };
                    self.push(Value::object(script));
                }
                OpCode::UseBuiltin => {
                    let index = read_byte!() as usize;
                    let name = read_string!();
                    self.frames[frame_index].ip = ip;

                    if let Some(cached) = self.scripts.get(name) {
                        self.push(cached);
                    } else {
                        let Some((_, factory)) = self.libs.get(index) else {
                            rt_err!("Unknown builtin library '{}'.", name.as_str());
                        };
                        let factory = *factory;
                        let value = match factory(self) {
                            Ok(value) => value,
                            Err(message) => rt_err!("{message}"),
                        };
                        self.push(value);
                        let _ = self.scripts.set(name, value, false);
                        debug!(library = name.as_str(), "builtin library loaded");
                    }
                }
                OpCode::UseBuiltinVar => {
                    let lib_name = read_string!();
                    let count = read_byte!() as usize;
                    let Some(script) = self.scripts.get(lib_name).and_then(|v| v.as_script())
                    else {
                        rt_err!("Library '{}' has not been imported.", lib_name.as_str());
                    };
                    for _ in 0..count {
                        let var_name = read_string!();
                        let Some(value) = script.values.get(var_name) else {
                            rt_err!(
                                "'{}' can't be found in library '{}'.",
                                var_name.as_str(),
                                script.name.as_str()
                            );
                        };
                        self.push(value);
                    }
                }
                OpCode::UseEnd => {
                    self.last_script = Some(function.script);
                }

                OpCode::Break => {} // marker before a patched jump

                OpCode::NewArray => {
                    let count = read_byte!() as usize;
                    let base = self.stack.len() - count;
                    let array = self.alloc_array(Vec::with_capacity(count));
                    self.push(Value::object(array));
                    let mut array = array;
                    for i in 0..count {
                        array.data.push(self.stack[base + i]);
                    }
                    self.stack.truncate(base);
                    self.push(Value::object(array));
                }
                OpCode::NewMap => {
                    let count = read_byte!() as usize;
                    let base = self.stack.len() - count * 2;
                    let map = self.alloc_map();
                    self.push(Value::object(map));
                    let mut map = map;
                    for i in 0..count {
                        let key = self.stack[base + 2 * i];
                        let value = self.stack[base + 2 * i + 1];
                        if !key.is_valid_key() {
                            rt_err!(
                                "Expect string or number for key but got '{}'.",
                                key.type_name()
                            );
                        }
                        map.data.set(key, value);
                    }
                    self.stack.truncate(base);
                    self.push(Value::object(map));
                }
                OpCode::NewSet => {
                    let count = read_byte!() as usize;
                    let base = self.stack.len() - count;
                    let set = self.alloc_set();
                    self.push(Value::object(set));
                    let mut set = set;
                    for i in 0..count {
                        let value = self.stack[base + i];
                        if !value.is_valid_key() {
                            rt_err!(
                                "Expect string or number for value but got '{}'.",
                                value.type_name()
                            );
                        }
                        set.data.add(value);
                    }
                    self.stack.truncate(base);
                    self.push(Value::object(set));
                }

                OpCode::Index => {
                    let index_value = self.peek(0);
                    let receiver = self.peek(1);
                    if !receiver.is_obj() {
                        rt_err!("Type '{}' is not indexable.", receiver.type_name());
                    }

                    match receiver.as_obj() {
                        ObjRef::Array(array) => {
                            if !index_value.is_number() {
                                rt_err!("Array index must be a number.");
                            }
                            let raw = index_value.as_number();
                            let Some(index) = normalize_index(raw, array.data.len()) else {
                                rt_err!("Array index '{}' out of bounds.", raw as i64);
                            };
                            let value = array.data[index];
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        ObjRef::String(string) => {
                            if !index_value.is_number() {
                                rt_err!("String index must be a number.");
                            }
                            let raw = index_value.as_number();
                            let chars: Vec<char> = string.as_str().chars().collect();
                            let Some(index) = normalize_index(raw, chars.len()) else {
                                rt_err!("String index '{}' out of bounds.", raw as i64);
                            };
                            let one = chars[index].to_string();
                            let interned = self.intern(&one);
                            self.pop();
                            self.pop();
                            self.push(Value::object(interned));
                        }
                        ObjRef::Map(map) => {
                            if !index_value.is_valid_key() {
                                rt_err!(
                                    "Expect string or number for key but got '{}'.",
                                    index_value.type_name()
                                );
                            }
                            self.pop();
                            self.pop();
                            match map.data.get(index_value) {
                                Some(value) => self.push(value),
                                None => self.push(Value::NULL),
                            }
                        }
                        _ => rt_err!("Type '{}' is not indexable.", receiver.type_name()),
                    }
                }
                OpCode::IndexAssign => {
                    let assign_value = self.peek(0);
                    let index_value = self.peek(1);
                    let receiver = self.peek(2);
                    if !receiver.is_obj() {
                        rt_err!("Type '{}' is not indexable.", receiver.type_name());
                    }

                    match receiver.as_obj() {
                        ObjRef::Array(mut array) => {
                            if !index_value.is_number() {
                                rt_err!("Array index must be a number.");
                            }
                            let raw = index_value.as_number();
                            let Some(index) = normalize_index(raw, array.data.len()) else {
                                rt_err!("Array index '{}' out of bounds.", raw as i64);
                            };
                            array.data[index] = assign_value;
                            self.stack.truncate(self.stack.len() - 3);
                            self.push(Value::NULL);
                        }
                        ObjRef::String(_) => {
                            rt_err!("Strings are immutable.");
                        }
                        ObjRef::Map(mut map) => {
                            if !index_value.is_valid_key() {
                                rt_err!(
                                    "Expect string or number for key but got '{}'.",
                                    index_value.type_name()
                                );
                            }
                            map.data.set(index_value, assign_value);
                            self.stack.truncate(self.stack.len() - 3);
                            self.push(Value::NULL);
                        }
                        _ => rt_err!("Type '{}' is not indexable.", receiver.type_name()),
                    }
                }
                OpCode::IndexPush => {
                    let push_value = self.peek(0);
                    let index_value = self.peek(1);
                    let receiver = self.peek(2);
                    if !receiver.is_obj() {
                        rt_err!("Type '{}' is not indexable.", receiver.type_name());
                    }

                    match receiver.as_obj() {
                        ObjRef::Array(array) => {
                            if !index_value.is_number() {
                                rt_err!("Array index must be a number.");
                            }
                            let raw = index_value.as_number();
                            let Some(index) = normalize_index(raw, array.data.len()) else {
                                rt_err!("Array index '{}' out of bounds.", raw as i64);
                            };
                            let current = array.data[index];
                            let top = self.stack.len() - 1;
                            self.stack[top] = current;
                            self.push(push_value);
                        }
                        ObjRef::Map(map) => {
                            if !index_value.is_valid_key() {
                                rt_err!(
                                    "Expect string or number for key but got '{}'.",
                                    index_value.type_name()
                                );
                            }
                            let current = map.data.get(index_value).unwrap_or(Value::NULL);
                            let top = self.stack.len() - 1;
                            self.stack[top] = current;
                            self.push(push_value);
                        }
                        _ => rt_err!("Type '{}' is not indexable.", receiver.type_name()),
                    }
                }

                OpCode::Slice => {
                    let end_value = self.peek(0);
                    let start_value = self.peek(1);
                    let receiver = self.peek(2);

                    if !receiver.is_obj() {
                        rt_err!("Type '{}' is not sliceable.", receiver.type_name());
                    }
                    if !start_value.is_number() && !start_value.is_empty() {
                        rt_err!("Slice start index must be a number.");
                    }
                    if !end_value.is_number() && !end_value.is_empty() {
                        rt_err!("Slice end index must be a number.");
                    }

                    let start = if start_value.is_empty() {
                        0
                    } else {
                        (start_value.as_number() as i64).max(0) as usize
                    };

                    let result = match receiver.as_obj() {
                        ObjRef::Array(array) => {
                            let end = slice_end(end_value, array.data.len());
                            let data: Vec<Value> = if start >= end {
                                Vec::new()
                            } else {
                                array.data[start..end].to_vec()
                            };
                            let sliced = self.alloc_array(data);
                            Value::object(sliced)
                        }
                        ObjRef::String(string) => {
                            let chars: Vec<char> = string.as_str().chars().collect();
                            let end = slice_end(end_value, chars.len());
                            let text: String = if start >= end {
                                String::new()
                            } else {
                                chars[start..end].iter().collect()
                            };
                            let interned = self.intern(&text);
                            Value::object(interned)
                        }
                        _ => rt_err!("Type '{}' is not sliceable.", receiver.type_name()),
                    };

                    self.stack.truncate(self.stack.len() - 3);
                    self.push(result);
                }

                OpCode::OpenFile => {
                    let flags = self.peek(0);
                    let name = self.peek(1);
                    let Some(flags) = flags.as_string() else {
                        rt_err!("File flag must be a string got '{}'.", flags.type_name());
                    };
                    let Some(name) = name.as_string() else {
                        rt_err!("File name must be a string got '{}'.", name.type_name());
                    };

                    let path = name.as_str().to_string();
                    let mode = flags.as_str().to_string();
                    let file = match open_file(&path, &mode) {
                        Ok(file) => file,
                        Err(_) => rt_err!("Unable to open file '{path}'."),
                    };
                    let file_obj = self.alloc_file(file, path, mode);
                    self.pop();
                    self.pop();
                    self.push(Value::object(file_obj));
                }
                OpCode::CloseFile => {
                    let slot = read_short!() as usize;
                    let value = self.stack[slots + slot];
                    let Some(mut file) = value.as_file() else {
                        rt_err!("withFile binding is not a file.");
                    };
                    file.file = None; // dropping the handle closes it
                }

                OpCode::DefineDefault => {
                    let arity = read_byte!() as usize;
                    let arity_default = read_byte!() as usize;
                    // Supplied args sit below the freshly evaluated
                    // defaults; drop the defaults the caller overrode.
                    let argc = self.stack.len() - slots - arity_default - 1;
                    let defaults_start = self.stack.len() - arity_default;
                    let overridden = argc - arity;
                    self.stack
                        .drain(defaults_start..defaults_start + overridden);
                }
            }
        }
    }

    // =========================================================================
    // Opcode helpers
    // =========================================================================

    fn concat(&mut self) {
        let b = self.peek(0).as_string().expect("checked by caller");
        let a = self.peek(1).as_string().expect("checked by caller");
        let joined = format!("{}{}", a.as_str(), b.as_str());
        let interned = self.intern(&joined);
        self.pop();
        self.pop();
        self.push(Value::object(interned));
    }

    fn create_class(
        &mut self,
        name: Gc<ObjString>,
        super_class: Option<Gc<ObjClass>>,
        kind: ClassKind,
    ) {
        let class = self.alloc_class(name, super_class, kind);
        self.push(Value::object(class));

        if let Some(superclass) = super_class {
            let mut class = class;
            class.methods.add_all(&superclass.methods);
            class.abstract_methods.add_all(&superclass.abstract_methods);
            class.fields.add_all(&superclass.fields);
            class.private_fields.add_all(&superclass.private_fields);
        }
    }

    fn define_method(&mut self, name: Gc<ObjString>) {
        let method = self.peek(0);
        let mut class = self
            .peek(1)
            .as_class()
            .expect("methods are defined on the class being declared");
        let closure = method.as_closure().expect("methods are closures");

        use ilex_core::AccessLevel;
        let proto = &closure.function.proto;
        let table = if proto.access == AccessLevel::Private {
            &mut class.private_methods
        } else if proto.kind == FunctionKind::Abstract {
            &mut class.abstract_methods
        } else {
            &mut class.methods
        };
        // Writable so subclasses can override entries copied from their
        // superclass.
        let _ = table.set(name, method, false);
        self.pop();
    }

    /// `OP_USE`: resolve against the importing script's directory, reuse
    /// the cache, or read + compile + run the module in a new frame.
    fn use_script(
        &mut self,
        name: Gc<ObjString>,
        importer: Gc<ObjFunction>,
    ) -> Result<(), VmError> {
        let raw = name.as_str().to_string();
        let with_ext = if raw.ends_with(".ilex") {
            raw
        } else {
            format!("{raw}.ilex")
        };

        let importer_dir = importer.script.path.as_str().to_string();
        let candidate = if Path::new(&with_ext).is_absolute() {
            std::path::PathBuf::from(&with_ext)
        } else {
            Path::new(&importer_dir).join(&with_ext)
        };

        let resolved = match std::fs::canonicalize(&candidate) {
            Ok(path) => path,
            Err(_) => {
                let message = format!("Could not open file '{with_ext}'.");
                return Err(self.runtime_error(&message));
            }
        };
        let resolved_str = resolved.to_string_lossy().to_string();
        let resolved_name = self.intern(&resolved_str);
        self.push(Value::object(resolved_name));

        if let Some(cached) = self.scripts.get(resolved_name) {
            self.pop(); // resolved name
            self.last_script = cached.as_script();
            debug!(module = %resolved_str, "module cache hit");
            self.push(Value::NULL);
            return Ok(());
        }

        let source = match std::fs::read_to_string(&resolved) {
            Ok(source) => source,
            Err(_) => {
                self.pop();
                let message = format!("Could not open file '{with_ext}'.");
                return Err(self.runtime_error(&message));
            }
        };

        let dir = resolved
            .parent()
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        let dir_interned = self.intern(&dir);
        self.push(Value::object(dir_interned));

        let mut script = self.alloc_script(resolved_name, dir_interned);
        self.pop(); // dir
        self.pop(); // resolved name
        self.push(Value::object(script));

        let _ = self.scripts.set(resolved_name, Value::object(script), false);
        self.last_script = Some(script);

        let options = self.compiler_options();
        let proto = match ilex_compiler::compile(&source, &options) {
            Ok(proto) => proto,
            Err(err) => {
                self.pop();
                return Err(VmError::Compile(err));
            }
        };
        debug!(module = %resolved_str, "module compiled");

        let function = self.materialize_function(proto, script);
        self.push(Value::object(function));
        let closure = self.alloc_closure(function);
        self.pop(); // function
        self.pop(); // script
        self.push(Value::object(closure));
        script.used = true;

        self.call(closure, 0)
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Bitwise operands truncate to signed 32 bits.
fn to_int32(n: f64) -> i32 {
    n as i64 as i32
}

/// Negative indices count from the end; `-len` is the first element.
fn normalize_index(raw: f64, len: usize) -> Option<usize> {
    let mut index = raw as i64;
    if index < 0 {
        index += len as i64;
    }
    if index >= 0 && (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

/// An empty end bound means "to the end"; negatives count back from it.
fn slice_end(end_value: Value, len: usize) -> usize {
    if end_value.is_empty() {
        return len;
    }
    let end = end_value.as_number() as i64;
    if end > len as i64 {
        len
    } else if end < 0 {
        (len as i64 + end).max(0) as usize
    } else {
        end as usize
    }
}

fn open_file(path: &str, mode: &str) -> std::io::Result<std::fs::File> {
    use std::fs::OpenOptions;
    let mode = mode.replace('b', "");
    let mut options = OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "r+" => options.read(true).write(true),
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid file mode",
            ));
        }
    };
    options.open(path)
}

/// Directory a script resolves its imports against.
fn script_dir(script_path: &str) -> String {
    let path = Path::new(script_path);
    match std::fs::canonicalize(path) {
        Ok(absolute) => absolute
            .parent()
            .map(|d| d.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string()),
        Err(_) => {
            let parent = path.parent().map(|d| d.to_string_lossy().to_string());
            match parent {
                Some(dir) if !dir.is_empty() => dir,
                _ => ".".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> Vm {
        Vm::new(VmOptions::default())
    }

    fn stressed_vm() -> Vm {
        Vm::new(VmOptions::default().with_gc_stress(true))
    }

    fn run(vm: &mut Vm, source: &str) -> Result<Value, VmError> {
        vm.interpret("test", source)
    }

    #[test]
    fn arithmetic_expression() {
        let mut vm = vm();
        let result = run(&mut vm, "var x = (1 + 2) * 4 - 6 / 3;").unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn intern_makes_concat_equal_by_identity() {
        let mut vm = vm();
        let a = vm.intern("hi");
        let combined = format!("{}{}", "h", "i");
        let b = vm.intern(&combined);
        assert_eq!(a, b);
    }

    #[test]
    fn stack_discipline_is_flat_after_statements() {
        let mut vm = vm();
        run(
            &mut vm,
            "var a = 1; var b = a + 2; a = b * 2; { var c = a; }",
        )
        .unwrap();
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn open_upvalues_are_sorted_descending() {
        let mut vm = vm();
        // Holding closures over three distinct slots at once.
        run(
            &mut vm,
            r#"
            fn outer() {
                var a = 1;
                var b = 2;
                var c = 3;
                fn fa() { return a; }
                fn fb() { return b; }
                fn fc() { return c; }
                return fa() + fb() + fc();
            }
            var r = outer();
            "#,
        )
        .unwrap();
        // All upvalues are closed by now; the list must be empty.
        assert!(vm.open_upvalue_slots().is_empty());
    }

    #[test]
    fn gc_stress_survives_a_full_program() {
        let mut vm = stressed_vm();
        run(
            &mut vm,
            r#"
            fn make(n) {
                var items = [];
                for (var i = 0; i < n; i = i + 1) {
                    items.push("item" + toString(i));
                }
                return items;
            }
            var a = make(20);
            var b = make(20);
            assert(a.len() == 20);
            "#,
        )
        .unwrap();
        assert!(vm.heap.gc_runs > 0);
    }

    #[test]
    fn gc_preserves_reachable_values_across_collections() {
        let mut vm = vm();
        run(&mut vm, "var keep = \"survivor\";").unwrap();
        vm.collect_garbage();
        vm.collect_garbage();
        let key = vm.intern("keep");
        let script = vm.last_script.unwrap();
        let value = script.values.get(key).unwrap();
        assert_eq!(value.as_string().unwrap().as_str(), "survivor");
    }

    #[test]
    fn quiescent_collection_is_idempotent() {
        let mut vm = vm();
        run(&mut vm, "var x = [1, 2, 3];").unwrap();
        vm.collect_garbage();
        let after_first = vm.heap.bytes_allocated;
        vm.collect_garbage();
        assert_eq!(vm.heap.bytes_allocated, after_first);
    }

    #[test]
    fn call_function_value_reenters_the_loop() {
        let mut vm = vm();
        run(&mut vm, "fn double(x) { return x * 2; }").unwrap();
        let name = vm.intern("double");
        let script = vm.last_script.unwrap();
        let callee = script.values.get(name).unwrap();
        let result = vm
            .call_function_value(callee, &[Value::number(21.0)])
            .unwrap();
        assert_eq!(result.as_number(), 42.0);
    }

    #[test]
    fn runtime_error_resets_the_stack() {
        let mut vm = vm();
        vm.set_runtime_error_callback(|_| {});
        let err = run(&mut vm, "var x = 1 + \"one\";").unwrap_err();
        assert_eq!(err.exit_code(), 114);
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }
}
