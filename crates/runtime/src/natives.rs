//! Native functions and the extension interface
//!
//! Embedders bind host functions and values into the VM through
//! `register_global_function` / `register_global_value` (read-only
//! globals), `register_library` (builtin `use` targets) and
//! `register_library_function`. Type methods — what `"abc".len()` or
//! `m.size()` dispatch to — live in per-type tables registered the same
//! way.
//!
//! A native returning `Err(message)` is reported as a runtime error and
//! unwinds the interpreter.

use std::io::{Read, Write};
use std::sync::OnceLock;
use std::time::Instant;

use ilex_core::ILEX_VERSION;

use crate::object::{Gc, NativeFn, ObjScript};
use crate::value::Value;
use crate::vm::Vm;

/// Which per-type method table to register into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTable {
    String,
    Array,
    Map,
    Set,
    File,
    Enum,
}

/// Where a registered native lands.
enum NativeTarget {
    Globals,
    Type(TypeTable),
    Library(Gc<ObjScript>),
}

impl Vm {
    pub fn register_global_function(&mut self, name: &str, function: NativeFn) {
        self.define_native(name, function, NativeTarget::Globals);
    }

    pub fn register_global_value(&mut self, name: &str, value: Value) {
        self.push(value);
        let name_interned = self.intern(name);
        self.push(Value::object(name_interned));
        let _ = self.globals.set(name_interned, value, true);
        self.pop();
        self.pop();
    }

    /// Bind a native into a library script's export table.
    pub fn register_library_function(
        &mut self,
        name: &str,
        function: NativeFn,
        library: Gc<ObjScript>,
    ) {
        self.define_native(name, function, NativeTarget::Library(library));
    }

    pub fn register_type_function(&mut self, table: TypeTable, name: &str, function: NativeFn) {
        self.define_native(name, function, NativeTarget::Type(table));
    }

    fn define_native(&mut self, name: &str, function: NativeFn, target: NativeTarget) {
        let name_interned = self.intern(name);
        self.push(Value::object(name_interned));
        let native = self.alloc_native(function);
        self.push(Value::object(native));

        let value = Value::object(native);
        let table = match target {
            NativeTarget::Globals => &mut self.globals,
            NativeTarget::Type(TypeTable::String) => &mut self.string_methods,
            NativeTarget::Type(TypeTable::Array) => &mut self.array_methods,
            NativeTarget::Type(TypeTable::Map) => &mut self.map_methods,
            NativeTarget::Type(TypeTable::Set) => &mut self.set_methods,
            NativeTarget::Type(TypeTable::File) => &mut self.file_methods,
            NativeTarget::Type(TypeTable::Enum) => &mut self.enum_methods,
            NativeTarget::Library(script) => {
                let _ = {
                    let mut script = script;
                    script.values.set(name_interned, value, true)
                };
                self.pop();
                self.pop();
                return;
            }
        };
        let _ = table.set(name_interned, value, true);

        self.pop();
        self.pop();
    }
}

/// Register the baseline natives every VM starts with.
pub(crate) fn install(vm: &mut Vm) {
    vm.register_global_function("println", native_println);
    vm.register_global_function("print", native_print);
    vm.register_global_function("typeof", native_typeof);
    vm.register_global_function("toString", native_to_string);
    vm.register_global_function("seconds", native_seconds);
    vm.register_global_function("milliseconds", native_milliseconds);
    vm.register_global_function("collectGarbage", native_collect_garbage);
    vm.register_global_function("ilexVersion", native_version);
    vm.register_global_function("ilexVersionMajor", native_version_major);
    vm.register_global_function("ilexVersionMinor", native_version_minor);
    vm.register_global_function("isTestMode", native_is_test_mode);

    vm.register_type_function(TypeTable::String, "len", string_len);
    vm.register_type_function(TypeTable::String, "upper", string_upper);
    vm.register_type_function(TypeTable::String, "lower", string_lower);
    vm.register_type_function(TypeTable::String, "contains", string_contains);
    vm.register_type_function(TypeTable::String, "toString", any_to_string);

    vm.register_type_function(TypeTable::Array, "len", array_len);
    vm.register_type_function(TypeTable::Array, "push", array_push);
    vm.register_type_function(TypeTable::Array, "pop", array_pop);
    vm.register_type_function(TypeTable::Array, "contains", array_contains);
    vm.register_type_function(TypeTable::Array, "toString", any_to_string);

    vm.register_type_function(TypeTable::Map, "size", map_size);
    vm.register_type_function(TypeTable::Map, "exists", map_exists);
    vm.register_type_function(TypeTable::Map, "delete", map_delete);
    vm.register_type_function(TypeTable::Map, "keys", map_keys);
    vm.register_type_function(TypeTable::Map, "toString", any_to_string);

    vm.register_type_function(TypeTable::Set, "size", set_size);
    vm.register_type_function(TypeTable::Set, "add", set_add);
    vm.register_type_function(TypeTable::Set, "delete", set_delete);
    vm.register_type_function(TypeTable::Set, "contains", set_contains);
    vm.register_type_function(TypeTable::Set, "toString", any_to_string);

    vm.register_type_function(TypeTable::File, "read", file_read);
    vm.register_type_function(TypeTable::File, "readLine", file_read_line);
    vm.register_type_function(TypeTable::File, "write", file_write);

    vm.register_type_function(TypeTable::Enum, "toString", any_to_string);
}

// =============================================================================
// Globals
// =============================================================================

fn print_joined(vm: &mut Vm, args: &[Value], newline: bool) -> Result<Value, String> {
    let text = args
        .iter()
        .map(|v| v.display())
        .collect::<Vec<_>>()
        .join(" ");
    let result = if newline {
        writeln!(vm.out, "{text}")
    } else {
        write!(vm.out, "{text}")
    };
    result.map_err(|e| format!("Could not write output: {e}."))?;
    Ok(Value::number(0.0))
}

fn native_println(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    print_joined(vm, args, true)
}

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    print_joined(vm, args, false)
}

fn native_typeof(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err(format!(
            "Function typeof() expected 1 argument but got {}.",
            args.len()
        ));
    }
    let name = vm.intern(args[0].type_name());
    Ok(Value::object(name))
}

fn native_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err(format!(
            "Function toString() expected 1 argument but got {}.",
            args.len()
        ));
    }
    let text = args[0].display();
    let interned = vm.intern(&text);
    Ok(Value::object(interned))
}

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn native_seconds(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(process_start().elapsed().as_secs_f64()))
}

fn native_milliseconds(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(
        process_start().elapsed().as_secs_f64() * 1000.0,
    ))
}

fn native_collect_garbage(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    vm.collect_garbage();
    Ok(Value::NULL)
}

fn native_version(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    let version = vm.intern(ILEX_VERSION);
    Ok(Value::object(version))
}

fn version_component(index: usize) -> f64 {
    ILEX_VERSION
        .split('.')
        .nth(index)
        .and_then(|part| part.parse().ok())
        .unwrap_or(0.0)
}

fn native_version_major(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(version_component(0)))
}

fn native_version_minor(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(version_component(1)))
}

fn native_is_test_mode(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::boolean(vm.is_test_mode()))
}

// =============================================================================
// Type methods (receiver arrives as args[0])
// =============================================================================

fn expect_args(name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() - 1 != expected {
        return Err(format!(
            "Function {name}() expected {expected} argument{} but got {}.",
            if expected == 1 { "" } else { "s" },
            args.len() - 1
        ));
    }
    Ok(())
}

fn any_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let text = args[0].display();
    let interned = vm.intern(&text);
    Ok(Value::object(interned))
}

fn string_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let string = args[0].as_string().expect("receiver is a string");
    Ok(Value::number(string.as_str().chars().count() as f64))
}

fn string_upper(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let string = args[0].as_string().expect("receiver is a string");
    let upper = string.as_str().to_uppercase();
    let interned = vm.intern(&upper);
    Ok(Value::object(interned))
}

fn string_lower(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let string = args[0].as_string().expect("receiver is a string");
    let lower = string.as_str().to_lowercase();
    let interned = vm.intern(&lower);
    Ok(Value::object(interned))
}

fn string_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("contains", args, 1)?;
    let string = args[0].as_string().expect("receiver is a string");
    let Some(needle) = args[1].as_string() else {
        return Err(format!(
            "Function contains() expected type 'string' for first argument but got '{}'.",
            args[1].type_name()
        ));
    };
    Ok(Value::boolean(string.as_str().contains(needle.as_str())))
}

fn array_len(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let array = args[0].as_array().expect("receiver is an array");
    Ok(Value::number(array.data.len() as f64))
}

fn array_push(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut array = args[0].as_array().expect("receiver is an array");
    for value in &args[1..] {
        array.data.push(*value);
    }
    Ok(Value::NULL)
}

fn array_pop(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut array = args[0].as_array().expect("receiver is an array");
    match array.data.pop() {
        Some(value) => Ok(value),
        None => Err("Cannot pop() from an empty array.".to_string()),
    }
}

fn array_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("contains", args, 1)?;
    let array = args[0].as_array().expect("receiver is an array");
    Ok(Value::boolean(
        array.data.iter().any(|v| v.equals(args[1])),
    ))
}

fn check_key(name: &str, key: Value) -> Result<(), String> {
    if !key.is_valid_key() {
        return Err(format!(
            "Function {name}() expects a string or number key but got '{}'.",
            key.type_name()
        ));
    }
    Ok(())
}

fn map_size(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let map = args[0].as_map().expect("receiver is a map");
    Ok(Value::number(map.data.len() as f64))
}

fn map_exists(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("exists", args, 1)?;
    check_key("exists", args[1])?;
    let map = args[0].as_map().expect("receiver is a map");
    Ok(Value::boolean(map.data.has_key(args[1])))
}

fn map_delete(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("delete", args, 1)?;
    check_key("delete", args[1])?;
    let mut map = args[0].as_map().expect("receiver is a map");
    Ok(Value::boolean(map.data.delete(args[1])))
}

fn map_keys(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let map = args[0].as_map().expect("receiver is a map");
    let keys: Vec<Value> = map.data.iter().map(|(k, _)| k).collect();
    let array = vm.alloc_array(keys);
    Ok(Value::object(array))
}

fn set_size(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let set = args[0].as_set().expect("receiver is a set");
    Ok(Value::number(set.data.len() as f64))
}

fn set_add(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("add", args, 1)?;
    check_key("add", args[1])?;
    let mut set = args[0].as_set().expect("receiver is a set");
    Ok(Value::boolean(set.data.add(args[1])))
}

fn set_delete(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("delete", args, 1)?;
    check_key("delete", args[1])?;
    let mut set = args[0].as_set().expect("receiver is a set");
    Ok(Value::boolean(set.data.delete(args[1])))
}

fn set_contains(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("contains", args, 1)?;
    check_key("contains", args[1])?;
    let set = args[0].as_set().expect("receiver is a set");
    Ok(Value::boolean(set.data.contains(args[1])))
}

fn file_read(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut file_obj = args[0].as_file().expect("receiver is a file");
    let path = file_obj.path.clone();
    let Some(file) = file_obj.file.as_mut() else {
        return Err(format!("File '{path}' is closed."));
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| format!("Could not read file '{path}': {e}."))?;
    let interned = vm.intern(&contents);
    Ok(Value::object(interned))
}

fn file_read_line(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut file_obj = args[0].as_file().expect("receiver is a file");
    let path = file_obj.path.clone();
    let Some(file) = file_obj.file.as_mut() else {
        return Err(format!("File '{path}' is closed."));
    };

    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
            }
            Err(e) => return Err(format!("Could not read file '{path}': {e}.")),
        }
    }

    if line.is_empty() {
        return Ok(Value::NULL);
    }
    let text = String::from_utf8_lossy(&line).to_string();
    let interned = vm.intern(&text);
    Ok(Value::object(interned))
}

fn file_write(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    expect_args("write", args, 1)?;
    let Some(text) = args[1].as_string() else {
        return Err(format!(
            "Function write() expected type 'string' for first argument but got '{}'.",
            args[1].type_name()
        ));
    };

    let mut file_obj = args[0].as_file().expect("receiver is a file");
    let path = file_obj.path.clone();
    let Some(file) = file_obj.file.as_mut() else {
        return Err(format!("File '{path}' is closed."));
    };
    file.write_all(text.as_str().as_bytes())
        .map_err(|e| format!("Could not write file '{path}': {e}."))?;
    Ok(Value::number(text.as_str().len() as f64))
}
