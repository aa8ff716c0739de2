//! Module loading: `use` resolution, the script cache, builtin
//! libraries and the extension interface.

mod common;

use std::io::Write as _;

use common::TestVm;
use ilex_runtime::{Value, Vm};

fn write_file(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "{contents}").unwrap();
    path
}

fn run_main(dir: &std::path::Path, source: &str) -> (TestVm, Result<Value, ilex_runtime::VmError>) {
    let main_path = write_file(dir, "main.ilex", source);
    let mut t = TestVm::new();
    let source = std::fs::read_to_string(&main_path).unwrap();
    let result = t.vm.interpret(&main_path.to_string_lossy(), &source);
    (t, result)
}

#[test]
fn importing_a_sibling_script() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "lib.ilex",
        "var greeting = \"hello from lib\";\nfn shout() { return greeting; }\n",
    );

    let (t, result) = run_main(
        dir.path(),
        "use \"lib\";\nprintln(lib.greeting);\nprintln(lib.shout());\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "hello from lib\nhello from lib\n");
}

#[test]
fn modules_are_compiled_and_run_once() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "lib.ilex",
        "var counter = 0;\ncounter = counter + 1;\n",
    );

    let (t, result) = run_main(
        dir.path(),
        "use \"lib\";\nuse \"lib\";\nprintln(lib.counter);\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "1\n");
}

#[test]
fn both_spellings_share_one_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "lib.ilex",
        "var counter = 0;\ncounter = counter + 1;\n",
    );

    // With and without extension resolve to the same canonical path.
    let (t, result) = run_main(
        dir.path(),
        "use \"lib\";\nuse \"lib.ilex\" as again;\nprintln(lib.counter);\nprintln(again.counter);\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "1\n1\n");
}

#[test]
fn use_as_renames_the_binding() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "util.ilex", "var answer = 42;\n");

    let (t, result) = run_main(
        dir.path(),
        "use \"util\" as u;\nprintln(u.answer);\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "42\n");
}

#[test]
fn use_from_imports_names_directly() {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        dir.path(),
        "math2.ilex",
        "var pi = 3.25;\nfn double(x) { return x * 2; }\n",
    );

    let (t, result) = run_main(
        dir.path(),
        "use { pi, double } from \"math2\";\nprintln(pi);\nprintln(double(4));\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "3.25\n8\n");
}

#[test]
fn imports_resolve_against_the_importing_script() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("nested");
    std::fs::create_dir(&nested).unwrap();
    write_file(&nested, "inner.ilex", "var tag = \"inner\";\n");
    write_file(
        dir.path(),
        "outer.ilex",
        "use \"nested/inner\";\nvar tag = inner.tag;\n",
    );

    let (t, result) = run_main(
        dir.path(),
        "use \"outer\";\nprintln(outer.tag);\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "inner\n");
}

#[test]
fn module_mutation_is_visible_through_the_script_object() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "state.ilex", "var value = 1;\n");

    let (t, result) = run_main(
        dir.path(),
        "use \"state\";\nstate.value = 10;\nprintln(state.value);\n",
    );
    result.unwrap();
    assert_eq!(t.output(), "10\n");
}

#[test]
fn missing_module_is_a_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let (_, result) = run_main(dir.path(), "use \"nowhere\";\n");
    let err = result.unwrap_err();
    assert!(err.to_string().contains("Could not open file 'nowhere.ilex'"));
}

#[test]
fn compile_errors_in_modules_propagate() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "broken.ilex", "var = ;\n");

    let (_, result) = run_main(dir.path(), "use \"broken\";\n");
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 99);
}

#[test]
fn runtime_errors_in_modules_propagate() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "explode.ilex", "var x = 1 + \"one\";\n");

    let (_, result) = run_main(dir.path(), "use \"explode\";\n");
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 114);
}

// =============================================================================
// Builtin libraries via the extension interface
// =============================================================================

fn answer(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(42.0))
}

fn failing(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Err("this native always fails".to_string())
}

fn testlib_factory(vm: &mut Vm) -> Result<Value, String> {
    let library = vm.new_library("testlib");
    vm.register_library_function("answer", answer, library);
    vm.register_library_function("failing", failing, library);
    Ok(Value::object(library))
}

#[test]
fn builtin_libraries_load_by_name() {
    let mut t = TestVm::new();
    t.vm.register_library("testlib", testlib_factory);

    t.run("use \"testlib\";\nprintln(testlib.answer());\n")
        .unwrap();
    assert_eq!(t.output(), "42\n");
}

#[test]
fn builtin_libraries_are_cached() {
    let mut t = TestVm::new();
    t.vm.register_library("testlib", testlib_factory);

    t.run(
        "use \"testlib\";\nuse \"testlib\" as again;\nprintln(testlib.answer() == again.answer());\n",
    )
    .unwrap();
    assert_eq!(t.output(), "true\n");
}

#[test]
fn use_from_builtin_imports_named_functions() {
    let mut t = TestVm::new();
    t.vm.register_library("testlib", testlib_factory);

    t.run("use { answer } from \"testlib\";\nprintln(answer());\n")
        .unwrap();
    assert_eq!(t.output(), "42\n");
}

#[test]
fn native_error_results_become_runtime_errors() {
    let mut t = TestVm::new();
    t.vm.register_library("testlib", testlib_factory);

    let err = t
        .run("use \"testlib\";\ntestlib.failing();\n")
        .unwrap_err();
    assert_eq!(err.exit_code(), 114);
    assert!(err.to_string().contains("this native always fails"));
}

#[test]
fn registered_globals_are_read_only() {
    let mut t = TestVm::new();
    t.vm.register_global_value("limit", Value::number(10.0));

    t.run("println(limit);").unwrap();
    assert_eq!(t.output(), "10\n");

    let err = t.run("limit = 11;").unwrap_err();
    assert!(err.to_string().contains("readonly"), "{err}");
}

#[test]
fn registered_global_functions_are_callable() {
    let mut t = TestVm::new();
    t.vm.register_global_function("answer", answer);

    t.run("println(answer() + 1);").unwrap();
    assert_eq!(t.output(), "43\n");
}
