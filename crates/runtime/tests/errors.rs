//! Error-channel behavior: kinds, exit codes, arity and const
//! enforcement, and the invariants the interpreter promises.

mod common;

use common::{run_err, run_ok, TestVm};
use ilex_runtime::VmError;

#[test]
fn undefined_variable_is_a_runtime_error() {
    let err = run_err("println(missing);");
    assert_eq!(err.exit_code(), 114);
    assert!(err.to_string().contains("Undefined variable 'missing'"), "{err}");
}

#[test]
fn arity_too_few_never_enters_the_body() {
    let err = run_err(
        r#"
        var entered = false;
        fn f(a, b) { entered = true; }
        f(1);
        "#,
    );
    assert!(err.to_string().contains("expected 2 arguments but got 1"), "{err}");
}

#[test]
fn arity_too_many_counts_defaults() {
    let err = run_err(
        r#"
        fn f(a, b = 1) {}
        f(1, 2, 3);
        "#,
    );
    assert!(err.to_string().contains("expected 2 arguments but got 3"), "{err}");
}

#[test]
fn arity_within_default_range_is_accepted() {
    let out = run_ok(
        r#"
        fn f(a, b = 10) { return a + b; }
        println(f(1));
        println(f(1, 2));
        "#,
    );
    assert_eq!(out, "11\n3\n");
}

#[test]
fn const_script_variable_cannot_be_reassigned() {
    let err = run_err("const LIMIT = 5; LIMIT = 6;");
    assert_eq!(err.exit_code(), 114);
    assert!(err.to_string().contains("readonly"), "{err}");
}

#[test]
fn const_via_double_colon_equals_is_protected_too() {
    let err = run_err("LIMIT ::= 5; LIMIT = 6;");
    assert!(err.to_string().contains("readonly"), "{err}");
}

#[test]
fn const_script_value_is_still_readable() {
    let out = run_ok("const LIMIT = 5; println(LIMIT + 1);");
    assert_eq!(out, "6\n");
}

#[test]
fn script_const_blocks_property_writes_from_importers() {
    use std::io::Write as _;
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("cfg.ilex");
    write!(
        std::fs::File::create(&lib).unwrap(),
        "const MAX = 9;\n"
    )
    .unwrap();
    let main = dir.path().join("main.ilex");
    write!(
        std::fs::File::create(&main).unwrap(),
        "use \"cfg\";\ncfg.MAX = 10;\n"
    )
    .unwrap();

    let mut t = TestVm::new();
    let source = std::fs::read_to_string(&main).unwrap();
    let err = t
        .vm
        .interpret(&main.to_string_lossy(), &source)
        .unwrap_err();
    assert!(err.to_string().contains("const"), "{err}");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let err = run_err(
        r#"
        fn spin(n) { return spin(n + 1); }
        spin(0);
        "#,
    );
    assert!(err.to_string().contains("Stack overflow"), "{err}");
}

#[test]
fn error_kinds_map_to_exit_codes() {
    assert_eq!(run_err("panic!(\"p\");").exit_code(), 112);
    assert_eq!(run_err("assert(false);").exit_code(), 97);
    assert_eq!(run_err("var x = 1 + \"s\";").exit_code(), 114);

    let mut t = TestVm::new();
    let err = t.run("var = broken").unwrap_err();
    assert_eq!(err.exit_code(), 99);
    assert!(matches!(err, VmError::Compile(_)));
}

#[test]
fn compile_errors_report_line_and_token() {
    let mut t = TestVm::new();
    let err = t.run("var x = ;\n").unwrap_err();
    let text = err.to_string();
    assert!(text.contains("[line 1]"), "{text}");
    assert!(text.contains("Expect expression"), "{text}");
}

#[test]
fn errors_after_an_error_are_not_reported_in_cascade() {
    let mut t = TestVm::new();
    let err = t.run("var x = ;\nvar y = ;\n").unwrap_err();
    let VmError::Compile(compile) = err else {
        panic!("expected compile error");
    };
    // Panic-mode recovery resynchronizes at the statement boundary, so
    // both statements report once each, not a cascade per token.
    assert_eq!(compile.messages.len(), 2, "{compile:?}");
}

#[test]
fn runtime_error_message_reaches_the_callback_not_stderr_formatting() {
    let mut t = TestVm::new();
    t.run("var a = [1]; var x = a[9];").unwrap_err();
    let reported = t.reported_errors().join("");
    assert!(reported.starts_with("Runtime Error: "), "{reported}");
    assert!(!reported.contains('\x1b'), "callback text keeps ANSI out: {reported}");
}

#[test]
fn native_arity_errors_surface_as_runtime_errors() {
    let err = run_err("typeof(1, 2);");
    assert!(err.to_string().contains("expected 1 argument"), "{err}");
}

#[test]
fn invoking_a_missing_type_method_names_the_type() {
    let err = run_err("var a = [1]; a.frobnicate();");
    assert!(err.to_string().contains("Array has no function frobnicate()"), "{err}");
}

#[test]
fn indexing_a_number_faults() {
    let err = run_err("var x = 5; var y = x[0];");
    assert!(err.to_string().contains("not indexable"), "{err}");
}

#[test]
fn there_is_no_recovery_after_a_runtime_error() {
    let mut t = TestVm::new();
    t.run("var x = 1 + \"one\"; println(\"unreached\");")
        .unwrap_err();
    assert_eq!(t.output(), "");
}
