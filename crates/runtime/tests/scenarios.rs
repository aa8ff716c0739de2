//! End-to-end behavior of whole programs, observed through `println`.

mod common;

use common::{run_err, run_ok, TestVm};
use ilex_runtime::VmError;

#[test]
fn closures_capture_and_share_state() {
    let out = run_ok(
        r#"
        fn make() {
            var i = 0;
            fn inc() {
                i = i + 1;
                return i;
            }
            return inc;
        }
        var f = make();
        println(f());
        println(f());
        println(f());
        "#,
    );
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn interned_strings_compare_equal_after_concatenation() {
    let out = run_ok(
        r#"
        var a = "hi";
        var b = "h" + "i";
        println(a == b);
        "#,
    );
    assert_eq!(out, "true\n");
}

#[test]
fn switch_with_explicit_fall_through() {
    let out = run_ok(
        r#"
        var x = 2;
        switch (x) {
            case 1:
                println("one");
            case 2:
                println("two");
                continue;
            case 3:
                println("three");
            default:
                println("other");
        }
        "#,
    );
    assert_eq!(out, "two\nthree\n");
}

#[test]
fn switch_without_fall_through() {
    let out = run_ok(
        r#"
        var x = 2;
        switch (x) {
            case 1:
                println("one");
            case 2:
                println("two");
            case 3:
                println("three");
            default:
                println("other");
        }
        "#,
    );
    assert_eq!(out, "two\n");
}

#[test]
fn switch_default_runs_when_nothing_matches() {
    let out = run_ok(
        r#"
        switch (9) {
            case 1: println("one");
            case 2: println("two");
            default: println("other");
        }
        "#,
    );
    assert_eq!(out, "other\n");
}

#[test]
fn switch_multi_value_case() {
    let out = run_ok(
        r#"
        fn label(x) {
            switch (x) {
                case 1, 2, 3: return "small";
                case 4, 5: return "medium";
                default: return "large";
            }
        }
        println(label(2));
        println(label(5));
        println(label(9));
        "#,
    );
    assert_eq!(out, "small\nmedium\nlarge\n");
}

#[test]
fn large_map_survives_churn_and_collection() {
    // Scaled-down form of the stress scenario: enough keys to force
    // several collections, half deleted, then an explicit collection
    // with spot checks.
    let out = run_ok(
        r#"
        var m = {};
        var n = 20000;
        for (var i = 0; i < n; i = i + 1) {
            m["k" + toString(i)] = i;
        }
        for (var i = 0; i < n; i = i + 2) {
            m.delete("k" + toString(i));
        }
        collectGarbage();
        println(m.size());
        println(m.exists("k1"));
        println(m.exists("k2"));
        println(m["k4001"]);
        println(m["k4000"]);
        "#,
    );
    assert_eq!(out, "10000\ntrue\nfalse\n4001\nnull\n");
}

#[test]
fn assertion_failures_report_message_and_frames() {
    let mut t = TestVm::new();
    let err = t
        .run(
            r#"
            fn f() {
                assert(false, "boom");
            }
            f();
            "#,
        )
        .unwrap_err();

    assert_eq!(err.exit_code(), 97);
    assert!(matches!(err, VmError::Assert(_)));

    let reported = t.reported_errors().join("");
    assert!(
        reported.contains("Assertion failed with message: boom"),
        "unexpected report: {reported}"
    );
    assert!(reported.contains("function 'f'"), "missing frame: {reported}");
    assert!(reported.contains("script test"), "missing script: {reported}");
}

#[test]
fn assertion_without_message() {
    let err = run_err("assert(1 == 2);");
    assert_eq!(err.exit_code(), 97);
    assert!(err.to_string().contains("Assertion Failed with no message."));
}

#[test]
fn panic_terminates_with_its_own_exit_code() {
    let mut t = TestVm::new();
    let err = t.run("panic!(\"unrecoverable\");").unwrap_err();
    assert_eq!(err.exit_code(), 112);
    let reported = t.reported_errors().join("");
    assert!(reported.contains("Panic! unrecoverable"), "{reported}");
}

#[test]
fn runtime_errors_carry_a_backtrace() {
    let mut t = TestVm::new();
    let err = t
        .run(
            r#"
            fn inner() { return 1 + "x"; }
            fn outer() { return inner(); }
            outer();
            "#,
        )
        .unwrap_err();
    assert_eq!(err.exit_code(), 114);

    let reported = t.reported_errors().join("");
    assert!(reported.contains("Runtime Error:"), "{reported}");
    assert!(reported.contains("function 'inner'"), "{reported}");
    assert!(reported.contains("function 'outer'"), "{reported}");
    assert!(reported.contains("[line 2]"), "{reported}");
}
