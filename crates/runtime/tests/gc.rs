//! Collector behavior under load: stress mode (collect at every
//! allocation) over programs that exercise every object kind, plus the
//! soundness properties observable from language level.

mod common;

use common::TestVm;

/// Under stress mode every allocation runs a full collection, so any
/// transient object missing from the root set gets freed while still in
/// use — these programs crash or corrupt if rooting is wrong anywhere.
fn run_stressed(source: &str) -> String {
    let mut t = TestVm::stressed();
    if let Err(err) = t.run(source) {
        panic!("stressed program failed: {err}\nsource:\n{source}");
    }
    t.output()
}

#[test]
fn stress_closures_and_upvalues() {
    let out = run_stressed(
        r#"
        fn adder(n) {
            fn add(x) { return x + n; }
            return add;
        }
        var add2 = adder(2);
        var add5 = adder(5);
        println(add2(1) + add5(1));
        "#,
    );
    assert_eq!(out, "9\n");
}

#[test]
fn stress_string_building() {
    let out = run_stressed(
        r#"
        var s = "";
        for (var i = 0; i < 50; i = i + 1) {
            s = s + "x";
        }
        println(s.len());
        "#,
    );
    assert_eq!(out, "50\n");
}

#[test]
fn stress_classes_and_instances() {
    let out = run_stressed(
        r#"
        class Node {
            var value = 0;
            var next = null;
            init(value, next) {
                this.value = value;
                this.next = next;
            }
        }
        var head = null;
        for (var i = 0; i < 20; i = i + 1) {
            head = Node(i, head);
        }
        var sum = 0;
        while (head != null) {
            sum = sum + head.value;
            head = head.next;
        }
        println(sum);
        "#,
    );
    assert_eq!(out, "190\n");
}

#[test]
fn stress_collections() {
    let out = run_stressed(
        r#"
        var m = {};
        var s = {1};
        var a = [];
        for (var i = 0; i < 40; i = i + 1) {
            m["key" + toString(i)] = [i, i * 2];
            s.add(i);
            a.push(m["key" + toString(i)]);
        }
        println(m.size());
        println(s.size());
        println(a.len());
        "#,
    );
    assert_eq!(out, "40\n40\n40\n");
}

#[test]
fn stress_enums_and_switches() {
    let out = run_stressed(
        r#"
        enum State { Idle, Busy, Done }
        fn describe(s) {
            switch (s) {
                case 0: return "idle";
                case 1: return "busy";
                default: return "done";
            }
        }
        println(describe(State.Idle));
        println(describe(State.Busy));
        println(describe(State.Done));
        "#,
    );
    assert_eq!(out, "idle\nbusy\ndone\n");
}

#[test]
fn stress_modules() {
    use std::io::Write as _;
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("counted.ilex");
    write!(
        std::fs::File::create(&lib).unwrap(),
        "var hits = 0;\nhits = hits + 1;\nfn get() {{ return hits; }}\n"
    )
    .unwrap();
    let main = dir.path().join("main.ilex");
    write!(
        std::fs::File::create(&main).unwrap(),
        "use \"counted\";\nuse \"counted\";\nprintln(counted.get());\n"
    )
    .unwrap();

    let mut t = TestVm::stressed();
    let source = std::fs::read_to_string(&main).unwrap();
    t.vm.interpret(&main.to_string_lossy(), &source).unwrap();
    assert_eq!(t.output(), "1\n");
}

#[test]
fn unreachable_garbage_is_reclaimed() {
    let mut t = TestVm::new();
    t.run(
        r#"
        for (var i = 0; i < 1000; i = i + 1) {
            var junk = ["garbage" + toString(i), [i, i, i]];
        }
        "#,
    )
    .unwrap();

    t.vm.collect_garbage();
    let settled = t.vm.bytes_allocated();
    // Everything allocated in the loop was unreachable.
    assert!(settled < 200 * 1024, "retained {settled} bytes");
}

#[test]
fn explicit_collection_preserves_live_data() {
    let out = common::run_ok(
        r#"
        var keep = {"a": [1, 2, 3], "b": "text"};
        collectGarbage();
        collectGarbage();
        println(keep["a"][2]);
        println(keep["b"]);
        "#,
    );
    assert_eq!(out, "3\ntext\n");
}

#[test]
fn collection_counts_grow_under_pressure() {
    let mut t = TestVm::stressed();
    t.run("var x = \"a\" + \"b\";").unwrap();
    assert!(t.vm.gc_cycle_count() > 0);
}
