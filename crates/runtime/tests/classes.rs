//! Classes: construction, methods, fields, inheritance, access control,
//! statics and abstract checks.

mod common;

use common::{run_err, run_ok};

#[test]
fn instances_with_init_and_methods() {
    let out = run_ok(
        r#"
        class Counter {
            var count = 0;
            init(start) {
                this.count = start;
            }
            bump() {
                this.count = this.count + 1;
                return this.count;
            }
        }
        var c = Counter(10);
        println(c.bump());
        println(c.bump());
        println(c.count);
        "#,
    );
    assert_eq!(out, "11\n12\n12\n");
}

#[test]
fn field_initializers_seed_each_instance() {
    let out = run_ok(
        r#"
        class Point {
            var x = 1;
            var y = 2;
        }
        var a = Point();
        var b = Point();
        a.x = 100;
        println(a.x);
        println(b.x);
        println(b.y);
        "#,
    );
    assert_eq!(out, "100\n1\n2\n");
}

#[test]
fn assigning_undeclared_fields_is_rejected() {
    let err = run_err(
        r#"
        class Point { var x = 0; }
        var p = Point();
        p.z = 3;
        "#,
    );
    assert!(err.to_string().contains("contains no variable 'z'"), "{err}");
}

#[test]
fn init_implicitly_returns_the_instance() {
    let out = run_ok(
        r#"
        class Box { var v = 0; init(v) { this.v = v; } }
        var b = Box(5);
        println(b.v);
        println(typeof(b));
        "#,
    );
    assert_eq!(out, "5\ninstance\n");
}

#[test]
fn methods_bind_their_receiver() {
    let out = run_ok(
        r#"
        class Greeter {
            var name = "";
            init(name) { this.name = name; }
            greet() { return "hi " + this.name; }
        }
        var g = Greeter("ada");
        var bound = g.greet;
        println(bound());
        "#,
    );
    assert_eq!(out, "hi ada\n");
}

#[test]
fn inheritance_copies_methods_and_fields() {
    let out = run_ok(
        r#"
        class Animal {
            var legs = 4;
            speak() { return "..."; }
            describe() { return "legs: " + toString(this.legs); }
        }
        class Dog inherits Animal {
            speak() { return "woof"; }
        }
        var d = Dog();
        println(d.speak());
        println(d.describe());
        "#,
    );
    assert_eq!(out, "woof\nlegs: 4\n");
}

#[test]
fn super_calls_the_parent_method() {
    let out = run_ok(
        r#"
        class A {
            hello() { return "A"; }
        }
        class B inherits A {
            hello() { return super.hello() + "B"; }
        }
        println(B().hello());
        "#,
    );
    assert_eq!(out, "AB\n");
}

#[test]
fn inheriting_from_a_non_class_faults() {
    let err = run_err("var x = 1; class Bad inherits x {}");
    assert!(err.to_string().contains("Superclass must be a class"), "{err}");
}

#[test]
fn private_fields_are_hidden_outside_the_class() {
    let out = run_ok(
        r#"
        class Vault {
            private var secret = "hidden";
            reveal() { return this.secret; }
        }
        println(Vault().reveal());
        "#,
    );
    assert_eq!(out, "hidden\n");

    let err = run_err(
        r#"
        class Vault { private var secret = "hidden"; }
        var v = Vault();
        println(v.secret);
        "#,
    );
    assert!(err.to_string().contains("private"), "{err}");
}

#[test]
fn private_field_writes_from_outside_are_rejected() {
    let err = run_err(
        r#"
        class Vault { private var secret = 1; }
        var v = Vault();
        v.secret = 2;
        "#,
    );
    assert!(err.to_string().contains("private"), "{err}");
}

#[test]
fn private_methods_dispatch_through_this() {
    let out = run_ok(
        r#"
        class Machine {
            private step() { return "step"; }
            run() { return this.step() + "!"; }
        }
        println(Machine().run());
        "#,
    );
    assert_eq!(out, "step!\n");
}

#[test]
fn static_members_live_on_the_class() {
    let out = run_ok(
        r#"
        class Config {
            static var retries = 3;
            static const NAME = "cfg";
            static describe() { return Config.NAME + ":" + toString(Config.retries); }
        }
        println(Config.retries);
        println(Config.NAME);
        Config.retries = 5;
        println(Config.describe());
        "#,
    );
    assert_eq!(out, "3\ncfg\ncfg:5\n");
}

#[test]
fn class_constants_cannot_be_assigned() {
    let err = run_err(
        r#"
        class Config { static const NAME = "cfg"; }
        Config.NAME = "other";
        "#,
    );
    assert!(err.to_string().contains("class constant"), "{err}");
}

#[test]
fn static_classes_cannot_be_instantiated() {
    let err = run_err(
        r#"
        static class Tools { static id(x) { return x; } }
        var t = Tools();
        "#,
    );
    assert!(err.to_string().contains("static class"), "{err}");
}

#[test]
fn abstract_classes_cannot_be_instantiated() {
    let err = run_err(
        r#"
        abstract class Shape { abstract area(); }
        var s = Shape();
        "#,
    );
    assert!(err.to_string().contains("abstract class"), "{err}");
}

#[test]
fn missing_abstract_implementations_fault_at_declaration() {
    let err = run_err(
        r#"
        abstract class Shape { abstract area(); }
        class Blob inherits Shape {}
        "#,
    );
    assert!(
        err.to_string().contains("doesn't implement abstract method 'area'"),
        "{err}"
    );
}

#[test]
fn implemented_abstract_methods_pass_the_check() {
    let out = run_ok(
        r#"
        abstract class Shape {
            abstract area();
            describe() { return "area=" + toString(this.area()); }
        }
        class Square inherits Shape {
            var side = 0;
            init(side) { this.side = side; }
            area() { return this.side * this.side; }
        }
        println(Square(4).describe());
        "#,
    );
    assert_eq!(out, "area=16\n");
}

#[test]
fn instances_of_superclass_are_unaffected_by_subclass() {
    let out = run_ok(
        r#"
        class Base { name() { return "base"; } }
        class Derived inherits Base { name() { return "derived"; } }
        var b = Base();
        var d = Derived();
        println(b.name());
        println(d.name());
        "#,
    );
    assert_eq!(out, "base\nderived\n");
}

#[test]
fn calling_a_non_callable_faults() {
    let err = run_err("var x = 5; x();");
    assert!(err.to_string().contains("Can only call functions and classes"), "{err}");
}

#[test]
fn constructor_arity_is_enforced() {
    let err = run_err(
        r#"
        class P { init(a, b) {} }
        var p = P(1);
        "#,
    );
    assert!(err.to_string().contains("expected 2 arguments but got 1"), "{err}");
}
