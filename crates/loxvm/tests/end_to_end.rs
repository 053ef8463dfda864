use loxvm::{CollectStringPrint, InterpretError, Vm};

fn run(source: &str) -> String {
    let mut out = CollectStringPrint::new();
    Vm::new(&mut out).interpret(source).unwrap_or_else(|e| panic!("unexpected interpret error: {e}"));
    out.joined()
}

fn run_err(source: &str) -> InterpretError {
    let mut out = CollectStringPrint::new();
    Vm::new(&mut out).interpret(source).expect_err("expected interpret to fail")
}

mod scenarios {
    use super::*;

    #[test]
    fn arithmetic_respects_operator_precedence() {
        assert_eq!(run("print 2 + 3 * 4 - 1;"), "13");
    }

    #[test]
    fn string_concatenation_and_equality() {
        assert_eq!(run(r#"print "foo" + "bar" == "foobar";"#), "true");
    }

    #[test]
    fn closures_see_mutations_through_a_shared_upvalue() {
        assert_eq!(
            run(
                "fun makeCounter() { \
                   var count = 0; \
                   fun inc() { count = count + 1; return count; } \
                   return inc; \
                 } \
                 var counter = makeCounter(); \
                 counter(); counter(); \
                 print counter();"
            ),
            "3"
        );
    }

    #[test]
    fn inheritance_allows_a_subclass_to_call_the_parent_via_super() {
        assert_eq!(
            run(
                "class Animal { speak() { print \"...\"; } } \
                 class Dog < Animal { speak() { super.speak(); print \"Woof\"; } } \
                 Dog().speak();"
            ),
            "...\nWoof"
        );
    }

    #[test]
    fn a_for_loop_sums_one_through_ten() {
        assert_eq!(
            run("var total = 0; for (var i = 1; i <= 10; i = i + 1) { total = total + i; } print total;"),
            "55"
        );
    }

    #[test]
    fn const_reassignment_is_rejected_before_any_bytecode_runs() {
        let err = run_err("const limit = 10; limit = 20; print \"unreachable\";");
        assert_eq!(err.exit_code(), 65);
        assert!(matches!(err, InterpretError::Compile(_)));
    }
}

#[test]
fn native_clock_returns_a_number() {
    assert_eq!(run("print clock() >= 0;"), "true");
}

#[test]
fn field_access_and_mutation_on_instances() {
    assert_eq!(
        run("class Box {} var b = Box(); b.value = 41; b.value = b.value + 1; print b.value;"),
        "42"
    );
}

#[test]
fn methods_are_bound_to_their_receiver_when_taken_as_values() {
    assert_eq!(
        run(
            "class Greeter { greet() { return this.name; } } \
             var g = Greeter(); g.name = \"Ada\"; \
             var bound = g.greet; \
             print bound();"
        ),
        "Ada"
    );
}

#[test]
fn switch_falls_to_the_matching_case_only() {
    assert_eq!(run("switch (1) { case 0: print \"zero\"; case 1: print \"one\"; case 2: print \"two\"; }"), "one");
}

#[test]
fn continue_skips_the_rest_of_the_loop_body() {
    assert_eq!(
        run(
            "var sum = 0; \
             for (var i = 0; i < 5; i = i + 1) { \
               if (i == 2) continue; \
               sum = sum + i; \
             } \
             print sum;"
        ),
        "8"
    );
}

#[test]
fn instances_report_their_class_name_when_printed() {
    assert_eq!(run("class Point {} print Point();"), "Point instance");
}
