use loxvm::{CollectStringPrint, InterpretError, Vm};

fn run(source: &str) -> String {
    let mut out = CollectStringPrint::new();
    Vm::new(&mut out).interpret(source).unwrap_or_else(|e| panic!("unexpected interpret error: {e}"));
    out.joined()
}

fn runtime_err(source: &str) -> InterpretError {
    let mut out = CollectStringPrint::new();
    Vm::new(&mut out).interpret(source).expect_err("expected a runtime error")
}

#[test]
fn assigning_to_a_never_declared_global_is_a_runtime_error() {
    let err = runtime_err("x = 1;");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn reading_a_never_declared_global_is_a_runtime_error() {
    let err = runtime_err("print neverDeclared;");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn dividing_zero_by_zero_is_still_a_division_error() {
    let err = runtime_err("print 0 / 0;");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn dividing_a_nonzero_number_by_zero_is_a_division_error() {
    let err = runtime_err("print 5 / 0;");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn modulo_by_zero_produces_nan_rather_than_an_error() {
    assert_eq!(run("var n = 3 % 0; print n != n;"), "true");
}

#[test]
fn adding_a_number_to_a_string_is_a_type_error() {
    let err = runtime_err(r#"print 1 + "x";"#);
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn comparing_non_numbers_with_greater_than_is_a_type_error() {
    let err = runtime_err(r#"print "a" > 1;"#);
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn calling_a_non_callable_value_is_a_runtime_error() {
    let err = runtime_err("var x = 1; x();");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn calling_a_function_with_the_wrong_number_of_arguments_is_a_runtime_error() {
    let err = runtime_err("fun f(a, b) { return a + b; } f(1);");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn accessing_a_field_on_a_non_instance_is_a_runtime_error() {
    let err = runtime_err("var x = 1; print x.value;");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn reading_an_undefined_property_is_a_runtime_error() {
    let err = runtime_err("class Box {} print Box().missing;");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn inheriting_from_a_non_class_value_is_a_runtime_error() {
    let err = runtime_err("var notAClass = 1; class Sub < notAClass {}");
    assert_eq!(err.exit_code(), 70);
}

// The call-frame limit is 64, including the top-level script frame. A
// `count(n)` call chain pushes n + 1 frames on top of the script frame, so
// n = 62 is the deepest call that still fits (64 frames total) and n = 63
// is one call too many (would need 65).

#[test]
fn recursion_right_at_the_frame_limit_still_succeeds() {
    assert_eq!(
        run("fun count(n) { if (n <= 0) return 0; return 1 + count(n - 1); } print count(62);"),
        "62"
    );
}

#[test]
fn recursion_one_call_past_the_frame_limit_overflows_the_call_stack() {
    let err = runtime_err("fun count(n) { if (n <= 0) return 0; return 1 + count(n - 1); } print count(63);");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn recursion_far_past_the_frame_limit_still_overflows_the_call_stack() {
    let err = runtime_err("fun count(n) { return 1 + count(n - 1); } print count(100000);");
    assert_eq!(err.exit_code(), 70);
}

#[test]
fn a_runtime_error_reports_every_active_call_frame() {
    let InterpretError::Runtime(err) =
        runtime_err("fun inner() { return 1 / 0; } fun outer() { return inner(); } outer();")
    else {
        panic!("expected a runtime error");
    };
    assert_eq!(err.frames.len(), 3, "expected inner/outer/script frames, got {:?}", err.frames);
    assert_eq!(err.frames[0].name, "inner");
    assert_eq!(err.frames[1].name, "outer");
    assert_eq!(err.frames[2].name, "script");
}
