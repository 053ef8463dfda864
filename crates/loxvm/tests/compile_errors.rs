use loxvm::{CollectStringPrint, InterpretError, Vm};

fn compile_err(source: &str) -> InterpretError {
    let mut out = CollectStringPrint::new();
    Vm::new(&mut out).interpret(source).expect_err("expected a compile error")
}

#[test]
fn assigning_to_a_non_lvalue_expression_is_a_compile_error() {
    let err = compile_err("1 + 2 = 3;");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn break_outside_any_loop_or_switch_is_a_compile_error() {
    let err = compile_err("break;");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn continue_outside_any_loop_is_a_compile_error() {
    let err = compile_err("continue;");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn returning_a_value_from_the_top_level_script_is_a_compile_error() {
    let err = compile_err("return 1;");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn returning_a_value_from_an_initializer_is_a_compile_error() {
    let err = compile_err("class Box { init() { return 1; } }");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn a_class_cannot_inherit_from_itself() {
    let err = compile_err("class Loop < Loop {}");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn redeclaring_a_global_const_is_a_compile_error() {
    let err = compile_err("const a = 1; const a = 2;");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    let err = compile_err("{ var a = a; }");
    assert_eq!(err.exit_code(), 65);
}

#[test]
fn a_single_compile_pass_can_report_more_than_one_error() {
    let InterpretError::Compile(errors) = compile_err("break; continue;") else {
        panic!("expected a compile error");
    };
    assert!(errors.len() >= 2, "expected multiple diagnostics, got {errors:?}");
}
