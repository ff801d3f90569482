//! Diagnostics: parse and compile failures should abort loading with a
//! message that points at the problem.

use tack::{TackError, Vm, install_stdlib, parse};

fn load_err(src: &str) -> TackError {
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    vm.load_source("bad", src).expect_err("source should be rejected")
}

#[test]
fn unterminated_string() {
    let err = parse("let s = \"abc").unwrap_err();
    assert!(err.message.contains("closing quote"), "{err}");
}

#[test]
fn unclosed_block() {
    let err = parse("if 1 { print(1)").unwrap_err();
    assert!(err.to_string().contains("'}'"), "{err}");
}

#[test]
fn missing_ternary_colon() {
    let err = parse("let x = 1 ? 2").unwrap_err();
    assert!(err.message.contains("':'"), "{err}");
}

#[test]
fn chained_comparison() {
    let err = parse("let x = 1 <= 2 <= 3").unwrap_err();
    assert!(err.message.contains("chained"), "{err}");
}

#[test]
fn error_messages_quote_the_remaining_input() {
    let err = parse("let x = ").unwrap_err();
    assert!(err.to_string().contains("parse error"), "{err}");
}

#[test]
fn parse_error_carries_the_line() {
    let err = parse("let a = 1\nlet b = 2\nlet c = ((").unwrap_err();
    assert_eq!(err.line, 3, "{err}");
}

#[test]
fn undeclared_variable_names_the_identifier() {
    let TackError::Compile(err) = load_err("print(mystery)") else {
        panic!("expected a compile error");
    };
    assert!(err.message.contains("mystery"), "{}", err.message);
}

#[test]
fn const_reassignment_is_rejected_with_line() {
    let TackError::Compile(err) = load_err("const k = 1\nk = 2") else {
        panic!("expected a compile error");
    };
    assert!(err.message.contains("const"), "{}", err.message);
    assert_eq!(err.line, 2);
}

#[test]
fn assignment_to_a_call_is_rejected() {
    let TackError::Compile(err) = load_err("fn f() { return 0 }\nf() = 1") else {
        panic!("expected a compile error");
    };
    assert!(err.message.contains("assignment target"), "{}", err.message);
}

#[test]
fn parse_errors_come_back_as_tack_errors() {
    assert!(matches!(load_err("let = 3"), TackError::Parse(_)));
}
