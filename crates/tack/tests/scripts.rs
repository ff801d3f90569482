//! End-to-end script tests: load source into a fresh VM with the standard
//! library installed and assert on captured `print` output, reported
//! errors, and heap behavior.

use pretty_assertions::assert_eq;
use tack::{CollectStringPrint, RunErrorKind, TackError, Value, Vm, install_stdlib};

/// Runs a script and returns everything it printed. Panics on compile
/// errors or runtime errors.
fn run(src: &str) -> String {
    let (output, vm) = run_vm(src);
    assert!(vm.last_error().is_none(), "unexpected runtime error: {:?}", vm.last_error());
    output
}

/// Runs a script, tolerating runtime errors; returns output and the VM.
fn run_vm(src: &str) -> (String, Vm) {
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    let collector = CollectStringPrint::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.load_source("test", src).expect("script should compile");
    (collector.output(), vm)
}

// ============================================================================
// Core scenarios
// ============================================================================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print(1 + 2 * 3)"), "7\n");
    assert_eq!(run("print((1 + 2) * 3)"), "9\n");
    assert_eq!(run("print(2 ** 3 ** 2)"), "512\n");
    assert_eq!(run("print(7 % 3)"), "1\n");
    assert_eq!(run("print(1 - 2 - 3)"), "-4\n");
}

#[test]
fn closure_capture_identity() {
    let src = "
let make = fn() { let x = 0; return fn() { x = x + 1; return x } }
let c = make()
print(c())
print(c())
print(c())
";
    assert_eq!(run(src), "1\n2\n3\n");
}

#[test]
fn two_closures_from_one_factory_do_not_share() {
    let src = "
let make = fn() { let x = 0; return fn() { x = x + 1; return x } }
let a = make()
let b = make()
a()
a()
print(a())
print(b())
";
    assert_eq!(run(src), "3\n1\n");
}

#[test]
fn aliasing_closures_share_the_captured_cell() {
    let src = "
let make = fn() {
  let x = 0
  let inc = fn() { x = x + 1; return x }
  let get = fn() { return x }
  return [inc, get]
}
let pair = make()
pair[0]()
pair[0]()
print(pair[1]())
";
    assert_eq!(run(src), "2\n");
}

#[test]
fn object_literal_and_field_reassignment() {
    let src = "let o = { a = 1, b = 2 }\no.a = o.a + o.b\nprint(o.a)\nprint(#o)";
    assert_eq!(run(src), "3\n2\n");
}

#[test]
fn array_iteration_preserves_order() {
    let src = "let a = [10, 20, 30]\nfor v in a { print(v) }";
    assert_eq!(run(src), "10\n20\n30\n");
}

#[test]
fn calling_a_number_reports_a_type_error() {
    let (output, vm) = run_vm("let x = 5\nx()");
    assert_eq!(output, "");
    let err = vm.last_error().expect("a runtime error should be recorded");
    assert_eq!(err.kind, RunErrorKind::TypeError);
    let (fragment, line) = err.location.as_ref().expect("error should carry a location");
    assert_eq!(fragment, "test");
    assert_eq!(*line, 2);
}

#[test]
fn gc_reclaims_unreachable_arrays() {
    let src = "
let alloc_many = fn() {
  let i = 0
  while i < 10000 { let a = [1, 2, 3]; i = i + 1 }
}
alloc_many()
";
    let (_, mut vm) = run_vm(src);
    // The collection triggered on return already swept almost everything.
    assert!(
        vm.heap_stats().arrays <= 2,
        "opportunistic GC should have run: {:?}",
        vm.heap_stats()
    );
    vm.collect_now();
    assert_eq!(vm.heap_stats().arrays, 0, "{:?}", vm.heap_stats());
}

// ============================================================================
// Language features
// ============================================================================

#[test]
fn while_and_if_else_chains() {
    let src = "
let i = 0
while i < 5 {
  if i % 2 == 0 { print(\"even\") } else { if i == 3 { print(\"three\") } else { print(\"odd\") } }
  i = i + 1
}
";
    assert_eq!(run(src), "even\nodd\neven\nthree\neven\n");
}

#[test]
fn integer_range_for() {
    assert_eq!(run("for i in 0 .. 4 { print(i) }"), "0\n1\n2\n3\n");
    assert_eq!(run("for i in 3 .. 3 { print(i) }"), "");
}

#[test]
fn range_bounds_do_not_clobber_source_variables() {
    let src = "let n = 3\nfor i in 0 .. n { }\nprint(n)";
    assert_eq!(run(src), "3\n");
}

#[test]
fn object_key_iteration_is_insertion_order() {
    let src = "let o = { b = 1, a = 2, c = 3 }\nfor k in o { print(k) }";
    assert_eq!(run(src), "b\na\nc\n");
}

#[test]
fn object_pair_iteration() {
    let src = "let o = { x = 10, y = 20 }\nfor k, v in o { print(k, v) }";
    assert_eq!(run(src), "x 10\ny 20\n");
}

#[test]
fn ternary_and_logic() {
    assert_eq!(run("print(1 < 2 ? \"yes\" : \"no\")"), "yes\n");
    assert_eq!(run("print(null || 0)"), "false\n");
    assert_eq!(run("print(1 && \"x\")"), "true\n");
    assert_eq!(run("print(!0)"), "true\n");
}

#[test]
fn string_concat_and_length() {
    assert_eq!(run("print(\"foo\" + \"bar\")"), "foobar\n");
    assert_eq!(run("print(#\"hello\")"), "5\n");
}

#[test]
fn array_append_pop_and_concat() {
    let src = "
let a = [1]
a << 2
a << 3
print(#a)
print(a >> 0)
print(#a)
let b = a + [9]
print(b[2])
";
    assert_eq!(run(src), "3\n3\n2\n9\n");
}

#[test]
fn shifts_on_numbers() {
    assert_eq!(run("print(1 << 4)"), "16\n");
    assert_eq!(run("print(256 >> 4)"), "16\n");
    assert_eq!(run("print(12 & 10)"), "8\n");
    assert_eq!(run("print(12 | 3)"), "15\n");
    assert_eq!(run("print(12 ^ 10)"), "6\n");
}

#[test]
fn recursion_through_a_named_function() {
    let src = "
fn fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2) }
print(fib(10))
";
    assert_eq!(run(src), "55\n");
}

#[test]
fn recursion_through_a_local_named_function() {
    let src = "
let wrap = fn() {
  fn fact(n) { return n < 2 ? 1 : n * fact(n - 1) }
  return fact(5)
}
print(wrap())
";
    assert_eq!(run(src), "120\n");
}

#[test]
fn module_level_return_stops_execution() {
    assert_eq!(run("print(1)\nreturn 0\nprint(2)"), "1\n");
}

#[test]
fn nested_containers_print_recursively() {
    let src = "let o = { a = [1, 2], b = { c = 3 } }\nprint(o)";
    assert_eq!(run(src), "object { a = array [ 1, 2 ], b = object { c = 3 } }\n");
}

#[test]
fn builtin_helpers() {
    assert_eq!(run("print(type(1), type(\"s\"), type([]), type(null))"), "number string array null\n");
    assert_eq!(run("print(upper(\"abc\"), lower(\"DEF\"))"), "ABC def\n");
    assert_eq!(run("print(replace(\"a-b-c\", \"-\", \"+\"))"), "a+b+c\n");
    assert_eq!(run("print(join(split(\"a,b,c\", \",\"), \"-\"))"), "a-b-c\n");
    assert_eq!(run("print(slice([1, 2, 3, 4], 1, 3))"), "array [ 2, 3 ]\n");
    assert_eq!(run("print(find([5, 6, 7], 6))"), "1\n");
    assert_eq!(run("print(keys({ a = 1, b = 2 }))"), "array [ a, b ]\n");
    assert_eq!(run("print(tonumber(\"12\") + 1)"), "13\n");
    assert_eq!(run("print(sqrt(9), floor(1.7), abs(0 - 4))"), "3 1 4\n");
}

#[test]
fn higher_order_array_builtins() {
    assert_eq!(run("print(map([1, 2, 3], fn(x) { return x * 2 }))"), "array [ 2, 4, 6 ]\n");
    assert_eq!(
        run("print(filter([1, 2, 3, 4], fn(x) { return x % 2 == 0 }))"),
        "array [ 2, 4 ]\n"
    );
    assert_eq!(run("print(reduce([1, 2, 3, 4], fn(acc, x) { return acc + x }, 0))"), "10\n");
    assert_eq!(run("print(map([], fn(x) { return x }))"), "array []\n");
    let src = "
let total = 0
foreach([1, 2, 3], fn(x) { total = total + x })
print(total)
";
    assert_eq!(run(src), "6\n");
}

#[test]
fn callback_errors_unwind_to_the_host_call() {
    let (_, vm) = run_vm("map([1, 2], fn(x) { return x() })");
    let err = vm.last_error().expect("callback error expected");
    assert_eq!(err.kind, RunErrorKind::TypeError);
}

#[test]
fn map_survives_a_collection_mid_loop() {
    // Each callback allocates; enough elements push the allocation count
    // past the GC threshold so a collection runs while results are only
    // reachable through the pinned output array.
    let src = "
let out = map([1, 2, 3], fn(x) {
  let i = 0
  let garbage = []
  while i < 200 { garbage = [i]; i = i + 1 }
  return [x * 10]
})
print(#out)
print(out[0])
";
    assert_eq!(run(src), "3\narray [ 10 ]\n");
}

#[test]
fn nan_comparisons_follow_ieee() {
    assert_eq!(run("print(0 / 0 == 0 / 0)"), "false\n");
    assert_eq!(run("print(0 / 0 != 0 / 0)"), "true\n");
    assert_eq!(run("print(sqrt(0 - 1) == sqrt(0 - 1))"), "false\n");
    assert_eq!(run("print(0 / 0 < 1, 0 / 0 > 1)"), "false false\n");
    assert_eq!(run("print(0 / 0)"), "nan\n");
}

// ============================================================================
// Runtime errors
// ============================================================================

#[test]
fn arity_is_checked_strictly() {
    let (_, vm) = run_vm("let f = fn(a, b) { return a + b }\nf(1)");
    let err = vm.last_error().expect("arity error expected");
    assert_eq!(err.kind, RunErrorKind::ArityError);
}

#[test]
fn array_index_out_of_range() {
    let (_, vm) = run_vm("let a = [1, 2]\nprint(a[5])");
    let err = vm.last_error().expect("bounds error expected");
    assert_eq!(err.kind, RunErrorKind::BoundsError);
}

#[test]
fn missing_object_key_on_load() {
    let (_, vm) = run_vm("let o = { a = 1 }\nprint(o.missing)");
    let err = vm.last_error().expect("bounds error expected");
    assert_eq!(err.kind, RunErrorKind::BoundsError);
    assert!(err.message.contains("missing"), "{}", err.message);
}

#[test]
fn missing_object_key_on_store_creates() {
    assert_eq!(run("let o = { a = 1 }\no.b = 2\nprint(o.b)\nprint(#o)"), "2\n2\n");
}

#[test]
fn runaway_recursion_overflows_the_stack_cleanly() {
    let (_, vm) = run_vm("fn boom() { return boom() }\nboom()");
    let err = vm.last_error().expect("stack overflow expected");
    assert_eq!(err.kind, RunErrorKind::StackOverflow);
}

#[test]
fn errors_are_reported_once_and_cleared_by_success() {
    let (_, mut vm) = run_vm("let x = 1\nx()");
    assert!(vm.last_error().is_some());
    let f = vm.get_global("print");
    let one = Value::number(1.0);
    vm.call(f, &[one]);
    assert!(vm.last_error().is_none());
}

#[test]
fn compile_errors_surface_through_load() {
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    let err = vm.load_source("bad", "let x = unknown_name").unwrap_err();
    assert!(matches!(err, TackError::Compile(_)), "{err}");
}

// ============================================================================
// Determinism and host API
// ============================================================================

#[test]
fn execution_is_deterministic() {
    let src = "
let o = { a = 1, b = 2, c = 3 }
let total = 0
for k, v in o { total = total + v; print(k) }
print(total)
for i in 0 .. 3 { print(i * i) }
";
    let first = run(src);
    let second = run(src);
    assert_eq!(first, second);
}

#[test]
fn host_can_call_script_functions() {
    let (_, mut vm) = run_vm("fn double(x) { return x * 2 }");
    let f = vm.get_global_in("double", "test");
    assert!(f.is_function());
    let result = vm.call(f, &[Value::number(21.0)]);
    assert_eq!(result.as_number(), Some(42.0));
}

#[test]
fn scripts_can_call_host_functions() {
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    let collector = CollectStringPrint::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.set_global_fn("triple", |_, args| {
        let n = args.first().and_then(|v| v.as_number()).unwrap_or(0.0);
        Ok(Value::number(n * 3.0))
    });
    vm.load_source("test", "print(triple(14))").unwrap();
    assert_eq!(collector.output(), "42\n");
}

#[test]
fn reentrant_host_calls_use_the_frame_protocol() {
    // A host function that calls back into a script function.
    fn trampoline(vm: &mut Vm, args: &[Value]) -> tack::RunResult<Value> {
        let f = vm.get_global_in("callee", "test");
        let arg = args.first().copied().unwrap_or(Value::NULL);
        Ok(vm.call(f, &[arg]))
    }
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    let collector = CollectStringPrint::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.set_global_fn("trampoline", trampoline);
    vm.load_source("test", "fn callee(x) { return x + 1 }\nprint(trampoline(41))")
        .unwrap();
    assert_eq!(collector.output(), "42\n");
    assert!(vm.last_error().is_none());
}

#[test]
fn host_globals_are_visible_to_scripts() {
    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    let collector = CollectStringPrint::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.set_global("answer", Value::number(42.0), true);
    vm.load_source("test", "print(answer)").unwrap();
    assert_eq!(collector.output(), "42\n");
}

#[test]
fn script_globals_are_visible_to_the_host() {
    let (_, vm) = run_vm("let shared = 123");
    assert_eq!(vm.get_global_in("shared", "test").as_number(), Some(123.0));
    assert!(vm.get_global_in("shared", "nope").is_null());
}

#[test]
fn host_deletion_tombstones_preserve_iteration_order() {
    let (_, mut vm) = run_vm("let o = { a = 1, b = 2, c = 3 }");
    let object = vm.get_global_in("o", "test");
    let removed = vm.object_remove(object, "b");
    assert_eq!(removed.and_then(|v| v.as_number()), Some(2.0));
    assert!(vm.object_remove(object, "b").is_none());

    let collector = CollectStringPrint::new();
    vm.set_writer(Box::new(collector.clone()));
    let f = vm.get_global("print");
    vm.call(f, &[object]);
    assert_eq!(collector.output(), "object { a = 1, c = 3 }\n");
}

#[test]
fn pinned_values_survive_collection() {
    let mut vm = Vm::new();
    let array = vm.alloc_array();
    vm.retain(array);
    vm.collect_now();
    assert_eq!(vm.heap_stats().arrays, 1);
    vm.release(array);
    vm.collect_now();
    assert_eq!(vm.heap_stats().arrays, 0);
}

#[test]
fn modules_load_once() {
    let dir = std::env::temp_dir().join(format!("tack-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("counted.tack"), "print(\"ran\")").unwrap();

    let mut vm = Vm::new();
    install_stdlib(&mut vm);
    let collector = CollectStringPrint::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.add_module_dir(dir.to_str().unwrap());
    vm.load_module("counted").unwrap();
    vm.load_module("counted").unwrap();
    assert_eq!(collector.output(), "ran\n");

    let missing = vm.load_module("no_such_module");
    assert!(matches!(missing, Err(TackError::Module(_))));
    let _ = std::fs::remove_dir_all(&dir);
}
