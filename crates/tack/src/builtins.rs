//! The standard library.
//!
//! Every entry is a host function registered as a `const` global, so
//! scripts resolve them exactly like any other binding. The surface is
//! deliberately small: printing, conversions, a little file IO, string
//! and container helpers, and the usual math functions.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    bytecode::vm::Vm,
    error::{RunError, RunResult},
    heap::GcState,
    value::Value,
};

/// Registers the standard library into `vm`'s host namespace.
pub fn install_stdlib(vm: &mut Vm) {
    vm.set_global_fn("print", tack_print);
    vm.set_global_fn("tostring", tack_tostring);
    vm.set_global_fn("tonumber", tack_tonumber);
    vm.set_global_fn("type", tack_type);
    vm.set_global_fn("clock", tack_clock);
    vm.set_global_fn("random", tack_random);
    vm.set_global_fn("gc_enable", |vm, _| {
        vm.set_gc_state(GcState::Enabled);
        Ok(Value::NULL)
    });
    vm.set_global_fn("gc_disable", |vm, _| {
        vm.set_gc_state(GcState::Disabled);
        Ok(Value::NULL)
    });
    vm.set_global_fn("read_file", tack_read_file);
    vm.set_global_fn("write_file", tack_write_file);

    vm.set_global_fn("chr", tack_chr);
    vm.set_global_fn("ord", tack_ord);
    vm.set_global_fn("upper", tack_upper);
    vm.set_global_fn("lower", tack_lower);
    vm.set_global_fn("replace", tack_replace);
    vm.set_global_fn("split", tack_split);
    vm.set_global_fn("join", tack_join);
    vm.set_global_fn("slice", tack_slice);
    vm.set_global_fn("find", tack_find);
    vm.set_global_fn("keys", tack_keys);
    vm.set_global_fn("values", tack_values);
    vm.set_global_fn("map", tack_map);
    vm.set_global_fn("filter", tack_filter);
    vm.set_global_fn("reduce", tack_reduce);
    vm.set_global_fn("foreach", tack_foreach);

    vm.set_global("pi", Value::number(std::f64::consts::PI), true);
    install_math(vm);
}

fn install_math(vm: &mut Vm) {
    macro_rules! math1 {
        ($name:literal, $method:ident) => {
            vm.set_global_fn($name, |_, args| {
                Ok(Value::number(number_arg(args, 0, $name)?.$method()))
            });
        };
    }
    math1!("sin", sin);
    math1!("cos", cos);
    math1!("tan", tan);
    math1!("asin", asin);
    math1!("acos", acos);
    math1!("atan", atan);
    math1!("sinh", sinh);
    math1!("cosh", cosh);
    math1!("tanh", tanh);
    math1!("asinh", asinh);
    math1!("acosh", acosh);
    math1!("atanh", atanh);
    math1!("exp", exp);
    math1!("exp2", exp2);
    math1!("sqrt", sqrt);
    math1!("log", ln);
    math1!("log2", log2);
    math1!("log10", log10);
    math1!("floor", floor);
    math1!("ceil", ceil);
    math1!("abs", abs);
    math1!("round", round);
    math1!("degrees", to_degrees);
    math1!("radians", to_radians);
    vm.set_global_fn("atan2", |_, args| {
        Ok(Value::number(
            number_arg(args, 0, "atan2")?.atan2(number_arg(args, 1, "atan2")?),
        ))
    });
    vm.set_global_fn("pow", |_, args| {
        Ok(Value::number(
            number_arg(args, 0, "pow")?.powf(number_arg(args, 1, "pow")?),
        ))
    });
    vm.set_global_fn("min", |_, args| {
        Ok(Value::number(
            number_arg(args, 0, "min")?.min(number_arg(args, 1, "min")?),
        ))
    });
    vm.set_global_fn("max", |_, args| {
        Ok(Value::number(
            number_arg(args, 0, "max")?.max(number_arg(args, 1, "max")?),
        ))
    });
}

// ---- argument helpers ----------------------------------------------------

fn number_arg(args: &[Value], index: usize, name: &str) -> RunResult<f64> {
    args.get(index)
        .and_then(|v| v.as_number())
        .ok_or_else(|| RunError::type_error(format!("{name} expected a number argument")))
}

fn string_arg(vm: &Vm, args: &[Value], index: usize, name: &str) -> RunResult<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|r| vm.string_text(r).to_owned())
        .ok_or_else(|| RunError::type_error(format!("{name} expected a string argument")))
}

// ---- core builtins -------------------------------------------------------

fn tack_print(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let mut line = String::new();
    for (i, &arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        line.push_str(&vm.format_value(arg));
    }
    line.push('\n');
    vm.writer.write(&line);
    Ok(Value::NULL)
}

fn tack_tostring(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let text = vm.format_value(args.first().copied().unwrap_or(Value::NULL));
    Ok(vm.alloc_string(&text))
}

fn tack_tonumber(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let Some(&arg) = args.first() else {
        return Ok(Value::NULL);
    };
    if arg.is_number() {
        return Ok(arg);
    }
    if let Some(r) = arg.as_string() {
        if let Ok(n) = vm.string_text(r).trim().parse::<f64>() {
            return Ok(Value::number(n));
        }
    }
    Ok(Value::NULL)
}

fn tack_type(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let name: &'static str = args.first().copied().unwrap_or(Value::NULL).type_of().into();
    Ok(vm.intern_string(name))
}

fn tack_clock(_vm: &mut Vm, _args: &[Value]) -> RunResult<Value> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::number(seconds))
}

fn tack_random(_vm: &mut Vm, _args: &[Value]) -> RunResult<Value> {
    Ok(Value::number(rand::random::<f64>()))
}

fn tack_read_file(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let path = string_arg(vm, args, 0, "read_file")?;
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(vm.alloc_string(&text)),
        Err(_) => Ok(Value::NULL),
    }
}

fn tack_write_file(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let path = string_arg(vm, args, 0, "write_file")?;
    let text = string_arg(vm, args, 1, "write_file")?;
    Ok(Value::boolean(std::fs::write(&path, text).is_ok()))
}

// ---- string helpers ------------------------------------------------------

fn tack_chr(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let code = number_arg(args, 0, "chr")? as u32;
    match char::from_u32(code) {
        Some(c) => Ok(vm.alloc_string(&c.to_string())),
        None => Ok(Value::NULL),
    }
}

fn tack_ord(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let text = string_arg(vm, args, 0, "ord")?;
    Ok(text
        .chars()
        .next()
        .map_or(Value::NULL, |c| Value::number(f64::from(c as u32))))
}

fn tack_upper(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let text = string_arg(vm, args, 0, "upper")?;
    Ok(vm.alloc_string(&text.to_uppercase()))
}

fn tack_lower(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let text = string_arg(vm, args, 0, "lower")?;
    Ok(vm.alloc_string(&text.to_lowercase()))
}

fn tack_replace(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let text = string_arg(vm, args, 0, "replace")?;
    let from = string_arg(vm, args, 1, "replace")?;
    let to = string_arg(vm, args, 2, "replace")?;
    // An empty pattern would splice `to` between every character.
    if from.is_empty() {
        return Ok(vm.alloc_string(&text));
    }
    Ok(vm.alloc_string(&text.replace(&from, &to)))
}

fn tack_split(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let text = string_arg(vm, args, 0, "split")?;
    let separator = string_arg(vm, args, 1, "split")?;
    let parts: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(&separator).map(str::to_owned).collect()
    };
    // Collection only runs at call boundaries, so the element strings are
    // safe to hold as plain values while the array is built.
    let elements: Vec<Value> = parts.iter().map(|part| vm.alloc_string(part)).collect();
    Ok(Value::array(vm.heap.alloc_array(elements)))
}

fn tack_join(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let Some(id) = args.first().and_then(|v| v.as_array()) else {
        return Err(RunError::type_error("join expected an array argument"));
    };
    let separator = string_arg(vm, args, 1, "join").unwrap_or_default();
    let elements: Vec<Value> = vm.heap.arrays.get(id).cloned().unwrap_or_default();
    let mut out = String::new();
    for (i, element) in elements.into_iter().enumerate() {
        if i > 0 {
            out.push_str(&separator);
        }
        out.push_str(&vm.format_value(element));
    }
    Ok(vm.alloc_string(&out))
}

// ---- container helpers ---------------------------------------------------

fn tack_slice(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let target = args.first().copied().unwrap_or(Value::NULL);
    let start = number_arg(args, 1, "slice")?.max(0.0) as usize;
    let end = number_arg(args, 2, "slice")?.max(0.0) as usize;
    if let Some(id) = target.as_array() {
        let values = vm.heap.arrays.get(id).cloned().unwrap_or_default();
        let end = end.min(values.len());
        let slice = if start < end { values[start..end].to_vec() } else { Vec::new() };
        return Ok(Value::array(vm.heap.alloc_array(slice)));
    }
    if let Some(r) = target.as_string() {
        let chars: Vec<char> = vm.string_text(r).chars().collect();
        let end = end.min(chars.len());
        let text: String = if start < end {
            chars[start..end].iter().collect()
        } else {
            String::new()
        };
        return Ok(vm.alloc_string(&text));
    }
    Err(RunError::type_error("slice expected an array or string"))
}

fn tack_find(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let target = args.first().copied().unwrap_or(Value::NULL);
    if let Some(id) = target.as_array() {
        let needle = args.get(1).copied().unwrap_or(Value::NULL);
        let found = vm
            .heap
            .arrays
            .get(id)
            .and_then(|values| values.iter().position(|v| v.equals(needle)));
        return Ok(found.map_or(Value::NULL, |i| Value::number(i as f64)));
    }
    if let Some(r) = target.as_string() {
        let haystack = vm.string_text(r).to_owned();
        let needle = string_arg(vm, args, 1, "find")?;
        return Ok(haystack
            .find(&needle)
            .map_or(Value::NULL, |i| Value::number(i as f64)));
    }
    Err(RunError::type_error("find expected an array or string"))
}

fn tack_keys(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let Some(id) = args.first().and_then(|v| v.as_object()) else {
        return Err(RunError::type_error("keys expected an object argument"));
    };
    let keys: Vec<Value> = vm
        .heap
        .objects
        .get(id)
        .map(|o| o.iter().map(|(k, _)| Value::interned_string(k)).collect())
        .unwrap_or_default();
    Ok(Value::array(vm.heap.alloc_array(keys)))
}

fn tack_values(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let Some(id) = args.first().and_then(|v| v.as_object()) else {
        return Err(RunError::type_error("values expected an object argument"));
    };
    let values: Vec<Value> = vm
        .heap
        .objects
        .get(id)
        .map(|o| o.values().collect())
        .unwrap_or_default();
    Ok(Value::array(vm.heap.alloc_array(values)))
}

// ---- higher-order helpers ------------------------------------------------
//
// These reenter the VM through the frame protocol, one callback call per
// element. Elements are read from the source array by index at each step
// and results accumulate in a pinned array, so a collection triggered
// inside a callback cannot reclaim either side mid-loop. A callback error
// unwinds to the outermost host call like any other runtime error.

fn array_arg(args: &[Value], name: &str) -> RunResult<u32> {
    args.first()
        .and_then(|v| v.as_array())
        .ok_or_else(|| RunError::type_error(format!("{name} expected an array argument")))
}

fn element_at(vm: &Vm, id: u32, index: usize) -> Option<Value> {
    vm.heap.arrays.get(id).and_then(|values| values.get(index).copied())
}

fn push_into(vm: &mut Vm, array: Value, value: Value) {
    if let Some(id) = array.as_array() {
        if let Some(values) = vm.heap.arrays.get_mut(id) {
            values.push(value);
        }
    }
}

fn tack_map(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let id = array_arg(args, "map")?;
    let func = args.get(1).copied().unwrap_or(Value::NULL);
    let out = vm.alloc_array();
    vm.retain(out);
    let mut index = 0;
    while let Some(element) = element_at(vm, id, index) {
        match vm.run_call(func, &[element]) {
            Ok(value) => push_into(vm, out, value),
            Err(err) => {
                vm.release(out);
                return Err(err);
            }
        }
        index += 1;
    }
    vm.release(out);
    Ok(out)
}

fn tack_filter(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let id = array_arg(args, "filter")?;
    let func = args.get(1).copied().unwrap_or(Value::NULL);
    let out = vm.alloc_array();
    vm.retain(out);
    let mut index = 0;
    while let Some(element) = element_at(vm, id, index) {
        match vm.run_call(func, &[element]) {
            Ok(keep) => {
                if keep.truthy() {
                    push_into(vm, out, element);
                }
            }
            Err(err) => {
                vm.release(out);
                return Err(err);
            }
        }
        index += 1;
    }
    vm.release(out);
    Ok(out)
}

fn tack_reduce(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let id = array_arg(args, "reduce")?;
    let func = args.get(1).copied().unwrap_or(Value::NULL);
    // The accumulator is always rooted while collection can run: it sits
    // in the callback's argument slots for the duration of each call.
    let mut acc = args.get(2).copied().unwrap_or(Value::NULL);
    let mut index = 0;
    while let Some(element) = element_at(vm, id, index) {
        acc = vm.run_call(func, &[acc, element])?;
        index += 1;
    }
    Ok(acc)
}

fn tack_foreach(vm: &mut Vm, args: &[Value]) -> RunResult<Value> {
    let id = array_arg(args, "foreach")?;
    let func = args.get(1).copied().unwrap_or(Value::NULL);
    let mut index = 0;
    while let Some(element) = element_at(vm, id, index) {
        vm.run_call(func, &[element])?;
        index += 1;
    }
    Ok(Value::NULL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names() {
        let mut vm = Vm::new();
        let name = tack_type(&mut vm, &[Value::number(1.0)]).unwrap();
        assert_eq!(vm.string_text(name.as_string().unwrap()), "number");
        let name = tack_type(&mut vm, &[Value::NULL]).unwrap();
        assert_eq!(vm.string_text(name.as_string().unwrap()), "null");
    }

    #[test]
    fn tonumber_parses_strings() {
        let mut vm = Vm::new();
        let s = vm.alloc_string(" 42.5 ");
        let n = tack_tonumber(&mut vm, &[s]).unwrap();
        assert_eq!(n.as_number(), Some(42.5));
        let s = vm.alloc_string("not a number");
        assert!(tack_tonumber(&mut vm, &[s]).unwrap().is_null());
    }

    #[test]
    fn split_and_join_round_trip() {
        let mut vm = Vm::new();
        let s = vm.alloc_string("a,b,c");
        let sep = vm.alloc_string(",");
        let parts = tack_split(&mut vm, &[s, sep]).unwrap();
        let joined = tack_join(&mut vm, &[parts, sep]).unwrap();
        assert_eq!(vm.string_text(joined.as_string().unwrap()), "a,b,c");
    }
}
