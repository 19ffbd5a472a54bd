//! Array primitives (`array@*`) and Array instance methods
//!
//! Arrays are shared mutable cells; mutating primitives operate on the
//! receiver in place, matching scripted aliasing expectations.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::ops;
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Value};
use source_map::Pos;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

type ArrayRef = Rc<RefCell<Vec<Value>>>;

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("array@push", 2, push);
    reg.register_fn("array@pop", 1, pop);
    reg.register_fn("array@shift", 1, shift);
    reg.register_fn("array@unshift", 2, unshift);
    reg.register_fn("array@concat", 2, concat);
    reg.register_fn("array@join", 2, join);
    reg.register_fn("array@reverse", 1, reverse);
    reg.register_fn("array@slice", 3, slice);
    reg.register_fn("array@index_of", 2, index_of);
    reg.register_fn("array@contains", 2, contains);
    reg.register_fn("array@remove", 2, remove);
    reg.register_fn("array@copy", 1, copy);
    reg.register_fn("array@sort", 2, sort);
    reg.register_fn("array@map", 2, map);
    reg.register_fn("array@filter", 2, filter);
}

/// Instance-method dispatch for `arr.method(args)`; `None` when the name
/// is not an array method
pub(crate) fn dispatch_method(
    vm: &mut Vm,
    arr: &ArrayRef,
    name: &str,
    args: &[Value],
    pos: Pos,
) -> Option<EvalResult> {
    let result = match name {
        "push" => do_push(vm, arr, args),
        "pop" => Ok(arr.borrow_mut().pop().unwrap_or(Value::Null)),
        "shift" => do_shift(arr),
        "unshift" => do_unshift(vm, arr, args),
        "concat" => do_concat(vm, arr, args),
        "join" => do_join(vm, arr, args, pos),
        "reverse" => {
            arr.borrow_mut().reverse();
            Ok(Value::Null)
        }
        "slice" => do_slice(arr, args),
        "indexOf" => do_index_of(arr, args),
        "contains" => do_contains(arr, args),
        "remove" => do_remove(arr, args),
        "copy" => Ok(Value::array(arr.borrow().clone())),
        "sort" => do_sort(vm, arr, args, pos),
        "map" => do_map(vm, arr, args, pos),
        "filter" => do_filter(vm, arr, args, pos),
        "toString" => {
            let v = Value::Array(arr.clone());
            Ok(Value::Str(Rc::from(v.display().as_str())))
        }
        _ => return None,
    };
    Some(result)
}

fn receiver(vm: &mut Vm, prim: &str, args: &[Value]) -> Result<ArrayRef, Control> {
    match args.first() {
        Some(Value::Array(a)) => Ok(a.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn push(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@push", args)?;
    do_push(vm, &arr, &args[1..])
}

fn do_push(_vm: &mut Vm, arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let mut arr = arr.borrow_mut();
    for arg in args {
        arr.push(arg.clone());
    }
    Ok(Value::Int(arr.len() as i64))
}

fn pop(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@pop", args)?;
    let popped = arr.borrow_mut().pop();
    Ok(popped.unwrap_or(Value::Null))
}

fn shift(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@shift", args)?;
    do_shift(&arr)
}

fn do_shift(arr: &ArrayRef) -> EvalResult {
    let mut arr = arr.borrow_mut();
    if arr.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(arr.remove(0))
    }
}

fn unshift(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@unshift", args)?;
    do_unshift(vm, &arr, &args[1..])
}

fn do_unshift(_vm: &mut Vm, arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let mut arr = arr.borrow_mut();
    for (i, arg) in args.iter().enumerate() {
        arr.insert(i, arg.clone());
    }
    Ok(Value::Int(arr.len() as i64))
}

fn concat(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@concat", args)?;
    do_concat(vm, &arr, &args[1..])
}

fn do_concat(vm: &mut Vm, arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let mut out = arr.borrow().clone();
    for arg in args {
        match arg {
            Value::Array(other) => out.extend(other.borrow().iter().cloned()),
            _ => return Err(invalid_call(vm, "array@concat")),
        }
    }
    Ok(Value::array(out))
}

fn join(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@join", args)?;
    do_join(vm, &arr, &args[1..], Pos::unknown())
}

fn do_join(vm: &mut Vm, arr: &ArrayRef, args: &[Value], pos: Pos) -> EvalResult {
    let sep = match args.first() {
        Some(Value::Str(s)) => s.to_string(),
        None | Some(Value::Null) => ",".to_string(),
        _ => return Err(invalid_call(vm, "array@join")),
    };
    let items = arr.borrow().clone();
    let mut parts = Vec::with_capacity(items.len());
    for item in &items {
        parts.push(ops::to_string(vm, item, pos)?.to_string());
    }
    Ok(Value::str(parts.join(&sep)))
}

fn reverse(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@reverse", args)?;
    arr.borrow_mut().reverse();
    Ok(Value::Null)
}

fn slice(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@slice", args)?;
    do_slice(&arr, &args[1..])
}

fn do_slice(arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let arr = arr.borrow();
    let len = arr.len() as i64;
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let start = clamp(args.first().and_then(Value::as_int).unwrap_or(0));
    let end = clamp(args.get(1).and_then(Value::as_int).unwrap_or(len));
    if start >= end {
        return Ok(Value::array(Vec::new()));
    }
    Ok(Value::array(arr[start..end].to_vec()))
}

fn index_of(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@index_of", args)?;
    do_index_of(&arr, &args[1..])
}

fn do_index_of(arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let needle = args.first().cloned().unwrap_or(Value::Null);
    let found = arr.borrow().iter().position(|v| *v == needle);
    Ok(Value::Int(found.map(|i| i as i64).unwrap_or(-1)))
}

fn contains(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@contains", args)?;
    do_contains(&arr, &args[1..])
}

fn do_contains(arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let needle = args.first().cloned().unwrap_or(Value::Null);
    Ok(Value::Bool(arr.borrow().iter().any(|v| *v == needle)))
}

fn remove(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@remove", args)?;
    do_remove(&arr, &args[1..])
}

fn do_remove(arr: &ArrayRef, args: &[Value]) -> EvalResult {
    let needle = args.first().cloned().unwrap_or(Value::Null);
    let mut arr = arr.borrow_mut();
    match arr.iter().position(|v| *v == needle) {
        Some(i) => {
            arr.remove(i);
            Ok(Value::Bool(true))
        }
        None => Ok(Value::Bool(false)),
    }
}

fn copy(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@copy", args)?;
    let copied = arr.borrow().clone();
    Ok(Value::array(copied))
}

fn sort(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@sort", args)?;
    do_sort(vm, &arr, &args[1..], Pos::unknown())
}

/// Sort in place. With a comparator the sort is a simple insertion sort so
/// comparator calls can re-enter the evaluator; without one, natural value
/// ordering applies and undefined orderings compare equal.
fn do_sort(vm: &mut Vm, arr: &ArrayRef, args: &[Value], pos: Pos) -> EvalResult {
    match args.first() {
        None | Some(Value::Null) => {
            arr.borrow_mut()
                .sort_by(|a, b| ops::compare(a, b).unwrap_or(Ordering::Equal));
            Ok(Value::Null)
        }
        Some(cmp) if cmp.is_callable() => {
            let mut items = arr.borrow().clone();
            for i in 1..items.len() {
                let mut j = i;
                while j > 0 {
                    let ordered = vm.call_value(
                        cmp,
                        Value::Null,
                        &[items[j - 1].clone(), items[j].clone()],
                        pos,
                    )?;
                    if ordered.as_int().unwrap_or(0) <= 0 {
                        break;
                    }
                    items.swap(j - 1, j);
                    j -= 1;
                }
            }
            *arr.borrow_mut() = items;
            Ok(Value::Null)
        }
        _ => Err(invalid_call(vm, "array@sort")),
    }
}

fn map(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@map", args)?;
    do_map(vm, &arr, &args[1..], Pos::unknown())
}

fn do_map(vm: &mut Vm, arr: &ArrayRef, args: &[Value], pos: Pos) -> EvalResult {
    let Some(f) = args.first().filter(|f| f.is_callable()) else {
        return Err(invalid_call(vm, "array@map"));
    };
    let items = arr.borrow().clone();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(vm.call_value(f, Value::Null, &[item], pos)?);
    }
    Ok(Value::array(out))
}

fn filter(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let arr = receiver(vm, "array@filter", args)?;
    do_filter(vm, &arr, &args[1..], Pos::unknown())
}

fn do_filter(vm: &mut Vm, arr: &ArrayRef, args: &[Value], pos: Pos) -> EvalResult {
    let Some(f) = args.first().filter(|f| f.is_callable()) else {
        return Err(invalid_call(vm, "array@filter"));
    };
    let items = arr.borrow().clone();
    let mut out = Vec::new();
    for item in items {
        if vm
            .call_value(f, Value::Null, &[item.clone()], pos)?
            .is_truthy()
        {
            out.push(item);
        }
    }
    Ok(Value::array(out))
}
