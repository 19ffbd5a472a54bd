//! String primitives (`string@*`) and String instance methods
//!
//! Indices are character positions, not byte offsets.

use crate::interp::eval::{EvalResult, Vm};
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Value};
use source_map::Pos;
use std::rc::Rc;

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("string@sub", 3, sub);
    reg.register_fn("string@char_at", 2, char_at);
    reg.register_fn("string@char_code_at", 2, char_code_at);
    reg.register_fn("string@from_char_code", 1, from_char_code);
    reg.register_fn("string@index_of", 3, index_of);
    reg.register_fn("string@split", 2, split);
    reg.register_fn("string@lowercase", 1, lowercase);
    reg.register_fn("string@uppercase", 1, uppercase);
    reg.register_fn("string@trim", 1, trim);
    reg.register_fn("string@replace", 3, replace);
    reg.register_fn("string@starts_with", 2, starts_with);
    reg.register_fn("string@ends_with", 2, ends_with);
}

/// Instance-method dispatch for `str.method(args)`
pub(crate) fn dispatch_method(
    vm: &mut Vm,
    s: &Rc<str>,
    name: &str,
    args: &[Value],
    _pos: Pos,
) -> Option<EvalResult> {
    let result = match name {
        "charAt" => Ok(do_char_at(s, args.first().and_then(Value::as_int).unwrap_or(-1))),
        "charCodeAt" => Ok(do_char_code_at(
            s,
            args.first().and_then(Value::as_int).unwrap_or(-1),
        )),
        "indexOf" => do_index_of(vm, s, args),
        "split" => do_split(vm, s, args),
        "substr" => Ok(do_substr(
            s,
            args.first().and_then(Value::as_int).unwrap_or(0),
            args.get(1).and_then(Value::as_int),
        )),
        "substring" => Ok(do_substring(
            s,
            args.first().and_then(Value::as_int).unwrap_or(0),
            args.get(1).and_then(Value::as_int),
        )),
        "toLowerCase" => Ok(Value::str(s.to_lowercase())),
        "toUpperCase" => Ok(Value::str(s.to_uppercase())),
        "trim" => Ok(Value::str(s.trim())),
        "toString" => Ok(Value::Str(s.clone())),
        _ => return None,
    };
    Some(result)
}

fn arg_str<'a>(vm: &mut Vm, prim: &str, args: &'a [Value], i: usize) -> Result<&'a Rc<str>, crate::interp::errors::Control> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn sub(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@sub", args, 0)?.clone();
    let (Some(pos), Some(len)) = (
        args.get(1).and_then(Value::as_int),
        args.get(2).and_then(Value::as_int),
    ) else {
        return Err(invalid_call(vm, "string@sub"));
    };
    Ok(do_substr(&s, pos, Some(len)))
}

fn do_substr(s: &Rc<str>, pos: i64, len: Option<i64>) -> Value {
    let chars: Vec<char> = s.chars().collect();
    let total = chars.len() as i64;
    let start = if pos < 0 { (total + pos).max(0) } else { pos.min(total) };
    let take = match len {
        Some(l) if l >= 0 => l,
        Some(_) => 0,
        None => total - start,
    };
    let out: String = chars
        .iter()
        .skip(start as usize)
        .take(take as usize)
        .collect();
    Value::str(out)
}

fn do_substring(s: &Rc<str>, start: i64, end: Option<i64>) -> Value {
    let chars: Vec<char> = s.chars().collect();
    let total = chars.len() as i64;
    let mut a = start.clamp(0, total);
    let mut b = end.unwrap_or(total).clamp(0, total);
    if a > b {
        std::mem::swap(&mut a, &mut b);
    }
    let out: String = chars[a as usize..b as usize].iter().collect();
    Value::str(out)
}

fn char_at(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@char_at", args, 0)?.clone();
    Ok(do_char_at(&s, args.get(1).and_then(Value::as_int).unwrap_or(-1)))
}

fn do_char_at(s: &Rc<str>, i: i64) -> Value {
    if i < 0 {
        return Value::str("");
    }
    s.chars()
        .nth(i as usize)
        .map(|c| Value::str(c.to_string()))
        .unwrap_or_else(|| Value::str(""))
}

fn char_code_at(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@char_code_at", args, 0)?.clone();
    Ok(do_char_code_at(
        &s,
        args.get(1).and_then(Value::as_int).unwrap_or(-1),
    ))
}

fn do_char_code_at(s: &Rc<str>, i: i64) -> Value {
    if i < 0 {
        return Value::Null;
    }
    s.chars()
        .nth(i as usize)
        .map(|c| Value::Int(c as i64))
        .unwrap_or(Value::Null)
}

fn from_char_code(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(code) = args.first().and_then(Value::as_int) else {
        return Err(invalid_call(vm, "string@from_char_code"));
    };
    match u32::try_from(code).ok().and_then(char::from_u32) {
        Some(c) => Ok(Value::str(c.to_string())),
        None => Err(invalid_call(vm, "string@from_char_code")),
    }
}

fn index_of(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@index_of", args, 0)?.clone();
    do_index_of(vm, &s, &args[1..])
}

fn do_index_of(vm: &mut Vm, s: &Rc<str>, args: &[Value]) -> EvalResult {
    let needle = match args.first() {
        Some(Value::Str(n)) => n.clone(),
        _ => return Err(invalid_call(vm, "string@index_of")),
    };
    let from = args.get(1).and_then(Value::as_int).unwrap_or(0).max(0) as usize;
    let chars: Vec<char> = s.chars().collect();
    let byte_start: usize = chars.iter().take(from).map(|c| c.len_utf8()).sum();
    if byte_start > s.len() {
        return Ok(Value::Int(-1));
    }
    match s[byte_start..].find(&*needle) {
        Some(byte_offset) => {
            let char_index = s[..byte_start + byte_offset].chars().count();
            Ok(Value::Int(char_index as i64))
        }
        None => Ok(Value::Int(-1)),
    }
}

fn split(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@split", args, 0)?.clone();
    do_split(vm, &s, &args[1..])
}

fn do_split(vm: &mut Vm, s: &Rc<str>, args: &[Value]) -> EvalResult {
    let sep = match args.first() {
        Some(Value::Str(sep)) => sep.clone(),
        _ => return Err(invalid_call(vm, "string@split")),
    };
    let parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::str(c.to_string())).collect()
    } else {
        s.split(&*sep).map(Value::str).collect()
    };
    Ok(Value::array(parts))
}

fn lowercase(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@lowercase", args, 0)?;
    Ok(Value::str(s.to_lowercase()))
}

fn uppercase(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@uppercase", args, 0)?;
    Ok(Value::str(s.to_uppercase()))
}

fn trim(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@trim", args, 0)?;
    Ok(Value::str(s.trim()))
}

fn replace(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@replace", args, 0)?.clone();
    let from = arg_str(vm, "string@replace", args, 1)?.clone();
    let to = arg_str(vm, "string@replace", args, 2)?.clone();
    if from.is_empty() {
        return Ok(Value::Str(s));
    }
    Ok(Value::str(s.replace(&*from, &to)))
}

fn starts_with(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@starts_with", args, 0)?.clone();
    let prefix = arg_str(vm, "string@starts_with", args, 1)?;
    Ok(Value::Bool(s.starts_with(&**prefix)))
}

fn ends_with(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let s = arg_str(vm, "string@ends_with", args, 0)?.clone();
    let suffix = arg_str(vm, "string@ends_with", args, 1)?;
    Ok(Value::Bool(s.ends_with(&**suffix)))
}
