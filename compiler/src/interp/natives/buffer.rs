//! Byte-buffer primitives (`buffer@*`)
//!
//! Buffers are the binary workhorse shared with the compression library:
//! accumulation happens in raw bytes, `buffer@string` renders back to text.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::ops;
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Handle, Value};
use source_map::Pos;
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("buffer@new", 0, new);
    reg.register_fn("buffer@add", 2, add);
    reg.register_fn("buffer@add_char", 2, add_char);
    reg.register_fn("buffer@add_sub", 4, add_sub);
    reg.register_fn("buffer@length", 1, length);
    reg.register_fn("buffer@string", 1, string);
    reg.register_fn("buffer@reset", 1, reset);
}

pub(crate) fn receiver(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
) -> Result<Rc<RefCell<Vec<u8>>>, Control> {
    match args.first() {
        Some(Value::Abstract(Handle::Buffer(b))) => Ok(b.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn new(_vm: &mut Vm, _args: &[Value]) -> EvalResult {
    Ok(Value::Abstract(Handle::Buffer(Rc::new(RefCell::new(
        Vec::new(),
    )))))
}

fn add(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let buf = receiver(vm, "buffer@add", args)?;
    let value = args.get(1).cloned().unwrap_or(Value::Null);
    match &value {
        // Another buffer appends its raw bytes; everything else appends
        // its string rendering
        Value::Abstract(Handle::Buffer(other)) => {
            let bytes = other.borrow().clone();
            buf.borrow_mut().extend_from_slice(&bytes);
        }
        other => {
            let s = ops::to_string(vm, other, Pos::unknown())?;
            buf.borrow_mut().extend_from_slice(s.as_bytes());
        }
    }
    Ok(Value::Null)
}

fn add_char(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let buf = receiver(vm, "buffer@add_char", args)?;
    let Some(code) = args.get(1).and_then(Value::as_int) else {
        return Err(invalid_call(vm, "buffer@add_char"));
    };
    match u32::try_from(code).ok().and_then(char::from_u32) {
        Some(c) => {
            let mut encoded = [0u8; 4];
            buf.borrow_mut()
                .extend_from_slice(c.encode_utf8(&mut encoded).as_bytes());
            Ok(Value::Null)
        }
        None => Err(invalid_call(vm, "buffer@add_char")),
    }
}

fn add_sub(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let buf = receiver(vm, "buffer@add_sub", args)?;
    let (Some(Value::Str(s)), Some(pos), Some(len)) = (
        args.get(1),
        args.get(2).and_then(Value::as_int),
        args.get(3).and_then(Value::as_int),
    ) else {
        return Err(invalid_call(vm, "buffer@add_sub"));
    };
    if pos < 0 || len < 0 {
        return Err(invalid_call(vm, "buffer@add_sub"));
    }
    let chunk: String = s.chars().skip(pos as usize).take(len as usize).collect();
    buf.borrow_mut().extend_from_slice(chunk.as_bytes());
    Ok(Value::Null)
}

fn length(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let buf = receiver(vm, "buffer@length", args)?;
    let len = buf.borrow().len();
    Ok(Value::Int(len as i64))
}

fn string(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let buf = receiver(vm, "buffer@string", args)?;
    let bytes = buf.borrow().clone();
    Ok(Value::str(String::from_utf8_lossy(&bytes)))
}

fn reset(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let buf = receiver(vm, "buffer@reset", args)?;
    buf.borrow_mut().clear();
    Ok(Value::Null)
}
