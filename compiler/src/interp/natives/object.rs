//! Object primitives (`object@*`): capability-style field access
//!
//! Field names arrive as strings and are interned on the way in; the
//! reverse table renders them on the way out.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::object::Object;
use crate::interp::ops;
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("object@new", 0, new);
    reg.register_fn("object@with_proto", 1, with_proto);
    reg.register_fn("object@get", 2, get);
    reg.register_fn("object@set", 3, set);
    reg.register_fn("object@remove", 2, remove);
    reg.register_fn("object@has", 2, has);
    reg.register_fn("object@has_own", 2, has_own);
    reg.register_fn("object@fields", 1, fields);
    reg.register_fn("object@proto", 1, proto);
    reg.register_fn("object@set_proto", 2, set_proto);
    reg.register_fn("object@copy", 1, copy);
}

fn receiver(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
) -> Result<Rc<RefCell<Object>>, Control> {
    match args.first() {
        Some(Value::Object(o)) => Ok(o.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn field_name(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
    i: usize,
) -> Result<Rc<str>, Control> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn new(_vm: &mut Vm, _args: &[Value]) -> EvalResult {
    Ok(Value::object(Object::new()))
}

fn with_proto(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let parent = receiver(vm, "object@with_proto", args)?;
    Ok(Value::object(Object::with_proto(parent)))
}

fn get(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@get", args)?;
    let name = field_name(vm, "object@get", args, 1)?;
    let fid = ops::intern_runtime(vm, &name)?;
    let result = obj.borrow().get(fid).unwrap_or(Value::Null);
    Ok(result)
}

fn set(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@set", args)?;
    let name = field_name(vm, "object@set", args, 1)?;
    let value = args.get(2).cloned().unwrap_or(Value::Null);
    let fid = ops::intern_runtime(vm, &name)?;
    obj.borrow_mut().set(fid, value.clone());
    Ok(value)
}

fn remove(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@remove", args)?;
    let name = field_name(vm, "object@remove", args, 1)?;
    let fid = ops::intern_runtime(vm, &name)?;
    let removed = obj.borrow_mut().remove(fid);
    Ok(Value::Bool(removed))
}

fn has(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@has", args)?;
    let name = field_name(vm, "object@has", args, 1)?;
    let fid = ops::intern_runtime(vm, &name)?;
    let result = obj.borrow().get(fid).is_some();
    Ok(Value::Bool(result))
}

fn has_own(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@has_own", args)?;
    let name = field_name(vm, "object@has_own", args, 1)?;
    let fid = ops::intern_runtime(vm, &name)?;
    let result = obj.borrow().has_local(fid);
    Ok(Value::Bool(result))
}

/// Local field names, in id order; names missing from the reverse table
/// render as hex ids (they were interned by another evaluator instance)
fn fields(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@fields", args)?;
    let ids: Vec<_> = obj.borrow().iter().map(|(id, _)| id).collect();
    let names: Vec<Value> = ids
        .into_iter()
        .map(|id| match vm.ctx.fields.name(id) {
            Some(name) => Value::Str(name),
            None => Value::str(format!("{:#010x}", id.0)),
        })
        .collect();
    Ok(Value::array(names))
}

fn proto(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@proto", args)?;
    let parent = obj.borrow().proto();
    Ok(match parent {
        Some(p) => Value::Object(p),
        None => Value::Null,
    })
}

fn set_proto(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@set_proto", args)?;
    match args.get(1) {
        Some(Value::Object(parent)) => {
            obj.borrow_mut().set_proto(Some(parent.clone()));
            Ok(Value::Null)
        }
        Some(Value::Null) => {
            obj.borrow_mut().set_proto(None);
            Ok(Value::Null)
        }
        _ => Err(invalid_call(vm, "object@set_proto")),
    }
}

fn copy(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let obj = receiver(vm, "object@copy", args)?;
    let copied = obj.borrow().clone();
    Ok(Value::object(copied))
}
