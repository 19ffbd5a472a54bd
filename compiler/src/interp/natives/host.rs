//! Host-context primitives (`compiler@*`)
//!
//! The script-visible surface of the host compiler: diagnostics, flags,
//! position introspection, re-entrant parsing/typing and the typed-world
//! bridge operations.

use crate::interp::bridge;
use crate::interp::errors::{AbortReason, Control, MacroError};
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::object::Object;
use crate::interp::ops;
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Handle, Value};
use crate::tast::{Type, TypedDecl};
use source_map::{FileId, Pos};
use std::rc::Rc;

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("compiler@pos", 0, current_pos);
    reg.register_fn("compiler@error", 2, error);
    reg.register_fn("compiler@warning", 2, warning);
    reg.register_fn("compiler@info", 2, info);
    reg.register_fn("compiler@define", 1, define);
    reg.register_fn("compiler@define_value", 2, define_value);
    reg.register_fn("compiler@defined", 1, defined);
    reg.register_fn("compiler@defined_value", 1, defined_value);
    reg.register_fn("compiler@pos_infos", 1, pos_infos);
    reg.register_fn("compiler@make_pos", 3, make_pos);
    reg.register_fn("compiler@resolve_file", 1, resolve_file);
    reg.register_fn("compiler@parse", 2, parse);
    reg.register_fn("compiler@type_of", 1, type_of);
    reg.register_fn("compiler@get_type", 1, get_type);
    reg.register_fn("compiler@define_type", 1, define_type);
    reg.register_fn("compiler@signature", 1, signature);
    reg.register_fn("compiler@string", 1, string);
    reg.register_fn("compiler@encode_type", 1, encode_type);
    reg.register_fn("compiler@encode_expr", 1, encode_expr);
    reg.register_fn("compiler@decode_expr", 1, decode_expr);
}

/// Map a bridge-layer error onto the evaluation signal channel: collisions
/// abort, decode failures raise a catchable exception
pub(crate) fn bridge_err(vm: &mut Vm, err: MacroError) -> Control {
    match err {
        MacroError::FieldIdCollision {
            id,
            existing,
            incoming,
        } => Control::Abort(AbortReason::FieldIdCollision {
            id,
            existing,
            incoming,
        }),
        other => vm.raise_str(other.to_string()),
    }
}

fn pos_arg(vm: &mut Vm, prim: &str, args: &[Value], i: usize) -> Result<Pos, Control> {
    match args.get(i) {
        Some(Value::Abstract(Handle::Pos(p))) => Ok(*p),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn str_arg(vm: &mut Vm, prim: &str, args: &[Value], i: usize) -> Result<Rc<str>, Control> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn current_pos(vm: &mut Vm, _args: &[Value]) -> EvalResult {
    Ok(Value::Abstract(Handle::Pos(vm.ctx.host.call_pos())))
}

/// A compiler-reported error aborts the in-flight macro; scripted
/// try/catch never sees it
fn error(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let message = str_arg(vm, "compiler@error", args, 0)?;
    let pos = pos_arg(vm, "compiler@error", args, 1)?;
    vm.ctx.host.report_error(message.to_string(), pos);
    Err(Control::Abort(AbortReason::Fatal {
        message: message.to_string(),
        pos,
    }))
}

fn warning(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let message = str_arg(vm, "compiler@warning", args, 0)?;
    let pos = pos_arg(vm, "compiler@warning", args, 1)?;
    vm.ctx.host.report_warning(message.to_string(), pos);
    Ok(Value::Null)
}

fn info(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let message = str_arg(vm, "compiler@info", args, 0)?;
    let pos = pos_arg(vm, "compiler@info", args, 1)?;
    vm.ctx.host.report_info(message.to_string(), pos);
    Ok(Value::Null)
}

fn define(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let name = str_arg(vm, "compiler@define", args, 0)?;
    vm.ctx.host.define_flag(&name);
    Ok(Value::Null)
}

fn define_value(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let name = str_arg(vm, "compiler@define_value", args, 0)?;
    let value = str_arg(vm, "compiler@define_value", args, 1)?;
    vm.ctx
        .host
        .define_flag_value(&name, Some(value.to_string()));
    Ok(Value::Null)
}

fn defined(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let name = str_arg(vm, "compiler@defined", args, 0)?;
    Ok(Value::Bool(vm.ctx.host.is_flag_defined(&name)))
}

fn defined_value(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let name = str_arg(vm, "compiler@defined_value", args, 0)?;
    Ok(match vm.ctx.host.defined_value(&name) {
        Some(value) => Value::str(value.to_string()),
        None => Value::Null,
    })
}

/// Decompose an opaque position into `{file, min, max}`, the one
/// sanctioned way to look inside a position abstract
fn pos_infos(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let pos = pos_arg(vm, "compiler@pos_infos", args, 0)?;
    let file = vm
        .ctx
        .sources
        .file_name(pos.file)
        .map(str::to_string)
        .unwrap_or_else(|| pos.file.to_string());
    let file_id = ops::intern_runtime(vm, "file")?;
    let min_id = ops::intern_runtime(vm, "min")?;
    let max_id = ops::intern_runtime(vm, "max")?;
    let mut obj = Object::new();
    obj.set(file_id, Value::str(file));
    obj.set(min_id, Value::Int(pos.min as i64));
    obj.set(max_id, Value::Int(pos.max as i64));
    Ok(Value::object(obj))
}

fn make_pos(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let file = str_arg(vm, "compiler@make_pos", args, 0)?;
    let (Some(min), Some(max)) = (
        args.get(1).and_then(Value::as_int),
        args.get(2).and_then(Value::as_int),
    ) else {
        return Err(invalid_call(vm, "compiler@make_pos"));
    };
    let file_id = vm
        .ctx
        .sources
        .file_by_name(&file)
        .unwrap_or_else(FileId::unknown);
    Ok(Value::Abstract(Handle::Pos(Pos::new(
        file_id, min as u32, max as u32,
    ))))
}

fn resolve_file(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let path = str_arg(vm, "compiler@resolve_file", args, 0)?;
    match vm.ctx.host.resolve_file(&path) {
        Some(resolved) => Ok(Value::str(resolved)),
        None => Err(vm.raise_str(format!("file not found: {}", path))),
    }
}

fn parse(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let code = str_arg(vm, "compiler@parse", args, 0)?;
    let pos = pos_arg(vm, "compiler@parse", args, 1)?;
    match vm.ctx.host.parse_string(&code, pos) {
        Some(Ok(expr)) => Ok(Value::Abstract(Handle::Expr(Rc::new(expr)))),
        Some(Err(message)) => Err(vm.raise_str(format!("parse error: {}", message))),
        None => Err(vm.raise_str("no parser available in this context")),
    }
}

fn type_of(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(Value::Abstract(Handle::Expr(expr))) = args.first() else {
        return Err(invalid_call(vm, "compiler@type_of"));
    };
    let expr = expr.clone();
    match vm.ctx.host.type_of(&expr) {
        Some(Ok(ty)) => bridge::encode_type(&mut vm.ctx, &ty).map_err(|e| bridge_err(vm, e)),
        Some(Err(message)) => Err(vm.raise_str(format!("type error: {}", message))),
        None => Err(vm.raise_str("no type checker available in this context")),
    }
}

fn get_type(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let path = str_arg(vm, "compiler@get_type", args, 0)?;
    let ty = match vm.ctx.types.get(&path) {
        Some(TypedDecl::Class(c)) => Type::Inst(c.clone(), Vec::new()),
        Some(TypedDecl::Enum(e)) => Type::Enum(e.clone(), Vec::new()),
        None => return Err(vm.raise_str(format!("type not found: {}", path))),
    };
    bridge::encode_type(&mut vm.ctx, &ty).map_err(|e| bridge_err(vm, e))
}

fn define_type(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(value) = args.first() else {
        return Err(invalid_call(vm, "compiler@define_type"));
    };
    let decl = bridge::decode_decl(&mut vm.ctx, value).map_err(|e| bridge_err(vm, e))?;
    log::info!("macro defined type {}", decl.path());
    vm.ctx.host.add_defined_type(decl);
    Ok(Value::Null)
}

fn signature(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(value) = args.first() else {
        return Err(invalid_call(vm, "compiler@signature"));
    };
    Ok(Value::str(bridge::signature_hex(value)))
}

fn string(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(value) = args.first() else {
        return Err(invalid_call(vm, "compiler@string"));
    };
    let value = value.clone();
    let pos = vm.ctx.host.call_pos();
    Ok(Value::Str(ops::to_string(vm, &value, pos)?))
}

fn encode_type(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(Value::Abstract(Handle::Type(ty))) = args.first() else {
        return Err(invalid_call(vm, "compiler@encode_type"));
    };
    let ty = ty.clone();
    bridge::encode_type(&mut vm.ctx, &ty).map_err(|e| bridge_err(vm, e))
}

fn encode_expr(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(Value::Abstract(Handle::TypedExpr(texpr))) = args.first() else {
        return Err(invalid_call(vm, "compiler@encode_expr"));
    };
    let texpr = texpr.clone();
    bridge::encode_texpr(&mut vm.ctx, &texpr).map_err(|e| bridge_err(vm, e))
}

fn decode_expr(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(value) = args.first() else {
        return Err(invalid_call(vm, "compiler@decode_expr"));
    };
    let value = value.clone();
    let texpr = bridge::decode_texpr(&mut vm.ctx, &value).map_err(|e| bridge_err(vm, e))?;
    Ok(Value::Abstract(Handle::TypedExpr(Rc::new(texpr))))
}
