//! Math primitives (`math@*`)

use crate::interp::eval::{EvalResult, Vm};
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Value};

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("math@abs", 1, abs);
    reg.register_fn("math@floor", 1, floor);
    reg.register_fn("math@ceil", 1, ceil);
    reg.register_fn("math@round", 1, round);
    reg.register_fn("math@sqrt", 1, sqrt);
    reg.register_fn("math@pow", 2, pow);
    reg.register_fn("math@min", 2, min);
    reg.register_fn("math@max", 2, max);
    reg.register_fn("math@sin", 1, sin);
    reg.register_fn("math@cos", 1, cos);
    reg.register_fn("math@exp", 1, exp);
    reg.register_fn("math@log", 1, log);
    reg.register_fn("math@pi", 0, pi);
    reg.register_fn("math@is_nan", 1, is_nan);
    reg.register_fn("math@to_int", 1, to_int);
}

fn num(vm: &mut Vm, prim: &str, args: &[Value], i: usize) -> Result<f64, crate::interp::errors::Control> {
    args.get(i)
        .and_then(Value::as_float)
        .ok_or_else(|| invalid_call(vm, prim))
}

fn abs(vm: &mut Vm, args: &[Value]) -> EvalResult {
    match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
        Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
        _ => Err(invalid_call(vm, "math@abs")),
    }
}

fn floor(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Int(num(vm, "math@floor", args, 0)?.floor() as i64))
}

fn ceil(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Int(num(vm, "math@ceil", args, 0)?.ceil() as i64))
}

fn round(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Int(num(vm, "math@round", args, 0)?.round() as i64))
}

fn sqrt(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Float(num(vm, "math@sqrt", args, 0)?.sqrt()))
}

fn pow(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let base = num(vm, "math@pow", args, 0)?;
    let exponent = num(vm, "math@pow", args, 1)?;
    Ok(Value::Float(base.powf(exponent)))
}

fn min(vm: &mut Vm, args: &[Value]) -> EvalResult {
    match (args.first(), args.get(1)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => Ok(Value::Int(*a.min(b))),
        _ => {
            let a = num(vm, "math@min", args, 0)?;
            let b = num(vm, "math@min", args, 1)?;
            Ok(Value::Float(a.min(b)))
        }
    }
}

fn max(vm: &mut Vm, args: &[Value]) -> EvalResult {
    match (args.first(), args.get(1)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => Ok(Value::Int(*a.max(b))),
        _ => {
            let a = num(vm, "math@max", args, 0)?;
            let b = num(vm, "math@max", args, 1)?;
            Ok(Value::Float(a.max(b)))
        }
    }
}

fn sin(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Float(num(vm, "math@sin", args, 0)?.sin()))
}

fn cos(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Float(num(vm, "math@cos", args, 0)?.cos()))
}

fn exp(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Float(num(vm, "math@exp", args, 0)?.exp()))
}

fn log(vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Float(num(vm, "math@log", args, 0)?.ln()))
}

fn pi(_vm: &mut Vm, _args: &[Value]) -> EvalResult {
    Ok(Value::Float(std::f64::consts::PI))
}

fn is_nan(_vm: &mut Vm, args: &[Value]) -> EvalResult {
    Ok(Value::Bool(matches!(args.first(), Some(Value::Float(f)) if f.is_nan())))
}

fn to_int(vm: &mut Vm, args: &[Value]) -> EvalResult {
    match args.first() {
        Some(Value::Int(i)) => Ok(Value::Int(*i)),
        Some(Value::Float(f)) => Ok(Value::Int(*f as i64)),
        Some(Value::Str(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Ok(Value::Int(i)),
            Err(_) => Ok(Value::Null),
        },
        _ => Err(invalid_call(vm, "math@to_int")),
    }
}
