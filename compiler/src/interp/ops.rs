//! Operator dispatch and dynamic access helpers
//!
//! Binary and unary operators try the numeric/string fast paths first,
//! then fall back to user-object operator-overload fields (`__add`,
//! `__radd`, `__compare`), and finally raise a runtime type error.
//! Comparison between incompatible variants yields "undefined order":
//! ordering operators answer false, never a panic.

use super::errors::{AbortReason, Control};
use super::eval::{EvalResult, Vm};
use super::natives;
use super::object::FieldId;
use super::value::Value;
use source_map::Pos;
use std::cmp::Ordering;
use std::rc::Rc;
use syntax::{BinaryOp, UnaryOp};

/// Intern a field name at runtime; a collision is a fatal configuration
/// error, not a catchable exception
pub(crate) fn intern_runtime(vm: &mut Vm, name: &str) -> Result<FieldId, Control> {
    match vm.ctx.fields.intern(name) {
        Ok(id) => Ok(id),
        Err(super::errors::MacroError::FieldIdCollision {
            id,
            existing,
            incoming,
        }) => Err(Control::Abort(AbortReason::FieldIdCollision {
            id,
            existing,
            incoming,
        })),
        Err(other) => Err(vm.abort(other.to_string())),
    }
}

/// Script-visible string rendering; consults an object's `__string` hook
pub(crate) fn to_string(vm: &mut Vm, value: &Value, pos: Pos) -> Result<Rc<str>, Control> {
    if let Value::Object(obj) = value {
        let hook = intern_runtime(vm, "__string")?;
        let field = obj.borrow().get(hook);
        if let Some(f) = field {
            if f.is_callable() {
                let rendered = vm.call_value(&f, value.clone(), &[], pos)?;
                if let Value::Str(s) = rendered {
                    return Ok(s);
                }
            }
        }
    }
    Ok(Rc::from(value.display().as_str()))
}

/// Apply a binary operator to two evaluated values
pub(crate) fn binop(
    vm: &mut Vm,
    op: BinaryOp,
    left: &Value,
    right: &Value,
    pos: Pos,
) -> EvalResult {
    vm.last_pos = pos;
    match op {
        BinaryOp::Add => add(vm, left, right, pos),
        BinaryOp::Sub => numeric(vm, left, right, "-", |a, b| a - b, |a, b| a - b),
        BinaryOp::Mul => numeric(vm, left, right, "*", |a, b| a * b, |a, b| a * b),
        BinaryOp::Div => match right {
            Value::Int(0) => Err(vm.raise_str("division by zero")),
            Value::Float(f) if *f == 0.0 => Err(vm.raise_str("division by zero")),
            _ => numeric(vm, left, right, "/", |a, b| a / b, |a, b| a / b),
        },
        BinaryOp::Mod => match right {
            Value::Int(0) => Err(vm.raise_str("modulo by zero")),
            _ => numeric(vm, left, right, "%", |a, b| a % b, |a, b| a % b),
        },

        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::NotEq => Ok(Value::Bool(left != right)),
        BinaryOp::Lt => ordering(vm, left, right, pos, |o| o == Ordering::Less),
        BinaryOp::Le => ordering(vm, left, right, pos, |o| o != Ordering::Greater),
        BinaryOp::Gt => ordering(vm, left, right, pos, |o| o == Ordering::Greater),
        BinaryOp::Ge => ordering(vm, left, right, pos, |o| o != Ordering::Less),

        // Non-short-circuit forms; the compiler emits dedicated thunks for
        // `&&`/`||` so these only serve compound contexts
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),

        BinaryOp::BitAnd => int_op(vm, left, right, "&", |a, b| a & b),
        BinaryOp::BitOr => int_op(vm, left, right, "|", |a, b| a | b),
        BinaryOp::BitXor => int_op(vm, left, right, "^", |a, b| a ^ b),
        BinaryOp::Shl => int_op(vm, left, right, "<<", |a, b| a.wrapping_shl(b as u32)),
        BinaryOp::Shr => int_op(vm, left, right, ">>", |a, b| a.wrapping_shr(b as u32)),
        BinaryOp::Ushr => int_op(vm, left, right, ">>>", |a, b| {
            ((a as u64).wrapping_shr(b as u32)) as i64
        }),

        BinaryOp::Range => {
            let (Some(start), Some(end)) = (as_strict_int(left), as_strict_int(right)) else {
                return Err(vm.raise_str("interval bounds must be Int"));
            };
            Ok(Value::array((start..end).map(Value::Int).collect()))
        }

        BinaryOp::NullCoal => {
            if left.is_null() {
                Ok(right.clone())
            } else {
                Ok(left.clone())
            }
        }
    }
}

/// Apply a non-lvalue unary operator
pub(crate) fn unop(vm: &mut Vm, op: UnaryOp, value: &Value, pos: Pos) -> EvalResult {
    vm.last_pos = pos;
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match value {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(vm.raise_str(format!("cannot negate a {}", other.type_name()))),
        },
        UnaryOp::BitNot => match value.as_int() {
            Some(i) => Ok(Value::Int(!i)),
            None => Err(vm.raise_str(format!("cannot apply ~ to a {}", value.type_name()))),
        },
        UnaryOp::Incr | UnaryOp::Decr => {
            // Handled by the compiler's lvalue path
            Err(vm.raise_str("++/-- requires an assignable target"))
        }
    }
}

fn add(vm: &mut Vm, left: &Value, right: &Value, pos: Pos) -> EvalResult {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        // String concatenation, either side
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            let a = to_string(vm, left, pos)?;
            let b = to_string(vm, right, pos)?;
            Ok(Value::str(format!("{}{}", a, b)))
        }
        // Array concatenation builds a fresh array
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            Ok(Value::array(out))
        }
        _ => {
            // Operator-overload fallback, symmetric on both operands
            if let Some(result) = overload_binary(vm, "__add", left, right, pos)? {
                return Ok(result);
            }
            if let Some(result) = overload_binary(vm, "__radd", right, left, pos)? {
                return Ok(result);
            }
            Err(vm.raise_str(format!(
                "cannot add {} and {}",
                left.type_name(),
                right.type_name()
            )))
        }
    }
}

/// Try `receiver.<hook>(other)`; `None` when the receiver is not an object
/// carrying the hook
fn overload_binary(
    vm: &mut Vm,
    hook: &str,
    receiver: &Value,
    other: &Value,
    pos: Pos,
) -> Result<Option<Value>, Control> {
    let Value::Object(obj) = receiver else {
        return Ok(None);
    };
    let fid = intern_runtime(vm, hook)?;
    let field = obj.borrow().get(fid);
    match field {
        Some(f) if f.is_callable() => {
            let result = vm.call_value(&f, receiver.clone(), &[other.clone()], pos)?;
            Ok(Some(result))
        }
        _ => Ok(None),
    }
}

fn numeric(
    vm: &mut Vm,
    left: &Value,
    right: &Value,
    op_name: &str,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> EvalResult {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        _ => Err(vm.raise_str(format!(
            "operator {} requires numeric operands, found {} and {}",
            op_name,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn int_op(
    vm: &mut Vm,
    left: &Value,
    right: &Value,
    op_name: &str,
    op: impl Fn(i64, i64) -> i64,
) -> EvalResult {
    let (Some(a), Some(b)) = (as_strict_int(left), as_strict_int(right)) else {
        return Err(vm.raise_str(format!(
            "operator {} requires Int operands, found {} and {}",
            op_name,
            left.type_name(),
            right.type_name()
        )));
    };
    Ok(Value::Int(op(a, b)))
}

fn as_strict_int(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

/// Natural ordering between two values; `None` means undefined order
pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn ordering(
    vm: &mut Vm,
    left: &Value,
    right: &Value,
    pos: Pos,
    pred: impl Fn(Ordering) -> bool,
) -> EvalResult {
    if let Some(ord) = compare(left, right) {
        return Ok(Value::Bool(pred(ord)));
    }
    // __compare hook: receiver decides, negated when the right side hosts it
    if let Some(result) = overload_binary(vm, "__compare", left, right, pos)? {
        if let Some(i) = result.as_int() {
            return Ok(Value::Bool(pred(i.cmp(&0))));
        }
    }
    if let Some(result) = overload_binary(vm, "__compare", right, left, pos)? {
        if let Some(i) = result.as_int() {
            return Ok(Value::Bool(pred(0.cmp(&i))));
        }
    }
    // Undefined order between incompatible variants
    Ok(Value::Bool(false))
}

/// Structural equality used by switch matching
pub(crate) fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| structural_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ida, va), (idb, vb))| ida == idb && structural_eq(va, vb))
        }
        _ => a == b,
    }
}

/// Read a field off a value; absent object fields read as null
pub(crate) fn field_get(
    vm: &mut Vm,
    base: &Value,
    fid: FieldId,
    name: &str,
    pos: Pos,
) -> EvalResult {
    vm.last_pos = pos;
    match base {
        Value::Object(obj) => Ok(obj.borrow().get(fid).unwrap_or(Value::Null)),
        Value::Array(arr) if name == "length" => Ok(Value::Int(arr.borrow().len() as i64)),
        Value::Str(s) if name == "length" => Ok(Value::Int(s.chars().count() as i64)),
        Value::Null => Err(vm.raise_str(format!("cannot read field '{}' of null", name))),
        other => Err(vm.raise_str(format!(
            "cannot read field '{}' of a {}",
            name,
            other.type_name()
        ))),
    }
}

/// Write a field; only objects have writable fields
pub(crate) fn field_set(
    vm: &mut Vm,
    base: &Value,
    fid: FieldId,
    name: &str,
    value: Value,
    pos: Pos,
) -> EvalResult {
    vm.last_pos = pos;
    match base {
        Value::Object(obj) => {
            obj.borrow_mut().set(fid, value.clone());
            Ok(value)
        }
        other => Err(vm.raise_str(format!(
            "cannot write field '{}' on a {}",
            name,
            other.type_name()
        ))),
    }
}

/// Indexed read: arrays by integer (out of range reads null), objects by
/// stringified key, strings by character index
pub(crate) fn index_get(vm: &mut Vm, base: &Value, index: &Value, pos: Pos) -> EvalResult {
    vm.last_pos = pos;
    match (base, index) {
        (Value::Array(arr), Value::Int(i)) => {
            if *i < 0 {
                return Ok(Value::Null);
            }
            Ok(arr.borrow().get(*i as usize).cloned().unwrap_or(Value::Null))
        }
        (Value::Str(s), Value::Int(i)) => {
            if *i < 0 {
                return Ok(Value::Null);
            }
            Ok(s.chars()
                .nth(*i as usize)
                .map(|c| Value::str(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (Value::Object(obj), key) => {
            let name = to_string(vm, key, pos)?;
            let fid = intern_runtime(vm, &name)?;
            Ok(obj.borrow().get(fid).unwrap_or(Value::Null))
        }
        (other, _) => Err(vm.raise_str(format!("cannot index a {}", other.type_name()))),
    }
}

/// Indexed write: array writes pad with null up to the index
pub(crate) fn index_set(
    vm: &mut Vm,
    base: &Value,
    index: &Value,
    value: Value,
    pos: Pos,
) -> EvalResult {
    vm.last_pos = pos;
    match (base, index) {
        (Value::Array(arr), Value::Int(i)) => {
            if *i < 0 {
                return Err(vm.raise_str("negative array index"));
            }
            let mut arr = arr.borrow_mut();
            let i = *i as usize;
            if i >= arr.len() {
                arr.resize(i + 1, Value::Null);
            }
            arr[i] = value.clone();
            Ok(value)
        }
        (Value::Object(obj), key) => {
            let name = to_string(vm, key, pos)?;
            let fid = intern_runtime(vm, &name)?;
            obj.borrow_mut().set(fid, value.clone());
            Ok(value)
        }
        (other, _) => Err(vm.raise_str(format!("cannot index-assign a {}", other.type_name()))),
    }
}

/// Dispatch a method call on a receiver value
pub(crate) fn method_call(
    vm: &mut Vm,
    base: &Value,
    name: &str,
    args: &[Value],
    pos: Pos,
) -> EvalResult {
    vm.last_pos = pos;
    match base {
        Value::Object(obj) => {
            let fid = intern_runtime(vm, name)?;
            let field = obj.borrow().get(fid);
            match field {
                Some(f) if f.is_callable() => vm.call_value(&f, base.clone(), args, pos),
                Some(_) => Err(vm.raise_str(format!("field '{}' is not a function", name))),
                None => Err(vm.raise_str(format!("object has no method '{}'", name))),
            }
        }
        Value::Array(arr) => {
            let arr = arr.clone();
            match natives::array::dispatch_method(vm, &arr, name, args, pos) {
                Some(result) => result,
                None => Err(vm.raise_str(format!("Array has no method '{}'", name))),
            }
        }
        Value::Str(s) => {
            let s = s.clone();
            match natives::string::dispatch_method(vm, &s, name, args, pos) {
                Some(result) => result,
                None => Err(vm.raise_str(format!("String has no method '{}'", name))),
            }
        }
        Value::Null => Err(vm.raise_str(format!("cannot call method '{}' on null", name))),
        other => Err(vm.raise_str(format!(
            "cannot call method '{}' on a {}",
            name,
            other.type_name()
        ))),
    }
}

/// Materialize the items of an iterable value: arrays directly, objects
/// through the `hasNext`/`next` protocol
pub(crate) fn iter_values(vm: &mut Vm, value: &Value, pos: Pos) -> Result<Vec<Value>, Control> {
    vm.last_pos = pos;
    match value {
        Value::Array(arr) => Ok(arr.borrow().clone()),
        Value::Object(obj) => {
            let has_next_id = intern_runtime(vm, "hasNext")?;
            let next_id = intern_runtime(vm, "next")?;
            let (has_next, next) = {
                let obj = obj.borrow();
                (obj.get(has_next_id), obj.get(next_id))
            };
            let (Some(has_next), Some(next)) = (has_next, next) else {
                return Err(vm.raise_str("value is not iterable"));
            };
            let mut items = Vec::new();
            loop {
                let more = vm.call_value(&has_next, value.clone(), &[], pos)?;
                if !more.is_truthy() {
                    break;
                }
                items.push(vm.call_value(&next, value.clone(), &[], pos)?);
            }
            Ok(items)
        }
        other => Err(vm.raise_str(format!("a {} is not iterable", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_cross_numeric() {
        assert_eq!(
            compare(&Value::Int(1), &Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(&Value::Float(2.0), &Value::Int(2)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_incompatible_is_undefined() {
        assert_eq!(compare(&Value::Int(1), &Value::str("1")), None);
        assert_eq!(compare(&Value::Null, &Value::Int(0)), None);
        assert_eq!(
            compare(&Value::array(Vec::new()), &Value::array(Vec::new())),
            None
        );
    }

    #[test]
    fn test_structural_eq_arrays() {
        let a = Value::array(vec![Value::Int(1), Value::str("x")]);
        let b = Value::array(vec![Value::Int(1), Value::str("x")]);
        let c = Value::array(vec![Value::Int(2)]);
        assert!(structural_eq(&a, &b));
        assert!(!structural_eq(&a, &c));
        // Reference equality still counts
        assert!(structural_eq(&a, &a.clone()));
    }
}
