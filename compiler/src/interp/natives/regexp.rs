//! Regular-expression primitives (`regexp@*`), backed by the `regex` crate
//!
//! A regex handle carries its compiled pattern plus the state of the last
//! successful match, which `matched`/`matched_pos` read back out.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::object::Object;
use crate::interp::ops;
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Handle, Value};
use regex::{Regex, RegexBuilder};
use std::cell::RefCell;
use std::rc::Rc;

/// Compiled regex plus last-match capture state
pub struct RegexState {
    pub regex: Regex,
    last: Option<MatchInfo>,
}

struct MatchInfo {
    subject: Rc<str>,
    /// Byte ranges per capture group; index 0 is the whole match
    groups: Vec<Option<(usize, usize)>>,
}

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("regexp@new", 2, new);
    reg.register_fn("regexp@match", 2, match_);
    reg.register_fn("regexp@matched", 2, matched);
    reg.register_fn("regexp@matched_pos", 2, matched_pos);
    reg.register_fn("regexp@replace", 3, replace);
    reg.register_fn("regexp@split", 2, split);
}

fn regex_arg(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
) -> Result<Rc<RefCell<RegexState>>, Control> {
    match args.first() {
        Some(Value::Abstract(Handle::Regex(r))) => Ok(r.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn new(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let (Some(Value::Str(pattern)), Some(Value::Str(flags))) = (args.first(), args.get(1)) else {
        return Err(invalid_call(vm, "regexp@new"));
    };
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            // Global matching is the caller's loop; accepted for
            // compatibility
            'g' => {}
            other => {
                return Err(vm.raise_str(format!("unsupported regex flag '{}'", other)));
            }
        }
    }
    match builder.build() {
        Ok(regex) => Ok(Value::Abstract(Handle::Regex(Rc::new(RefCell::new(
            RegexState { regex, last: None },
        ))))),
        Err(err) => Err(vm.raise_str(format!("invalid regex: {}", err))),
    }
}

fn match_(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = regex_arg(vm, "regexp@match", args)?;
    let Some(Value::Str(subject)) = args.get(1) else {
        return Err(invalid_call(vm, "regexp@match"));
    };
    let mut state = state.borrow_mut();
    match state.regex.captures(subject) {
        Some(caps) => {
            let groups = (0..caps.len())
                .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                .collect();
            state.last = Some(MatchInfo {
                subject: subject.clone(),
                groups,
            });
            Ok(Value::Bool(true))
        }
        None => {
            state.last = None;
            Ok(Value::Bool(false))
        }
    }
}

fn matched(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = regex_arg(vm, "regexp@matched", args)?;
    let Some(n) = args.get(1).and_then(Value::as_int) else {
        return Err(invalid_call(vm, "regexp@matched"));
    };
    let state = state.borrow();
    let Some(info) = &state.last else {
        return Err(vm.raise_str("no successful match"));
    };
    if n < 0 || n as usize >= info.groups.len() {
        return Err(vm.raise_str(format!("no match group {}", n)));
    }
    Ok(match info.groups[n as usize] {
        Some((start, end)) => Value::str(&info.subject[start..end]),
        None => Value::Null,
    })
}

fn matched_pos(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = regex_arg(vm, "regexp@matched_pos", args)?;
    let Some(n) = args.get(1).and_then(Value::as_int) else {
        return Err(invalid_call(vm, "regexp@matched_pos"));
    };
    let (start, end) = {
        let state = state.borrow();
        let Some(info) = &state.last else {
            return Err(vm.raise_str("no successful match"));
        };
        match info.groups.get(n.max(0) as usize) {
            Some(Some(range)) if n >= 0 => *range,
            _ => return Err(vm.raise_str(format!("no match group {}", n))),
        }
    };
    let pos_id = ops::intern_runtime(vm, "pos")?;
    let len_id = ops::intern_runtime(vm, "len")?;
    let mut obj = Object::new();
    obj.set(pos_id, Value::Int(start as i64));
    obj.set(len_id, Value::Int((end - start) as i64));
    Ok(Value::object(obj))
}

fn replace(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = regex_arg(vm, "regexp@replace", args)?;
    let (Some(Value::Str(subject)), Some(Value::Str(by))) = (args.get(1), args.get(2)) else {
        return Err(invalid_call(vm, "regexp@replace"));
    };
    let state = state.borrow();
    let replaced = state.regex.replace_all(subject, &**by);
    Ok(Value::str(replaced))
}

fn split(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = regex_arg(vm, "regexp@split", args)?;
    let Some(Value::Str(subject)) = args.get(1) else {
        return Err(invalid_call(vm, "regexp@split"));
    };
    let state = state.borrow();
    let parts: Vec<Value> = state.regex.split(subject).map(Value::str).collect();
    Ok(Value::array(parts))
}
