//! File primitives (`io@*`)
//!
//! Reads block the whole evaluator thread; that is the cooperative model.
//! Failures surface as catchable exceptions carrying the OS error text.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Handle, Value};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::rc::Rc;

/// An open file handle; `None` once closed
pub struct FileState {
    pub path: String,
    pub file: Option<File>,
}

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("io@contents", 1, contents);
    reg.register_fn("io@save", 2, save);
    reg.register_fn("io@exists", 1, exists);
    reg.register_fn("io@open", 2, open);
    reg.register_fn("io@read", 1, read);
    reg.register_fn("io@write", 2, write);
    reg.register_fn("io@close", 1, close);
}

fn path_arg(vm: &mut Vm, prim: &str, args: &[Value]) -> Result<Rc<str>, Control> {
    match args.first() {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn file_arg(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
) -> Result<Rc<RefCell<FileState>>, Control> {
    match args.first() {
        Some(Value::Abstract(Handle::File(f))) => Ok(f.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn contents(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let path = path_arg(vm, "io@contents", args)?;
    match std::fs::read_to_string(&*path) {
        Ok(text) => Ok(Value::str(text)),
        Err(err) => Err(vm.raise_str(format!("cannot read {}: {}", path, err))),
    }
}

fn save(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let path = path_arg(vm, "io@save", args)?;
    let Some(Value::Str(content)) = args.get(1) else {
        return Err(invalid_call(vm, "io@save"));
    };
    match std::fs::write(&*path, content.as_bytes()) {
        Ok(()) => Ok(Value::Null),
        Err(err) => Err(vm.raise_str(format!("cannot write {}: {}", path, err))),
    }
}

fn exists(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let path = path_arg(vm, "io@exists", args)?;
    Ok(Value::Bool(std::path::Path::new(&*path).exists()))
}

fn open(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let path = path_arg(vm, "io@open", args)?;
    let Some(Value::Str(mode)) = args.get(1) else {
        return Err(invalid_call(vm, "io@open"));
    };
    let result = match &**mode {
        "r" => File::open(&*path),
        "w" => File::create(&*path),
        "a" => OpenOptions::new().append(true).create(true).open(&*path),
        _ => return Err(invalid_call(vm, "io@open")),
    };
    match result {
        Ok(file) => Ok(Value::Abstract(Handle::File(Rc::new(RefCell::new(
            FileState {
                path: path.to_string(),
                file: Some(file),
            },
        ))))),
        Err(err) => Err(vm.raise_str(format!("cannot open {}: {}", path, err))),
    }
}

fn read(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = file_arg(vm, "io@read", args)?;
    let mut state = state.borrow_mut();
    let path = state.path.clone();
    let Some(file) = state.file.as_mut() else {
        return Err(vm.raise_str(format!("file already closed: {}", path)));
    };
    let mut text = String::new();
    match file.read_to_string(&mut text) {
        Ok(_) => Ok(Value::str(text)),
        Err(err) => Err(vm.raise_str(format!("cannot read {}: {}", path, err))),
    }
}

fn write(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = file_arg(vm, "io@write", args)?;
    let Some(Value::Str(content)) = args.get(1) else {
        return Err(invalid_call(vm, "io@write"));
    };
    let mut state = state.borrow_mut();
    let path = state.path.clone();
    let Some(file) = state.file.as_mut() else {
        return Err(vm.raise_str(format!("file already closed: {}", path)));
    };
    match file.write_all(content.as_bytes()) {
        Ok(()) => Ok(Value::Null),
        Err(err) => Err(vm.raise_str(format!("cannot write {}: {}", path, err))),
    }
}

fn close(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let state = file_arg(vm, "io@close", args)?;
    state.borrow_mut().file = None;
    Ok(Value::Null)
}
