//! TCP socket primitives (`socket@*`)
//!
//! Blocking, like the rest of the I/O surface: a read suspends the whole
//! evaluator until the peer delivers.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Handle, Value};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::rc::Rc;

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("socket@connect", 2, connect);
    reg.register_fn("socket@read", 1, read);
    reg.register_fn("socket@read_line", 1, read_line);
    reg.register_fn("socket@write", 2, write);
    reg.register_fn("socket@close", 1, close);
}

fn socket_arg(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
) -> Result<Rc<RefCell<TcpStream>>, Control> {
    match args.first() {
        Some(Value::Abstract(Handle::Socket(s))) => Ok(s.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn connect(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let (Some(Value::Str(host)), Some(port)) = (args.first(), args.get(1).and_then(Value::as_int))
    else {
        return Err(invalid_call(vm, "socket@connect"));
    };
    let address = format!("{}:{}", host, port);
    match TcpStream::connect(&address) {
        Ok(stream) => Ok(Value::Abstract(Handle::Socket(Rc::new(RefCell::new(
            stream,
        ))))),
        Err(err) => Err(vm.raise_str(format!("cannot connect to {}: {}", address, err))),
    }
}

fn read(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let socket = socket_arg(vm, "socket@read", args)?;
    let mut bytes = Vec::new();
    let result = socket.borrow_mut().read_to_end(&mut bytes);
    match result {
        Ok(_) => Ok(Value::str(String::from_utf8_lossy(&bytes))),
        Err(err) => Err(vm.raise_str(format!("socket read failed: {}", err))),
    }
}

fn read_line(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let socket = socket_arg(vm, "socket@read_line", args)?;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = match socket.borrow_mut().read(&mut byte) {
            Ok(n) => n,
            Err(err) => return Err(vm.raise_str(format!("socket read failed: {}", err))),
        };
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    Ok(Value::str(String::from_utf8_lossy(&line)))
}

fn write(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let socket = socket_arg(vm, "socket@write", args)?;
    let Some(Value::Str(content)) = args.get(1) else {
        return Err(invalid_call(vm, "socket@write"));
    };
    let result = socket.borrow_mut().write_all(content.as_bytes());
    match result {
        Ok(()) => Ok(Value::Null),
        Err(err) => Err(vm.raise_str(format!("socket write failed: {}", err))),
    }
}

fn close(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let socket = socket_arg(vm, "socket@close", args)?;
    let result = socket.borrow_mut().shutdown(Shutdown::Both);
    match result {
        Ok(()) => Ok(Value::Null),
        Err(err) => Err(vm.raise_str(format!("socket close failed: {}", err))),
    }
}
