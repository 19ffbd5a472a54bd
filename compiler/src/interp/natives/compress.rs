//! Compression primitives (`compress@*`), backed by the `zstd` crate
//!
//! One-shot forms work on whole payloads; the stream handles accumulate
//! input and produce their output on `close`.

use crate::interp::errors::Control;
use crate::interp::eval::{EvalResult, Vm};
use crate::interp::registry::NativeRegistry;
use crate::interp::value::{invalid_call, Handle, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Direction of a compression stream
pub enum StreamMode {
    Compress(i32),
    Expand,
}

/// An open compression/decompression stream
pub struct CompressState {
    pub mode: StreamMode,
    input: Vec<u8>,
    closed: bool,
}

pub(crate) fn register(reg: &mut NativeRegistry) {
    reg.register_fn("compress@compress", 2, compress_once);
    reg.register_fn("compress@decompress", 1, decompress_once);
    reg.register_fn("compress@new", 1, new);
    reg.register_fn("compress@expand_new", 0, expand_new);
    reg.register_fn("compress@add", 2, add);
    reg.register_fn("compress@close", 1, close);
}

fn payload_bytes(vm: &mut Vm, prim: &str, value: Option<&Value>) -> Result<Vec<u8>, Control> {
    match value {
        Some(Value::Str(s)) => Ok(s.as_bytes().to_vec()),
        Some(Value::Abstract(Handle::Buffer(b))) => Ok(b.borrow().clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn buffer_value(bytes: Vec<u8>) -> Value {
    Value::Abstract(Handle::Buffer(Rc::new(RefCell::new(bytes))))
}

fn stream_arg(
    vm: &mut Vm,
    prim: &str,
    args: &[Value],
) -> Result<Rc<RefCell<CompressState>>, Control> {
    match args.first() {
        Some(Value::Abstract(Handle::Compress(c))) => Ok(c.clone()),
        _ => Err(invalid_call(vm, prim)),
    }
}

fn compress_once(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let data = payload_bytes(vm, "compress@compress", args.first())?;
    let Some(level) = args.get(1).and_then(Value::as_int) else {
        return Err(invalid_call(vm, "compress@compress"));
    };
    match zstd::stream::encode_all(&data[..], level as i32) {
        Ok(out) => Ok(buffer_value(out)),
        Err(err) => Err(vm.raise_str(format!("compression failed: {}", err))),
    }
}

fn decompress_once(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let data = payload_bytes(vm, "compress@decompress", args.first())?;
    match zstd::stream::decode_all(&data[..]) {
        Ok(out) => Ok(buffer_value(out)),
        Err(err) => Err(vm.raise_str(format!("decompression failed: {}", err))),
    }
}

fn new(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let Some(level) = args.first().and_then(Value::as_int) else {
        return Err(invalid_call(vm, "compress@new"));
    };
    Ok(Value::Abstract(Handle::Compress(Rc::new(RefCell::new(
        CompressState {
            mode: StreamMode::Compress(level as i32),
            input: Vec::new(),
            closed: false,
        },
    )))))
}

fn expand_new(_vm: &mut Vm, _args: &[Value]) -> EvalResult {
    Ok(Value::Abstract(Handle::Compress(Rc::new(RefCell::new(
        CompressState {
            mode: StreamMode::Expand,
            input: Vec::new(),
            closed: false,
        },
    )))))
}

fn add(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let stream = stream_arg(vm, "compress@add", args)?;
    let data = payload_bytes(vm, "compress@add", args.get(1))?;
    let mut stream = stream.borrow_mut();
    if stream.closed {
        return Err(vm.raise_str("compression stream already closed"));
    }
    stream.input.extend_from_slice(&data);
    Ok(Value::Int(data.len() as i64))
}

fn close(vm: &mut Vm, args: &[Value]) -> EvalResult {
    let stream = stream_arg(vm, "compress@close", args)?;
    let mut stream = stream.borrow_mut();
    if stream.closed {
        return Err(vm.raise_str("compression stream already closed"));
    }
    stream.closed = true;
    let result = match stream.mode {
        StreamMode::Compress(level) => zstd::stream::encode_all(&stream.input[..], level),
        StreamMode::Expand => zstd::stream::decode_all(&stream.input[..]),
    };
    match result {
        Ok(out) => Ok(buffer_value(out)),
        Err(err) => Err(vm.raise_str(format!("compression stream failed: {}", err))),
    }
}
