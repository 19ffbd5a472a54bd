//! Typed-world bridge: encode/decode between compiler structures and Values
//!
//! Every typed sum-type constructor crosses the bridge as an object with a
//! `tag` (string) and `index` (integer) plus a positional `args` array;
//! decoding switches on `index` exhaustively and anything unrecognized is
//! an invalid-expression error. Class/enum declarations and monomorph
//! cells are encoded through an identity cache keyed on the source cell,
//! so shared and cyclic structures terminate and keep reference identity
//! on the Value side. Positions cross as opaque abstracts.

use super::errors::MacroError;
use super::eval::EvalContext;
use super::object::{FieldId, Object};
use super::value::{Arity, Handle, NativeCall, NativeFn, Value};
use crate::tast::{
    AnonField, ClassDef, ClassField, ClassRef, EnumCtor, EnumDef, EnumRef, FieldKind, FunArg,
    MonoRef, TConst, TExpr, TExprKind, Type, TypedDecl,
};
use fxhash::{FxHashMap, FxHasher};
use source_map::Pos;
use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use syntax::{BinaryOp, UnaryOp};

/// Decode recursion bound for structurally built (identity-free) graphs
const MAX_DECODE_DEPTH: usize = 64;

/// Identity caches from host cells to their encoded Values;
/// evaluator-lifetime, never cleared between macro invocations
#[derive(Default)]
pub struct BridgeCache {
    classes: FxHashMap<usize, Value>,
    enums: FxHashMap<usize, Value>,
    monos: FxHashMap<usize, Value>,
}

impl BridgeCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn invalid(message: impl Into<String>) -> MacroError {
    MacroError::InvalidExpression {
        message: message.into(),
        pos: Pos::unknown(),
    }
}

// --- Object-building helpers ---

fn set_field(
    ctx: &mut EvalContext,
    obj: &mut Object,
    name: &str,
    value: Value,
) -> Result<(), MacroError> {
    let id = ctx.fields.intern(name)?;
    obj.set(id, value);
    Ok(())
}

/// Build a `{tag, index, args}` constructor object
fn ctor(
    ctx: &mut EvalContext,
    tag: &str,
    index: i64,
    args: Vec<Value>,
) -> Result<Value, MacroError> {
    let mut obj = Object::new();
    set_field(ctx, &mut obj, "tag", Value::str(tag))?;
    set_field(ctx, &mut obj, "index", Value::Int(index))?;
    set_field(ctx, &mut obj, "args", Value::array(args))?;
    Ok(Value::object(obj))
}

// --- Decode helpers ---

fn expect_object(value: &Value) -> Result<Rc<RefCell<Object>>, MacroError> {
    value
        .as_object()
        .ok_or_else(|| invalid(format!("expected object, found {}", value.type_name())))
}

fn get_field(
    ctx: &mut EvalContext,
    obj: &Rc<RefCell<Object>>,
    name: &str,
) -> Result<Option<Value>, MacroError> {
    let id = ctx.fields.intern(name)?;
    Ok(obj.borrow().get(id))
}

fn require_field(
    ctx: &mut EvalContext,
    obj: &Rc<RefCell<Object>>,
    name: &str,
) -> Result<Value, MacroError> {
    get_field(ctx, obj, name)?.ok_or_else(|| invalid(format!("missing field '{}'", name)))
}

fn expect_int(value: &Value, what: &str) -> Result<i64, MacroError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(invalid(format!("{} must be Int, found {}", what, other.type_name()))),
    }
}

fn expect_str(value: &Value, what: &str) -> Result<Rc<str>, MacroError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(invalid(format!(
            "{} must be String, found {}",
            what,
            other.type_name()
        ))),
    }
}

fn expect_bool(value: &Value, what: &str) -> Result<bool, MacroError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(invalid(format!(
            "{} must be Bool, found {}",
            what,
            other.type_name()
        ))),
    }
}

fn expect_array(value: &Value, what: &str) -> Result<Vec<Value>, MacroError> {
    match value {
        Value::Array(a) => Ok(a.borrow().clone()),
        other => Err(invalid(format!(
            "{} must be Array, found {}",
            what,
            other.type_name()
        ))),
    }
}

fn expect_pos(value: &Value) -> Pos {
    match value {
        Value::Abstract(Handle::Pos(p)) => *p,
        _ => Pos::unknown(),
    }
}

/// `{tag, index, args}` of a constructor object
fn ctor_parts(
    ctx: &mut EvalContext,
    value: &Value,
) -> Result<(i64, Vec<Value>), MacroError> {
    let obj = expect_object(value)?;
    let index = expect_int(&require_field(ctx, &obj, "index")?, "constructor index")?;
    let args = expect_array(&require_field(ctx, &obj, "args")?, "constructor args")?;
    Ok((index, args))
}

// --- Positions ---

pub(crate) fn encode_pos(pos: Pos) -> Value {
    Value::Abstract(Handle::Pos(pos))
}

// --- Types ---

pub(crate) fn encode_type(ctx: &mut EvalContext, ty: &Type) -> Result<Value, MacroError> {
    match ty {
        Type::Mono(cell) => {
            let key = Rc::as_ptr(&cell.0) as usize;
            if let Some(cached) = ctx.bridge.monos.get(&key) {
                return Ok(cached.clone());
            }
            // Insert the shell before recursing: a bound monomorph can
            // reach itself through its own binding
            let shell = ctor(ctx, "TMono", 0, vec![Value::Null])?;
            ctx.bridge.monos.insert(key, shell.clone());
            let inner = match &*cell.0.borrow() {
                Some(bound) => encode_type(ctx, bound)?,
                None => Value::Null,
            };
            if let Value::Object(obj) = &shell {
                let args_id = ctx.fields.intern("args")?;
                obj.borrow_mut().set(args_id, Value::array(vec![inner]));
            }
            Ok(shell)
        }
        Type::Inst(class, params) => {
            let class_v = encode_class(ctx, class)?;
            let params_v = encode_types(ctx, params)?;
            ctor(ctx, "TInst", 1, vec![class_v, params_v])
        }
        Type::Enum(enum_ref, params) => {
            let enum_v = encode_enum(ctx, enum_ref)?;
            let params_v = encode_types(ctx, params)?;
            ctor(ctx, "TEnum", 2, vec![enum_v, params_v])
        }
        Type::Fun(args, ret) => {
            let mut encoded = Vec::with_capacity(args.len());
            for arg in args {
                let mut obj = Object::new();
                set_field(ctx, &mut obj, "name", Value::str(&arg.name))?;
                set_field(ctx, &mut obj, "opt", Value::Bool(arg.opt))?;
                let t = encode_type(ctx, &arg.ty)?;
                set_field(ctx, &mut obj, "t", t)?;
                encoded.push(Value::object(obj));
            }
            let ret_v = encode_type(ctx, ret)?;
            ctor(ctx, "TFun", 3, vec![Value::array(encoded), ret_v])
        }
        Type::Anon(fields) => {
            let mut encoded = Vec::with_capacity(fields.len());
            for field in fields {
                let mut obj = Object::new();
                set_field(ctx, &mut obj, "name", Value::str(&field.name))?;
                let t = encode_type(ctx, &field.ty)?;
                set_field(ctx, &mut obj, "t", t)?;
                encoded.push(Value::object(obj));
            }
            ctor(ctx, "TAnon", 4, vec![Value::array(encoded)])
        }
        Type::Dynamic => ctor(ctx, "TDynamic", 5, Vec::new()),
    }
}

fn encode_types(ctx: &mut EvalContext, types: &[Type]) -> Result<Value, MacroError> {
    let mut out = Vec::with_capacity(types.len());
    for ty in types {
        out.push(encode_type(ctx, ty)?);
    }
    Ok(Value::array(out))
}

pub(crate) fn decode_type(ctx: &mut EvalContext, value: &Value) -> Result<Type, MacroError> {
    decode_type_at(ctx, value, 0)
}

fn decode_type_at(
    ctx: &mut EvalContext,
    value: &Value,
    depth: usize,
) -> Result<Type, MacroError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(invalid("type graph too deep to decode"));
    }
    if let Value::Abstract(Handle::Type(ty)) = value {
        return Ok(ty.clone());
    }
    let (index, args) = ctor_parts(ctx, value)?;
    match index {
        0 => match args.first() {
            None | Some(Value::Null) => Ok(Type::Mono(MonoRef::unbound())),
            Some(inner) => Ok(Type::Mono(MonoRef::bound(decode_type_at(
                ctx,
                inner,
                depth + 1,
            )?))),
        },
        1 => {
            let class = decode_class(ctx, args.first().ok_or_else(|| invalid("TInst class"))?, depth + 1)?;
            let params = decode_types(ctx, args.get(1), depth + 1)?;
            Ok(Type::Inst(class, params))
        }
        2 => {
            let enum_ref = decode_enum(ctx, args.first().ok_or_else(|| invalid("TEnum enum"))?, depth + 1)?;
            let params = decode_types(ctx, args.get(1), depth + 1)?;
            Ok(Type::Enum(enum_ref, params))
        }
        3 => {
            let raw_args = expect_array(
                args.first().ok_or_else(|| invalid("TFun args"))?,
                "TFun args",
            )?;
            let mut fun_args = Vec::with_capacity(raw_args.len());
            for raw in &raw_args {
                let obj = expect_object(raw)?;
                let name = expect_str(&require_field(ctx, &obj, "name")?, "argument name")?;
                let opt = expect_bool(&require_field(ctx, &obj, "opt")?, "argument opt")?;
                let ty_field = require_field(ctx, &obj, "t")?;
                let ty = decode_type_at(ctx, &ty_field, depth + 1)?;
                fun_args.push(FunArg {
                    name: name.to_string(),
                    opt,
                    ty,
                });
            }
            let ret = decode_type_at(
                ctx,
                args.get(1).ok_or_else(|| invalid("TFun return"))?,
                depth + 1,
            )?;
            Ok(Type::Fun(fun_args, Box::new(ret)))
        }
        4 => {
            let raw_fields = expect_array(
                args.first().ok_or_else(|| invalid("TAnon fields"))?,
                "TAnon fields",
            )?;
            let mut fields = Vec::with_capacity(raw_fields.len());
            for raw in &raw_fields {
                let obj = expect_object(raw)?;
                let name = expect_str(&require_field(ctx, &obj, "name")?, "field name")?;
                let ty_field = require_field(ctx, &obj, "t")?;
                let ty = decode_type_at(ctx, &ty_field, depth + 1)?;
                fields.push(AnonField {
                    name: name.to_string(),
                    ty,
                });
            }
            Ok(Type::Anon(fields))
        }
        5 => Ok(Type::Dynamic),
        other => Err(invalid(format!("unknown type constructor index {}", other))),
    }
}

fn decode_types(
    ctx: &mut EvalContext,
    value: Option<&Value>,
    depth: usize,
) -> Result<Vec<Type>, MacroError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let raw = expect_array(value, "type parameters")?;
    let mut out = Vec::with_capacity(raw.len());
    for item in &raw {
        out.push(decode_type_at(ctx, item, depth)?);
    }
    Ok(out)
}

// --- Class and enum declarations ---

pub(crate) fn encode_class(ctx: &mut EvalContext, class: &ClassRef) -> Result<Value, MacroError> {
    let key = Rc::as_ptr(&class.0) as usize;
    if let Some(cached) = ctx.bridge.classes.get(&key) {
        return Ok(cached.clone());
    }

    // Cache the shell before touching superclass or field types: class
    // graphs are routinely cyclic
    let shell = Rc::new(RefCell::new(Object::new()));
    let shell_value = Value::Object(shell.clone());
    ctx.bridge.classes.insert(key, shell_value.clone());

    let def = class.borrow().clone();
    let mut fields = Object::new();
    set_field(ctx, &mut fields, "__decl", Value::Abstract(Handle::Class(class.clone())))?;
    set_field(
        ctx,
        &mut fields,
        "pack",
        Value::array(def.pack.iter().map(Value::str).collect()),
    )?;
    set_field(ctx, &mut fields, "name", Value::str(&def.name))?;
    set_field(
        ctx,
        &mut fields,
        "params",
        Value::array(def.params.iter().map(Value::str).collect()),
    )?;
    set_field(ctx, &mut fields, "isInterface", Value::Bool(def.is_interface))?;
    let superclass = match &def.superclass {
        Some((sup, params)) => {
            let mut obj = Object::new();
            let sup_v = encode_class(ctx, sup)?;
            set_field(ctx, &mut obj, "cls", sup_v)?;
            let params_v = encode_types(ctx, params)?;
            set_field(ctx, &mut obj, "params", params_v)?;
            Value::object(obj)
        }
        None => Value::Null,
    };
    set_field(ctx, &mut fields, "super", superclass)?;
    let members = encode_class_fields(ctx, &def.fields)?;
    set_field(ctx, &mut fields, "fields", members)?;
    let statics = encode_class_fields(ctx, &def.statics)?;
    set_field(ctx, &mut fields, "statics", statics)?;
    set_field(ctx, &mut fields, "pos", encode_pos(def.pos))?;

    *shell.borrow_mut() = fields;
    Ok(shell_value)
}

fn encode_class_fields(
    ctx: &mut EvalContext,
    fields: &[ClassField],
) -> Result<Value, MacroError> {
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let mut obj = Object::new();
        set_field(ctx, &mut obj, "name", Value::str(&field.name))?;
        let ty = encode_type(ctx, &field.ty)?;
        set_field(ctx, &mut obj, "type", ty)?;
        set_field(ctx, &mut obj, "isPublic", Value::Bool(field.public))?;
        let kind = match field.kind {
            FieldKind::Var => ctor(ctx, "FVar", 0, Vec::new())?,
            FieldKind::Method => ctor(ctx, "FMethod", 1, Vec::new())?,
        };
        set_field(ctx, &mut obj, "kind", kind)?;
        set_field(ctx, &mut obj, "pos", encode_pos(field.pos))?;
        out.push(Value::object(obj));
    }
    Ok(Value::array(out))
}

pub(crate) fn encode_enum(ctx: &mut EvalContext, enum_ref: &EnumRef) -> Result<Value, MacroError> {
    let key = Rc::as_ptr(&enum_ref.0) as usize;
    if let Some(cached) = ctx.bridge.enums.get(&key) {
        return Ok(cached.clone());
    }
    let shell = Rc::new(RefCell::new(Object::new()));
    let shell_value = Value::Object(shell.clone());
    ctx.bridge.enums.insert(key, shell_value.clone());

    let def = enum_ref.borrow().clone();
    let mut fields = Object::new();
    set_field(ctx, &mut fields, "__decl", Value::Abstract(Handle::Enum(enum_ref.clone())))?;
    set_field(
        ctx,
        &mut fields,
        "pack",
        Value::array(def.pack.iter().map(Value::str).collect()),
    )?;
    set_field(ctx, &mut fields, "name", Value::str(&def.name))?;
    set_field(
        ctx,
        &mut fields,
        "params",
        Value::array(def.params.iter().map(Value::str).collect()),
    )?;
    let mut ctors = Vec::with_capacity(def.ctors.len());
    for c in &def.ctors {
        let mut obj = Object::new();
        set_field(ctx, &mut obj, "name", Value::str(&c.name))?;
        set_field(ctx, &mut obj, "index", Value::Int(c.index as i64))?;
        let mut ctor_args = Vec::with_capacity(c.args.len());
        for (arg_name, arg_ty) in &c.args {
            let mut arg_obj = Object::new();
            set_field(ctx, &mut arg_obj, "name", Value::str(arg_name))?;
            let t = encode_type(ctx, arg_ty)?;
            set_field(ctx, &mut arg_obj, "t", t)?;
            ctor_args.push(Value::object(arg_obj));
        }
        set_field(ctx, &mut obj, "args", Value::array(ctor_args))?;
        ctors.push(Value::object(obj));
    }
    set_field(ctx, &mut fields, "ctors", Value::array(ctors))?;
    set_field(ctx, &mut fields, "pos", encode_pos(def.pos))?;

    *shell.borrow_mut() = fields;
    Ok(shell_value)
}

fn decode_class(
    ctx: &mut EvalContext,
    value: &Value,
    depth: usize,
) -> Result<ClassRef, MacroError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(invalid("class graph too deep to decode"));
    }
    if let Value::Abstract(Handle::Class(class)) = value {
        return Ok(class.clone());
    }
    let obj = expect_object(value)?;
    // Identity escape hatch: encoded declarations carry their source cell
    if let Some(Value::Abstract(Handle::Class(class))) = get_field(ctx, &obj, "__decl")? {
        return Ok(class);
    }

    let name = expect_str(&require_field(ctx, &obj, "name")?, "class name")?;
    let pack = decode_string_array(ctx, &obj, "pack")?;
    let path = if pack.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", pack.join("."), name)
    };
    // Registered declarations resolve by path
    if let Some(TypedDecl::Class(class)) = ctx.types.get(&path).cloned() {
        return Ok(class);
    }

    // Structurally built declaration: construct a fresh cell
    let params = decode_string_array(ctx, &obj, "params").unwrap_or_default();
    let is_interface = match get_field(ctx, &obj, "isInterface")? {
        Some(v) => expect_bool(&v, "isInterface")?,
        None => false,
    };
    let superclass = match get_field(ctx, &obj, "super")? {
        Some(Value::Null) | None => None,
        Some(sup) => {
            let sup_obj = expect_object(&sup)?;
            let cls_field = require_field(ctx, &sup_obj, "cls")?;
            let cls = decode_class(ctx, &cls_field, depth + 1)?;
            let params_v = get_field(ctx, &sup_obj, "params")?;
            let params = decode_types(ctx, params_v.as_ref(), depth + 1)?;
            Some((cls, params))
        }
    };
    let fields_v = get_field(ctx, &obj, "fields")?;
    let fields = decode_class_fields(ctx, fields_v, depth)?;
    let statics_v = get_field(ctx, &obj, "statics")?;
    let statics = decode_class_fields(ctx, statics_v, depth)?;
    let pos = get_field(ctx, &obj, "pos")?
        .map(|v| expect_pos(&v))
        .unwrap_or_default();

    Ok(ClassRef::new(ClassDef {
        pack,
        name: name.to_string(),
        params,
        superclass,
        is_interface,
        fields,
        statics,
        pos,
    }))
}

fn decode_class_fields(
    ctx: &mut EvalContext,
    value: Option<Value>,
    depth: usize,
) -> Result<Vec<ClassField>, MacroError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let raw = expect_array(&value, "class fields")?;
    let mut out = Vec::with_capacity(raw.len());
    for item in &raw {
        let obj = expect_object(item)?;
        let name = expect_str(&require_field(ctx, &obj, "name")?, "field name")?;
        let ty_field = require_field(ctx, &obj, "type")?;
        let ty = decode_type_at(ctx, &ty_field, depth + 1)?;
        let public = match get_field(ctx, &obj, "isPublic")? {
            Some(v) => expect_bool(&v, "isPublic")?,
            None => false,
        };
        let kind = match get_field(ctx, &obj, "kind")? {
            Some(kind_v) => {
                let (index, _) = ctor_parts(ctx, &kind_v)?;
                match index {
                    0 => FieldKind::Var,
                    1 => FieldKind::Method,
                    other => return Err(invalid(format!("unknown field kind index {}", other))),
                }
            }
            None => FieldKind::Var,
        };
        let pos = get_field(ctx, &obj, "pos")?
            .map(|v| expect_pos(&v))
            .unwrap_or_default();
        out.push(ClassField {
            name: name.to_string(),
            ty,
            public,
            kind,
            constant: None,
            pos,
        });
    }
    Ok(out)
}

fn decode_enum(
    ctx: &mut EvalContext,
    value: &Value,
    depth: usize,
) -> Result<EnumRef, MacroError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(invalid("enum graph too deep to decode"));
    }
    if let Value::Abstract(Handle::Enum(enum_ref)) = value {
        return Ok(enum_ref.clone());
    }
    let obj = expect_object(value)?;
    if let Some(Value::Abstract(Handle::Enum(enum_ref))) = get_field(ctx, &obj, "__decl")? {
        return Ok(enum_ref);
    }

    let name = expect_str(&require_field(ctx, &obj, "name")?, "enum name")?;
    let pack = decode_string_array(ctx, &obj, "pack")?;
    let path = if pack.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", pack.join("."), name)
    };
    if let Some(TypedDecl::Enum(enum_ref)) = ctx.types.get(&path).cloned() {
        return Ok(enum_ref);
    }

    let params = decode_string_array(ctx, &obj, "params").unwrap_or_default();
    let raw_ctors = match get_field(ctx, &obj, "ctors")? {
        Some(v) => expect_array(&v, "enum constructors")?,
        None => Vec::new(),
    };
    let mut ctors = Vec::with_capacity(raw_ctors.len());
    for raw in &raw_ctors {
        let ctor_obj = expect_object(raw)?;
        let ctor_name = expect_str(&require_field(ctx, &ctor_obj, "name")?, "constructor name")?;
        let index = expect_int(&require_field(ctx, &ctor_obj, "index")?, "constructor index")?;
        let raw_args = match get_field(ctx, &ctor_obj, "args")? {
            Some(v) => expect_array(&v, "constructor args")?,
            None => Vec::new(),
        };
        let mut args = Vec::with_capacity(raw_args.len());
        for raw_arg in &raw_args {
            let arg_obj = expect_object(raw_arg)?;
            let arg_name = expect_str(&require_field(ctx, &arg_obj, "name")?, "argument name")?;
            let ty_field = require_field(ctx, &arg_obj, "t")?;
            let ty = decode_type_at(ctx, &ty_field, depth + 1)?;
            args.push((arg_name.to_string(), ty));
        }
        ctors.push(EnumCtor {
            name: ctor_name.to_string(),
            index: index as u32,
            args,
        });
    }
    let pos = get_field(ctx, &obj, "pos")?
        .map(|v| expect_pos(&v))
        .unwrap_or_default();

    Ok(EnumRef::new(EnumDef {
        pack,
        name: name.to_string(),
        params,
        ctors,
        pos,
    }))
}

fn decode_string_array(
    ctx: &mut EvalContext,
    obj: &Rc<RefCell<Object>>,
    name: &str,
) -> Result<Vec<String>, MacroError> {
    let Some(value) = get_field(ctx, obj, name)? else {
        return Ok(Vec::new());
    };
    let raw = expect_array(&value, name)?;
    raw.iter()
        .map(|v| expect_str(v, name).map(|s| s.to_string()))
        .collect()
}

/// Decode a typed declaration: an abstract handle, or an encoded/structural
/// declaration object (enums are recognized by their `ctors` field)
pub(crate) fn decode_decl(ctx: &mut EvalContext, value: &Value) -> Result<TypedDecl, MacroError> {
    match value {
        Value::Abstract(Handle::Class(class)) => Ok(TypedDecl::Class(class.clone())),
        Value::Abstract(Handle::Enum(enum_ref)) => Ok(TypedDecl::Enum(enum_ref.clone())),
        Value::Object(obj) => {
            if get_field(ctx, obj, "ctors")?.is_some() {
                Ok(TypedDecl::Enum(decode_enum(ctx, value, 0)?))
            } else {
                Ok(TypedDecl::Class(decode_class(ctx, value, 0)?))
            }
        }
        other => Err(invalid(format!(
            "cannot decode a {} as a declaration",
            other.type_name()
        ))),
    }
}

// --- Typed expressions ---

pub(crate) fn encode_texpr(ctx: &mut EvalContext, expr: &TExpr) -> Result<Value, MacroError> {
    let (tag, index, args) = match &expr.kind {
        TExprKind::Const(c) => ("TConst", 0, vec![encode_const(ctx, c)?]),
        TExprKind::Local(name) => ("TLocal", 1, vec![Value::str(name)]),
        TExprKind::ArrayDecl(items) => ("TArrayDecl", 2, vec![encode_texprs(ctx, items)?]),
        TExprKind::Binop(op, a, b) => {
            let op_v = encode_binop(ctx, *op)?;
            let a_v = encode_texpr(ctx, a)?;
            let b_v = encode_texpr(ctx, b)?;
            ("TBinop", 3, vec![op_v, a_v, b_v])
        }
        TExprKind::Unop(op, postfix, inner) => {
            let op_v = encode_unop(ctx, *op)?;
            let inner_v = encode_texpr(ctx, inner)?;
            ("TUnop", 4, vec![op_v, Value::Bool(*postfix), inner_v])
        }
        TExprKind::Field(base, name) => {
            let base_v = encode_texpr(ctx, base)?;
            ("TField", 5, vec![base_v, Value::str(name)])
        }
        TExprKind::Call(callee, call_args) => {
            let callee_v = encode_texpr(ctx, callee)?;
            let args_v = encode_texprs(ctx, call_args)?;
            ("TCall", 6, vec![callee_v, args_v])
        }
        TExprKind::If(cond, then_branch, else_branch) => {
            let cond_v = encode_texpr(ctx, cond)?;
            let then_v = encode_texpr(ctx, then_branch)?;
            let else_v = match else_branch {
                Some(e) => encode_texpr(ctx, e)?,
                None => Value::Null,
            };
            ("TIf", 7, vec![cond_v, then_v, else_v])
        }
        TExprKind::Block(items) => ("TBlock", 8, vec![encode_texprs(ctx, items)?]),
        TExprKind::Var(name, init) => {
            let init_v = match init {
                Some(e) => encode_texpr(ctx, e)?,
                None => Value::Null,
            };
            ("TVar", 9, vec![Value::str(name), init_v])
        }
        TExprKind::While(cond, body, normal) => {
            let cond_v = encode_texpr(ctx, cond)?;
            let body_v = encode_texpr(ctx, body)?;
            ("TWhile", 10, vec![cond_v, body_v, Value::Bool(*normal)])
        }
        TExprKind::Return(value) => {
            let value_v = match value {
                Some(e) => encode_texpr(ctx, e)?,
                None => Value::Null,
            };
            ("TReturn", 11, vec![value_v])
        }
        TExprKind::Break => ("TBreak", 12, Vec::new()),
        TExprKind::Continue => ("TContinue", 13, Vec::new()),
        TExprKind::Throw(inner) => ("TThrow", 14, vec![encode_texpr(ctx, inner)?]),
        TExprKind::Function(params, body) => {
            let mut encoded = Vec::with_capacity(params.len());
            for (name, ty) in params {
                let mut obj = Object::new();
                set_field(ctx, &mut obj, "name", Value::str(name))?;
                set_field(ctx, &mut obj, "t", Value::Abstract(Handle::Type(ty.clone())))?;
                encoded.push(Value::object(obj));
            }
            let body_v = encode_texpr(ctx, body)?;
            ("TFunction", 15, vec![Value::array(encoded), body_v])
        }
        TExprKind::New(class, params, call_args) => {
            let class_v = encode_class(ctx, class)?;
            let params_v = encode_types(ctx, params)?;
            let args_v = encode_texprs(ctx, call_args)?;
            ("TNew", 16, vec![class_v, params_v, args_v])
        }
        TExprKind::ObjectDecl(fields) => {
            let mut encoded = Vec::with_capacity(fields.len());
            for (name, value) in fields {
                let mut obj = Object::new();
                set_field(ctx, &mut obj, "name", Value::str(name))?;
                let expr_v = encode_texpr(ctx, value)?;
                set_field(ctx, &mut obj, "expr", expr_v)?;
                encoded.push(Value::object(obj));
            }
            ("TObjectDecl", 17, vec![Value::array(encoded)])
        }
    };

    let ctor_v = ctor(ctx, tag, index, args)?;
    if let Value::Object(obj) = &ctor_v {
        let t_id = ctx.fields.intern("t")?;
        let pos_id = ctx.fields.intern("pos")?;
        let mut obj = obj.borrow_mut();
        obj.set(t_id, Value::Abstract(Handle::Type(expr.ty.clone())));
        obj.set(pos_id, encode_pos(expr.pos));
    }
    Ok(ctor_v)
}

fn encode_texprs(ctx: &mut EvalContext, exprs: &[TExpr]) -> Result<Value, MacroError> {
    let mut out = Vec::with_capacity(exprs.len());
    for e in exprs {
        out.push(encode_texpr(ctx, e)?);
    }
    Ok(Value::array(out))
}

fn encode_const(ctx: &mut EvalContext, c: &TConst) -> Result<Value, MacroError> {
    match c {
        TConst::Int(i) => ctor(ctx, "CInt", 0, vec![Value::Int(*i)]),
        TConst::Float(f) => ctor(ctx, "CFloat", 1, vec![Value::Float(*f)]),
        TConst::Str(s) => ctor(ctx, "CString", 2, vec![Value::str(s)]),
        TConst::Bool(b) => ctor(ctx, "CBool", 3, vec![Value::Bool(*b)]),
        TConst::Null => ctor(ctx, "CNull", 4, Vec::new()),
        TConst::This => ctor(ctx, "CThis", 5, Vec::new()),
    }
}

fn encode_binop(ctx: &mut EvalContext, op: BinaryOp) -> Result<Value, MacroError> {
    let (tag, index) = binop_parts(op);
    ctor(ctx, tag, index, Vec::new())
}

fn binop_parts(op: BinaryOp) -> (&'static str, i64) {
    match op {
        BinaryOp::Add => ("OpAdd", 0),
        BinaryOp::Sub => ("OpSub", 1),
        BinaryOp::Mul => ("OpMul", 2),
        BinaryOp::Div => ("OpDiv", 3),
        BinaryOp::Mod => ("OpMod", 4),
        BinaryOp::Eq => ("OpEq", 5),
        BinaryOp::NotEq => ("OpNotEq", 6),
        BinaryOp::Lt => ("OpLt", 7),
        BinaryOp::Le => ("OpLte", 8),
        BinaryOp::Gt => ("OpGt", 9),
        BinaryOp::Ge => ("OpGte", 10),
        BinaryOp::And => ("OpBoolAnd", 11),
        BinaryOp::Or => ("OpBoolOr", 12),
        BinaryOp::BitAnd => ("OpAnd", 13),
        BinaryOp::BitOr => ("OpOr", 14),
        BinaryOp::BitXor => ("OpXor", 15),
        BinaryOp::Shl => ("OpShl", 16),
        BinaryOp::Shr => ("OpShr", 17),
        BinaryOp::Ushr => ("OpUShr", 18),
        BinaryOp::Range => ("OpInterval", 19),
        BinaryOp::NullCoal => ("OpNullCoal", 20),
    }
}

fn binop_from_index(index: i64) -> Option<BinaryOp> {
    Some(match index {
        0 => BinaryOp::Add,
        1 => BinaryOp::Sub,
        2 => BinaryOp::Mul,
        3 => BinaryOp::Div,
        4 => BinaryOp::Mod,
        5 => BinaryOp::Eq,
        6 => BinaryOp::NotEq,
        7 => BinaryOp::Lt,
        8 => BinaryOp::Le,
        9 => BinaryOp::Gt,
        10 => BinaryOp::Ge,
        11 => BinaryOp::And,
        12 => BinaryOp::Or,
        13 => BinaryOp::BitAnd,
        14 => BinaryOp::BitOr,
        15 => BinaryOp::BitXor,
        16 => BinaryOp::Shl,
        17 => BinaryOp::Shr,
        18 => BinaryOp::Ushr,
        19 => BinaryOp::Range,
        20 => BinaryOp::NullCoal,
        _ => return None,
    })
}

fn encode_unop(ctx: &mut EvalContext, op: UnaryOp) -> Result<Value, MacroError> {
    let (tag, index) = match op {
        UnaryOp::Neg => ("OpNeg", 0),
        UnaryOp::Not => ("OpNot", 1),
        UnaryOp::BitNot => ("OpNegBits", 2),
        UnaryOp::Incr => ("OpIncrement", 3),
        UnaryOp::Decr => ("OpDecrement", 4),
    };
    ctor(ctx, tag, index, Vec::new())
}

fn unop_from_index(index: i64) -> Option<UnaryOp> {
    Some(match index {
        0 => UnaryOp::Neg,
        1 => UnaryOp::Not,
        2 => UnaryOp::BitNot,
        3 => UnaryOp::Incr,
        4 => UnaryOp::Decr,
        _ => return None,
    })
}

pub(crate) fn decode_texpr(ctx: &mut EvalContext, value: &Value) -> Result<TExpr, MacroError> {
    decode_texpr_at(ctx, value, 0)
}

fn decode_texpr_at(
    ctx: &mut EvalContext,
    value: &Value,
    depth: usize,
) -> Result<TExpr, MacroError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(invalid("expression graph too deep to decode"));
    }
    if let Value::Abstract(Handle::TypedExpr(texpr)) = value {
        return Ok((**texpr).clone());
    }
    let obj = expect_object(value)?;
    let index = expect_int(&require_field(ctx, &obj, "index")?, "expression index")?;
    let args = expect_array(&require_field(ctx, &obj, "args")?, "expression args")?;
    let ty = match get_field(ctx, &obj, "t")? {
        Some(Value::Abstract(Handle::Type(ty))) => ty,
        Some(Value::Null) | None => Type::Dynamic,
        Some(structural) => decode_type_at(ctx, &structural, depth + 1)?,
    };
    let pos = get_field(ctx, &obj, "pos")?
        .map(|v| expect_pos(&v))
        .unwrap_or_default();

    let arg = |i: usize| -> Result<&Value, MacroError> {
        args.get(i)
            .ok_or_else(|| invalid(format!("missing expression argument {}", i)))
    };

    let kind = match index {
        0 => TExprKind::Const(decode_const(ctx, arg(0)?)?),
        1 => TExprKind::Local(expect_str(arg(0)?, "local name")?.to_string()),
        2 => TExprKind::ArrayDecl(decode_texprs(ctx, arg(0)?, depth)?),
        3 => {
            let (op_index, _) = ctor_parts(ctx, arg(0)?)?;
            let op = binop_from_index(op_index)
                .ok_or_else(|| invalid(format!("unknown binop index {}", op_index)))?;
            let a = decode_texpr_at(ctx, arg(1)?, depth + 1)?;
            let b = decode_texpr_at(ctx, arg(2)?, depth + 1)?;
            TExprKind::Binop(op, Box::new(a), Box::new(b))
        }
        4 => {
            let (op_index, _) = ctor_parts(ctx, arg(0)?)?;
            let op = unop_from_index(op_index)
                .ok_or_else(|| invalid(format!("unknown unop index {}", op_index)))?;
            let postfix = expect_bool(arg(1)?, "postfix flag")?;
            let inner = decode_texpr_at(ctx, arg(2)?, depth + 1)?;
            TExprKind::Unop(op, postfix, Box::new(inner))
        }
        5 => {
            let base = decode_texpr_at(ctx, arg(0)?, depth + 1)?;
            let name = expect_str(arg(1)?, "field name")?.to_string();
            TExprKind::Field(Box::new(base), name)
        }
        6 => {
            let callee = decode_texpr_at(ctx, arg(0)?, depth + 1)?;
            let call_args = decode_texprs(ctx, arg(1)?, depth)?;
            TExprKind::Call(Box::new(callee), call_args)
        }
        7 => {
            let cond = decode_texpr_at(ctx, arg(0)?, depth + 1)?;
            let then_branch = decode_texpr_at(ctx, arg(1)?, depth + 1)?;
            let else_branch = match arg(2)? {
                Value::Null => None,
                other => Some(Box::new(decode_texpr_at(ctx, other, depth + 1)?)),
            };
            TExprKind::If(Box::new(cond), Box::new(then_branch), else_branch)
        }
        8 => TExprKind::Block(decode_texprs(ctx, arg(0)?, depth)?),
        9 => {
            let name = expect_str(arg(0)?, "var name")?.to_string();
            let init = match arg(1)? {
                Value::Null => None,
                other => Some(Box::new(decode_texpr_at(ctx, other, depth + 1)?)),
            };
            TExprKind::Var(name, init)
        }
        10 => {
            let cond = decode_texpr_at(ctx, arg(0)?, depth + 1)?;
            let body = decode_texpr_at(ctx, arg(1)?, depth + 1)?;
            let normal = expect_bool(arg(2)?, "while flag")?;
            TExprKind::While(Box::new(cond), Box::new(body), normal)
        }
        11 => match arg(0)? {
            Value::Null => TExprKind::Return(None),
            other => TExprKind::Return(Some(Box::new(decode_texpr_at(ctx, other, depth + 1)?))),
        },
        12 => TExprKind::Break,
        13 => TExprKind::Continue,
        14 => TExprKind::Throw(Box::new(decode_texpr_at(ctx, arg(0)?, depth + 1)?)),
        15 => {
            let raw_params = expect_array(arg(0)?, "function params")?;
            let mut params = Vec::with_capacity(raw_params.len());
            for raw in &raw_params {
                let param_obj = expect_object(raw)?;
                let name = expect_str(&require_field(ctx, &param_obj, "name")?, "param name")?;
                let ty = match require_field(ctx, &param_obj, "t")? {
                    Value::Abstract(Handle::Type(ty)) => ty,
                    structural => decode_type_at(ctx, &structural, depth + 1)?,
                };
                params.push((name.to_string(), ty));
            }
            let body = decode_texpr_at(ctx, arg(1)?, depth + 1)?;
            TExprKind::Function(params, Box::new(body))
        }
        16 => {
            let class = decode_class(ctx, arg(0)?, depth + 1)?;
            let params = decode_types(ctx, Some(arg(1)?), depth + 1)?;
            let call_args = decode_texprs(ctx, arg(2)?, depth)?;
            TExprKind::New(class, params, call_args)
        }
        17 => {
            let raw_fields = expect_array(arg(0)?, "object fields")?;
            let mut fields = Vec::with_capacity(raw_fields.len());
            for raw in &raw_fields {
                let field_obj = expect_object(raw)?;
                let name = expect_str(&require_field(ctx, &field_obj, "name")?, "field name")?;
                let expr_field = require_field(ctx, &field_obj, "expr")?;
                let expr = decode_texpr_at(ctx, &expr_field, depth + 1)?;
                fields.push((name.to_string(), expr));
            }
            TExprKind::ObjectDecl(fields)
        }
        other => return Err(invalid(format!("unknown expression index {}", other))),
    };

    Ok(TExpr { kind, ty, pos })
}

fn decode_texprs(
    ctx: &mut EvalContext,
    value: &Value,
    depth: usize,
) -> Result<Vec<TExpr>, MacroError> {
    let raw = expect_array(value, "expression list")?;
    let mut out = Vec::with_capacity(raw.len());
    for item in &raw {
        out.push(decode_texpr_at(ctx, item, depth + 1)?);
    }
    Ok(out)
}

fn decode_const(ctx: &mut EvalContext, value: &Value) -> Result<TConst, MacroError> {
    let (index, args) = ctor_parts(ctx, value)?;
    Ok(match index {
        0 => TConst::Int(expect_int(
            args.first().ok_or_else(|| invalid("CInt value"))?,
            "CInt value",
        )?),
        1 => match args.first() {
            Some(Value::Float(f)) => TConst::Float(*f),
            Some(Value::Int(i)) => TConst::Float(*i as f64),
            _ => return Err(invalid("CFloat value")),
        },
        2 => TConst::Str(
            expect_str(args.first().ok_or_else(|| invalid("CString value"))?, "CString value")?
                .to_string(),
        ),
        3 => TConst::Bool(expect_bool(
            args.first().ok_or_else(|| invalid("CBool value"))?,
            "CBool value",
        )?),
        4 => TConst::Null,
        5 => TConst::This,
        other => return Err(invalid(format!("unknown constant index {}", other))),
    })
}

// --- Enum namespaces ---

/// Build the global namespace object for an enum: argument-less
/// constructors become instances immediately, the rest become synthetic
/// native constructors producing `{tag, index, args}` instances.
pub(crate) fn enum_namespace(
    ctx: &mut EvalContext,
    enum_ref: &EnumRef,
) -> Result<Value, MacroError> {
    let mut namespace = Object::new();
    set_field(
        ctx,
        &mut namespace,
        "__enum",
        Value::Abstract(Handle::Enum(enum_ref.clone())),
    )?;
    let def = enum_ref.borrow().clone();
    let path = def.path();
    for c in &def.ctors {
        let field_id = ctx.fields.intern(&c.name)?;
        if c.args.is_empty() {
            let instance = ctor(ctx, &c.name, c.index as i64, Vec::new())?;
            namespace.set(field_id, instance);
        } else {
            let prim_name = format!("{}.{}", path, c.name);
            let tag_id = ctx.fields.intern("tag")?;
            let index_id = ctx.fields.intern("index")?;
            let args_id = ctx.fields.intern("args")?;
            let ctor_name = c.name.clone();
            let ctor_index = c.index as i64;
            let arity = c.args.len();
            let constructor = move |vm: &mut super::eval::Vm, args: &[Value]| {
                if args.len() != arity {
                    return Err(super::value::invalid_call(vm, &format!(
                        "{} (expects {} arguments)",
                        ctor_name, arity
                    )));
                }
                let mut instance = Object::new();
                instance.set(tag_id, Value::str(ctor_name.as_str()));
                instance.set(index_id, Value::Int(ctor_index));
                instance.set(args_id, Value::array(args.to_vec()));
                Ok(Value::object(instance))
            };
            namespace.set(
                field_id,
                Value::Native(Rc::new(NativeFn {
                    name: prim_name,
                    arity: Arity::Exact(arity as u8),
                    call: NativeCall::Dyn(Rc::new(constructor)),
                })),
            );
        }
    }
    Ok(Value::object(namespace))
}

// --- Signatures ---

/// Stable content hash of an arbitrary Value graph. Reference identity is
/// resolved through a per-call visited table, so cyclic graphs terminate
/// and two independently built but structurally identical graphs hash the
/// same.
pub fn signature(value: &Value) -> u64 {
    let mut hasher = FxHasher::default();
    let mut visited: FxHashMap<usize, u32> = FxHashMap::default();
    walk(value, &mut hasher, &mut visited);
    hasher.finish()
}

/// Hex rendering of [`signature`], the script-visible form
pub(crate) fn signature_hex(value: &Value) -> String {
    format!("{:016x}", signature(value))
}

fn walk(value: &Value, hasher: &mut FxHasher, visited: &mut FxHashMap<usize, u32>) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Float(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Str(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            let key = Rc::as_ptr(items) as usize;
            if let Some(back) = visited.get(&key) {
                5u8.hash(hasher);
                back.hash(hasher);
                return;
            }
            visited.insert(key, visited.len() as u32);
            6u8.hash(hasher);
            let items = items.borrow();
            items.len().hash(hasher);
            for item in items.iter() {
                walk(item, hasher, visited);
            }
        }
        Value::Object(obj) => {
            let key = Rc::as_ptr(obj) as usize;
            if let Some(back) = visited.get(&key) {
                7u8.hash(hasher);
                back.hash(hasher);
                return;
            }
            visited.insert(key, visited.len() as u32);
            8u8.hash(hasher);
            let obj = obj.borrow();
            obj.len().hash(hasher);
            // Fields are stored sorted by id, so iteration order is stable
            for (FieldId(id), field_value) in obj.iter() {
                id.hash(hasher);
                walk(field_value, hasher, visited);
            }
            match obj.proto() {
                Some(proto) => walk(&Value::Object(proto), hasher, visited),
                None => 9u8.hash(hasher),
            }
        }
        Value::Abstract(handle) => {
            10u8.hash(hasher);
            handle.kind_name().hash(hasher);
            match handle {
                Handle::Pos(p) => {
                    p.file.as_u32().hash(hasher);
                    p.min.hash(hasher);
                    p.max.hash(hasher);
                }
                Handle::Class(c) => c.path().hash(hasher),
                Handle::Enum(e) => e.path().hash(hasher),
                Handle::Buffer(b) => b.borrow().hash(hasher),
                _ => {}
            }
        }
        Value::Native(n) => {
            11u8.hash(hasher);
            n.name.hash(hasher);
        }
        Value::Closure(c) => {
            12u8.hash(hasher);
            c.proto.name.hash(hasher);
            c.proto.params.len().hash(hasher);
        }
    }
}
