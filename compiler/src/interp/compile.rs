//! Compilation of macro scripts into evaluation thunks
//!
//! Every syntax node is compiled exactly once into a reusable thunk;
//! running a loop re-invokes the same thunks rather than revisiting the
//! AST. Identifier resolution happens here, through the scope resolver,
//! and the outcome (slot offset, environment index, global cell, receiver)
//! is baked into the generated accessor. Field names are interned here
//! too, so a field-id collision surfaces before any evaluation starts.

use super::errors::{Control, MacroError};
use super::eval::{EvalContext, EvalResult, Thunk, Vm};
use super::object::FieldId;
use super::ops;
use super::scope::{CaptureSource, Resolver, ResolvedVar};
use super::value::{Closure, FnProto, ParamSpec, Value};
use smallvec::SmallVec;
use source_map::Pos;
use std::cell::RefCell;
use std::rc::Rc;
use syntax::{AssignOp, BinaryOp, Case, Expr, ExprKind, Param, StringPart, UnaryOp};

/// Largest integer key a switch jump table will span
const JUMP_TABLE_LIMIT: i64 = 512;

/// Arguments buffer for calls; most calls take a handful of arguments
type ArgVec = SmallVec<[Value; 8]>;

fn thunk(f: impl Fn(&mut Vm) -> EvalResult + 'static) -> Thunk {
    Rc::new(f)
}

/// Compile a top-level macro script. The program runs in an implicit
/// function frame: its `var` declarations are frame locals, popped when
/// evaluation finishes, and a stray `return` yields the program value.
pub(crate) fn compile_program(ctx: &mut EvalContext, expr: &Expr) -> Result<Thunk, MacroError> {
    let mut compiler = Compiler {
        ctx,
        resolver: Resolver::new(),
    };
    let body = compiler.comp(expr)?;
    Ok(thunk(move |vm| {
        let base = vm.stack_depth();
        let result = body(vm);
        vm.truncate_stack(base);
        match result {
            Err(Control::Return(v)) => Ok(v),
            other => other,
        }
    }))
}

/// Compile a standalone function (registered macro or static method).
/// Free identifiers resolve to globals; there is no enclosing scope to
/// capture from.
pub(crate) fn compile_function(
    ctx: &mut EvalContext,
    fun: &syntax::FunctionExpr,
    pos: Pos,
) -> Result<Rc<FnProto>, MacroError> {
    let mut compiler = Compiler {
        ctx,
        resolver: Resolver::new(),
    };
    let (proto, captures) = compiler.closure_proto(&fun.name, &fun.params, &fun.body, pos)?;
    debug_assert!(captures.is_empty(), "top-level functions capture nothing");
    Ok(proto)
}

/// How a closure fetches one captured value at creation time
enum CapAccess {
    /// Relative stack offset in the creating frame
    Stack(usize),
    /// Environment slot of the creating closure
    Env(usize),
}

/// An assignable target, resolved at compile time
enum LTarget {
    Local(usize),
    Env(usize),
    Global(Rc<RefCell<Value>>),
    Field {
        obj: Thunk,
        fid: FieldId,
        name: Rc<str>,
        pos: Pos,
    },
    Index {
        obj: Thunk,
        index: Thunk,
        pos: Pos,
    },
}

struct Compiler<'a> {
    ctx: &'a mut EvalContext,
    resolver: Resolver,
}

impl<'a> Compiler<'a> {
    /// Compile one expression node into its thunk
    fn comp(&mut self, e: &Expr) -> Result<Thunk, MacroError> {
        let pos = e.pos;
        match &e.kind {
            // --- Literals ---
            ExprKind::Int(i) => {
                let i = *i;
                Ok(thunk(move |_| Ok(Value::Int(i))))
            }
            ExprKind::Float(f) => {
                let f = *f;
                Ok(thunk(move |_| Ok(Value::Float(f))))
            }
            ExprKind::Bool(b) => {
                let b = *b;
                Ok(thunk(move |_| Ok(Value::Bool(b))))
            }
            ExprKind::Null => Ok(thunk(|_| Ok(Value::Null))),
            ExprKind::Str(s) => {
                let s: Rc<str> = Rc::from(s.as_str());
                Ok(thunk(move |_| Ok(Value::Str(s.clone()))))
            }
            ExprKind::This => Ok(thunk(|vm| Ok(vm.this()))),

            // --- Identifiers ---
            ExprKind::Ident(name) => Ok(self.ident_access(name)),

            // --- Declarations ---
            ExprKind::Var { name, init } => {
                let init = match init {
                    Some(expr) => self.comp(expr)?,
                    None => thunk(|_| Ok(Value::Null)),
                };
                self.resolver.declare_local(name);
                Ok(thunk(move |vm| {
                    let v = init(vm)?;
                    vm.push_local(v.clone());
                    Ok(v)
                }))
            }

            // --- Blocks ---
            ExprKind::Block(elements) => {
                self.resolver.enter_block();
                let stmts: Result<Vec<Thunk>, MacroError> =
                    elements.iter().map(|el| self.comp(el)).collect();
                let stmts = stmts?;
                let declared = self.resolver.exit_block();
                Ok(thunk(move |vm| {
                    let base = vm.stack_depth();
                    let mut last = Value::Null;
                    for s in &stmts {
                        match s(vm) {
                            Ok(v) => last = v,
                            Err(c) => {
                                vm.truncate_stack(base);
                                return Err(c);
                            }
                        }
                    }
                    debug_assert_eq!(vm.stack_depth(), base + declared);
                    vm.truncate_stack(base);
                    Ok(last)
                }))
            }

            // --- Assignment ---
            ExprKind::Assign { left, op, right } => self.assignment(left, *op, right, pos),

            // --- Operators ---
            ExprKind::Binary { left, op, right } => {
                let op = *op;
                match op {
                    // Short-circuit: the right operand must not run unless needed
                    BinaryOp::And => {
                        let l = self.comp(left)?;
                        let r = self.comp(right)?;
                        Ok(thunk(move |vm| {
                            if !l(vm)?.is_truthy() {
                                return Ok(Value::Bool(false));
                            }
                            Ok(Value::Bool(r(vm)?.is_truthy()))
                        }))
                    }
                    BinaryOp::Or => {
                        let l = self.comp(left)?;
                        let r = self.comp(right)?;
                        Ok(thunk(move |vm| {
                            if l(vm)?.is_truthy() {
                                return Ok(Value::Bool(true));
                            }
                            Ok(Value::Bool(r(vm)?.is_truthy()))
                        }))
                    }
                    BinaryOp::NullCoal => {
                        let l = self.comp(left)?;
                        let r = self.comp(right)?;
                        Ok(thunk(move |vm| {
                            let left_val = l(vm)?;
                            if left_val.is_null() {
                                r(vm)
                            } else {
                                Ok(left_val)
                            }
                        }))
                    }
                    _ => {
                        let l = self.comp(left)?;
                        let r = self.comp(right)?;
                        Ok(thunk(move |vm| {
                            let a = l(vm)?;
                            let b = r(vm)?;
                            ops::binop(vm, op, &a, &b, pos)
                        }))
                    }
                }
            }

            ExprKind::Unary { op, postfix, expr } => {
                let op = *op;
                match op {
                    UnaryOp::Incr | UnaryOp::Decr => self.incr_decr(expr, op, *postfix, pos),
                    _ => {
                        let inner = self.comp(expr)?;
                        Ok(thunk(move |vm| {
                            let v = inner(vm)?;
                            ops::unop(vm, op, &v, pos)
                        }))
                    }
                }
            }

            // --- Branching ---
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.comp(cond)?;
                let t = self.comp_scoped(then_expr)?;
                let f = self.comp_scoped(else_expr)?;
                Ok(thunk(move |vm| {
                    if c(vm)?.is_truthy() {
                        t(vm)
                    } else {
                        f(vm)
                    }
                }))
            }

            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let c = self.comp(cond)?;
                let t = self.comp_scoped(then_branch)?;
                let f = else_branch
                    .as_ref()
                    .map(|el| self.comp_scoped(el))
                    .transpose()?;
                Ok(thunk(move |vm| {
                    if c(vm)?.is_truthy() {
                        t(vm)
                    } else if let Some(f) = &f {
                        f(vm)
                    } else {
                        Ok(Value::Null)
                    }
                }))
            }

            ExprKind::Switch {
                subject,
                cases,
                default,
            } => self.switch(subject, cases, default.as_deref(), pos),

            // --- Loops ---
            ExprKind::While { cond, body } => {
                let c = self.comp(cond)?;
                let b = self.comp_scoped(body)?;
                Ok(thunk(move |vm| {
                    loop {
                        if !c(vm)?.is_truthy() {
                            break;
                        }
                        match b(vm) {
                            Ok(_) => {}
                            Err(Control::Break) => break,
                            Err(Control::Continue) => continue,
                            Err(other) => return Err(other),
                        }
                    }
                    Ok(Value::Null)
                }))
            }

            ExprKind::DoWhile { body, cond } => {
                let c = self.comp(cond)?;
                let b = self.comp_scoped(body)?;
                Ok(thunk(move |vm| {
                    loop {
                        match b(vm) {
                            Ok(_) => {}
                            Err(Control::Break) => break,
                            Err(Control::Continue) => {}
                            Err(other) => return Err(other),
                        }
                        if !c(vm)?.is_truthy() {
                            break;
                        }
                    }
                    Ok(Value::Null)
                }))
            }

            ExprKind::For { var, iter, body } => {
                let iter_t = self.comp(iter)?;
                self.resolver.enter_block();
                self.resolver.declare_local(var);
                let body_t = self.comp_scoped(body)?;
                self.resolver.exit_block();
                Ok(thunk(move |vm| {
                    let iterable = iter_t(vm)?;
                    let items = ops::iter_values(vm, &iterable, pos)?;
                    // The loop variable is declared fresh per iteration, so
                    // closures created in the body capture distinct values
                    for item in items {
                        vm.push_local(item);
                        let r = body_t(vm);
                        vm.pop_local();
                        match r {
                            Ok(_) => {}
                            Err(Control::Break) => break,
                            Err(Control::Continue) => continue,
                            Err(other) => return Err(other),
                        }
                    }
                    Ok(Value::Null)
                }))
            }

            // --- Non-local exits ---
            ExprKind::Return(value) => {
                let v = value.as_ref().map(|expr| self.comp(expr)).transpose()?;
                Ok(thunk(move |vm| {
                    let result = match &v {
                        Some(v) => v(vm)?,
                        None => Value::Null,
                    };
                    Err(Control::Return(result))
                }))
            }
            ExprKind::Break => Ok(thunk(|_| Err(Control::Break))),
            ExprKind::Continue => Ok(thunk(|_| Err(Control::Continue))),

            ExprKind::Throw(inner) => {
                let inner = self.comp(inner)?;
                Ok(thunk(move |vm| {
                    let v = inner(vm)?;
                    Err(vm.raise_at(v, pos))
                }))
            }

            ExprKind::Try { body, catches } => self.try_catch(body, catches, pos),

            // --- Composite literals ---
            ExprKind::Array(elements) => {
                let items: Result<Vec<Thunk>, MacroError> =
                    elements.iter().map(|el| self.comp(el)).collect();
                let items = items?;
                Ok(thunk(move |vm| {
                    let mut values = Vec::with_capacity(items.len());
                    for item in &items {
                        values.push(item(vm)?);
                    }
                    Ok(Value::array(values))
                }))
            }

            ExprKind::Object(fields) => {
                let mut compiled = Vec::with_capacity(fields.len());
                for field in fields {
                    let fid = self.ctx.fields.intern(&field.name)?;
                    compiled.push((fid, self.comp(&field.expr)?));
                }
                Ok(thunk(move |vm| {
                    let mut object = super::object::Object::new();
                    for (fid, value) in &compiled {
                        object.set(*fid, value(vm)?);
                    }
                    Ok(Value::object(object))
                }))
            }

            ExprKind::StringInterp(parts) => {
                enum Part {
                    Lit(Rc<str>),
                    Expr(Thunk),
                }
                let mut compiled = Vec::with_capacity(parts.len());
                for part in parts {
                    compiled.push(match part {
                        StringPart::Literal(s) => Part::Lit(Rc::from(s.as_str())),
                        StringPart::Interp(expr) => Part::Expr(self.comp(expr)?),
                    });
                }
                Ok(thunk(move |vm| {
                    let mut out = String::new();
                    for part in &compiled {
                        match part {
                            Part::Lit(s) => out.push_str(s),
                            Part::Expr(t) => {
                                let v = t(vm)?;
                                out.push_str(&ops::to_string(vm, &v, pos)?);
                            }
                        }
                    }
                    Ok(Value::str(out))
                }))
            }

            // --- Access ---
            ExprKind::Field { expr: base, field } => {
                let base_t = self.comp(base)?;
                let fid = self.ctx.fields.intern(field)?;
                let name: Rc<str> = Rc::from(field.as_str());
                Ok(thunk(move |vm| {
                    let recv = base_t(vm)?;
                    ops::field_get(vm, &recv, fid, &name, pos)
                }))
            }

            ExprKind::Index { expr: base, index } => {
                let base_t = self.comp(base)?;
                let index_t = self.comp(index)?;
                Ok(thunk(move |vm| {
                    let recv = base_t(vm)?;
                    let idx = index_t(vm)?;
                    ops::index_get(vm, &recv, &idx, pos)
                }))
            }

            // --- Calls ---
            ExprKind::Call { expr: callee, args } => self.call(callee, args, pos),

            // --- Functions ---
            ExprKind::Function(fun) => self.closure(&fun.name, &fun.params, &fun.body, pos),
            ExprKind::Arrow { params, body } => {
                let params: Vec<Param> = params.iter().map(Param::required).collect();
                self.closure("", &params, body, pos)
            }

            ExprKind::Paren(inner) => self.comp(inner),
        }
    }

    /// Compile a control-construct branch in its own block scope, so a bare
    /// `var` in branch position cannot desynchronize the stack discipline
    fn comp_scoped(&mut self, e: &Expr) -> Result<Thunk, MacroError> {
        self.resolver.enter_block();
        let inner = self.comp(e)?;
        let declared = self.resolver.exit_block();
        if declared == 0 {
            return Ok(inner);
        }
        Ok(thunk(move |vm| {
            let base = vm.stack_depth();
            let r = inner(vm);
            vm.truncate_stack(base);
            r
        }))
    }

    /// Resolve an identifier read into its specialized accessor
    fn ident_access(&mut self, name: &str) -> Thunk {
        match self.resolver.resolve(name) {
            Some(ResolvedVar::Local(rel)) => thunk(move |vm| Ok(vm.local(rel))),
            Some(ResolvedVar::Env(i)) => thunk(move |vm| Ok(vm.env_value(i))),
            None => {
                let cell = self.ctx.global_cell(name);
                thunk(move |_| Ok(cell.borrow().clone()))
            }
        }
    }

    /// Resolve an assignable target
    fn lvalue(&mut self, e: &Expr) -> Result<LTarget, MacroError> {
        match &e.kind {
            ExprKind::Ident(name) => Ok(match self.resolver.resolve(name) {
                Some(ResolvedVar::Local(rel)) => LTarget::Local(rel),
                Some(ResolvedVar::Env(i)) => LTarget::Env(i),
                None => LTarget::Global(self.ctx.global_cell(name)),
            }),
            ExprKind::Field { expr: base, field } => Ok(LTarget::Field {
                obj: self.comp(base)?,
                fid: self.ctx.fields.intern(field)?,
                name: Rc::from(field.as_str()),
                pos: e.pos,
            }),
            ExprKind::Index { expr: base, index } => Ok(LTarget::Index {
                obj: self.comp(base)?,
                index: self.comp(index)?,
                pos: e.pos,
            }),
            ExprKind::Paren(inner) => self.lvalue(inner),
            _ => Err(MacroError::CompileError {
                message: "invalid assignment target".to_string(),
                pos: e.pos,
            }),
        }
    }

    fn assignment(
        &mut self,
        left: &Expr,
        op: AssignOp,
        right: &Expr,
        pos: Pos,
    ) -> Result<Thunk, MacroError> {
        let target = self.lvalue(left)?;
        let rhs = self.comp(right)?;
        let bop = op.binary_op();
        Ok(match target {
            LTarget::Local(rel) => thunk(move |vm| {
                let current = vm.local(rel);
                let v = combined(vm, &bop, current, &rhs, pos)?;
                vm.set_local(rel, v.clone());
                Ok(v)
            }),
            LTarget::Env(i) => thunk(move |vm| {
                let current = vm.env_value(i);
                let v = combined(vm, &bop, current, &rhs, pos)?;
                vm.set_env_value(i, v.clone());
                Ok(v)
            }),
            LTarget::Global(cell) => thunk(move |vm| {
                let current = cell.borrow().clone();
                let v = combined(vm, &bop, current, &rhs, pos)?;
                *cell.borrow_mut() = v.clone();
                Ok(v)
            }),
            LTarget::Field {
                obj,
                fid,
                name,
                pos: fpos,
            } => thunk(move |vm| {
                let recv = obj(vm)?;
                let v = match &bop {
                    Some(op) => {
                        let current = ops::field_get(vm, &recv, fid, &name, fpos)?;
                        let r = rhs(vm)?;
                        ops::binop(vm, *op, &current, &r, pos)?
                    }
                    None => rhs(vm)?,
                };
                ops::field_set(vm, &recv, fid, &name, v, fpos)
            }),
            LTarget::Index {
                obj,
                index,
                pos: ipos,
            } => thunk(move |vm| {
                let recv = obj(vm)?;
                let idx = index(vm)?;
                let v = match &bop {
                    Some(op) => {
                        let current = ops::index_get(vm, &recv, &idx, ipos)?;
                        let r = rhs(vm)?;
                        ops::binop(vm, *op, &current, &r, pos)?
                    }
                    None => rhs(vm)?,
                };
                ops::index_set(vm, &recv, &idx, v, ipos)
            }),
        })
    }

    fn incr_decr(
        &mut self,
        target: &Expr,
        op: UnaryOp,
        postfix: bool,
        pos: Pos,
    ) -> Result<Thunk, MacroError> {
        let delta = if op == UnaryOp::Incr { 1i64 } else { -1i64 };
        let target = self.lvalue(target)?;
        Ok(match target {
            LTarget::Local(rel) => thunk(move |vm| {
                let old = vm.local(rel);
                let new = step(vm, &old, delta)?;
                vm.set_local(rel, new.clone());
                Ok(if postfix { old } else { new })
            }),
            LTarget::Env(i) => thunk(move |vm| {
                let old = vm.env_value(i);
                let new = step(vm, &old, delta)?;
                vm.set_env_value(i, new.clone());
                Ok(if postfix { old } else { new })
            }),
            LTarget::Global(cell) => thunk(move |vm| {
                let old = cell.borrow().clone();
                let new = step(vm, &old, delta)?;
                *cell.borrow_mut() = new.clone();
                Ok(if postfix { old } else { new })
            }),
            LTarget::Field {
                obj,
                fid,
                name,
                pos: fpos,
            } => thunk(move |vm| {
                let recv = obj(vm)?;
                let old = ops::field_get(vm, &recv, fid, &name, fpos)?;
                let new = step(vm, &old, delta)?;
                ops::field_set(vm, &recv, fid, &name, new.clone(), fpos)?;
                Ok(if postfix { old } else { new })
            }),
            LTarget::Index {
                obj,
                index,
                pos: ipos,
            } => thunk(move |vm| {
                let recv = obj(vm)?;
                let idx = index(vm)?;
                let old = ops::index_get(vm, &recv, &idx, ipos)?;
                let new = step(vm, &old, delta)?;
                ops::index_set(vm, &recv, &idx, new.clone(), ipos)?;
                Ok(if postfix { old } else { new })
            }),
        })
    }

    fn switch(
        &mut self,
        subject: &Expr,
        cases: &[Case],
        default: Option<&Expr>,
        pos: Pos,
    ) -> Result<Thunk, MacroError> {
        let subject_t = self.comp(subject)?;
        let bodies: Result<Vec<Thunk>, MacroError> =
            cases.iter().map(|c| self.comp_scoped(&c.body)).collect();
        let bodies = bodies?;
        let default_t = default.map(|d| self.comp_scoped(d)).transpose()?;

        // Dense non-negative integer keys compile to a jump table
        if let Some(table) = jump_table(cases) {
            return Ok(thunk(move |vm| {
                let v = subject_t(vm)?;
                let slot = match v {
                    Value::Int(i) if i >= 0 && (i as usize) < table.len() => table[i as usize],
                    _ => None,
                };
                match slot {
                    Some(body_index) => bodies[body_index](vm),
                    None => match &default_t {
                        Some(d) => d(vm),
                        None => Ok(Value::Null),
                    },
                }
            }));
        }

        // General form: first structural match in source order wins
        let mut compiled_cases = Vec::with_capacity(cases.len());
        for (i, case) in cases.iter().enumerate() {
            let values: Result<Vec<Thunk>, MacroError> =
                case.values.iter().map(|v| self.comp(v)).collect();
            compiled_cases.push((values?, i));
        }
        Ok(thunk(move |vm| {
            vm.set_last_pos(pos);
            let subject_v = subject_t(vm)?;
            for (values, body_index) in &compiled_cases {
                for value_t in values {
                    let candidate = value_t(vm)?;
                    if ops::structural_eq(&subject_v, &candidate) {
                        return bodies[*body_index](vm);
                    }
                }
            }
            match &default_t {
                Some(d) => d(vm),
                None => Ok(Value::Null),
            }
        }))
    }

    fn try_catch(
        &mut self,
        body: &Expr,
        catches: &[syntax::Catch],
        _pos: Pos,
    ) -> Result<Thunk, MacroError> {
        let body_t = self.comp_scoped(body)?;
        let type_fid = self.ctx.fields.intern("__type")?;
        let mut clauses = Vec::with_capacity(catches.len());
        for c in catches {
            self.resolver.enter_block();
            self.resolver.declare_local(&c.var);
            let catch_body = self.comp(&c.body)?;
            self.resolver.exit_block();
            let hint: Option<Rc<str>> = c.type_hint.as_deref().map(Rc::from);
            clauses.push((hint, catch_body));
        }
        Ok(thunk(move |vm| {
            let base = vm.stack_depth();
            match body_t(vm) {
                Err(Control::Exc(exc)) => {
                    // Restore the depth recorded at try entry before any
                    // handler runs, however deep the throw originated
                    vm.truncate_stack(base);
                    for (hint, catch_body) in &clauses {
                        if catch_matches(hint.as_deref(), &exc.value, type_fid) {
                            vm.push_local(exc.value.clone());
                            let r = catch_body(vm);
                            vm.truncate_stack(base);
                            return r;
                        }
                    }
                    Err(Control::Exc(exc))
                }
                other => other,
            }
        }))
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], pos: Pos) -> Result<Thunk, MacroError> {
        let arg_thunks: Result<Vec<Thunk>, MacroError> =
            args.iter().map(|a| self.comp(a)).collect();
        let arg_thunks = arg_thunks?;

        match &callee.kind {
            // Builtins shadow script bindings of the same name
            ExprKind::Ident(name) if name == "trace" => Ok(thunk(move |vm| {
                let mut rendered = Vec::with_capacity(arg_thunks.len());
                for a in &arg_thunks {
                    let v = a(vm)?;
                    rendered.push(ops::to_string(vm, &v, pos)?.to_string());
                }
                let line = rendered.join(", ");
                log::debug!("trace: {}", line);
                vm.ctx.trace.push(line);
                Ok(Value::Null)
            })),

            ExprKind::Ident(name) if name == "loadPrimitive" => Ok(thunk(move |vm| {
                let mut argv: ArgVec = ArgVec::new();
                for a in &arg_thunks {
                    argv.push(a(vm)?);
                }
                vm.set_last_pos(pos);
                let (Some(Value::Str(key)), Some(Value::Int(arity))) =
                    (argv.first().cloned(), argv.get(1).cloned())
                else {
                    return Err(vm.raise_str("invalid call to loadPrimitive"));
                };
                match vm.ctx.natives.resolve(&key, arity) {
                    Some(native) => Ok(Value::Native(native)),
                    None => {
                        Err(vm.raise_str(format!("primitive not found: {}:{}", key, arity)))
                    }
                }
            })),

            // Method call: receiver.field(args)
            ExprKind::Field { expr: base, field } => {
                let base_t = self.comp(base)?;
                let fid = self.ctx.fields.intern(field)?;
                let name: Rc<str> = Rc::from(field.as_str());
                Ok(thunk(move |vm| {
                    let recv = base_t(vm)?;
                    let mut argv: ArgVec = ArgVec::new();
                    for a in &arg_thunks {
                        argv.push(a(vm)?);
                    }
                    if let Value::Object(obj) = &recv {
                        let f = obj.borrow().get(fid);
                        if let Some(f) = f {
                            if f.is_callable() {
                                return vm.call_value(&f, recv.clone(), &argv, pos);
                            }
                        }
                    }
                    ops::method_call(vm, &recv, &name, &argv, pos)
                }))
            }

            // Plain name: resolved accessor, with a registry fallback so
            // registered macros can call each other (and themselves)
            ExprKind::Ident(name) => {
                let access = self.ident_access(name);
                let name: Rc<str> = Rc::from(name.as_str());
                Ok(thunk(move |vm| {
                    let func = access(vm)?;
                    let mut argv: ArgVec = ArgVec::new();
                    for a in &arg_thunks {
                        argv.push(a(vm)?);
                    }
                    if func.is_callable() {
                        return vm.call_value(&func, Value::Null, &argv, pos);
                    }
                    if let Some(result) = super::eval::call_macro_by_name(vm, &name, &argv, pos) {
                        return result;
                    }
                    vm.set_last_pos(pos);
                    Err(vm.raise_str(format!("'{}' is not a function", name)))
                }))
            }

            // Anything else evaluates to a callable
            _ => {
                let callee_t = self.comp(callee)?;
                Ok(thunk(move |vm| {
                    let func = callee_t(vm)?;
                    let mut argv: ArgVec = ArgVec::new();
                    for a in &arg_thunks {
                        argv.push(a(vm)?);
                    }
                    vm.call_value(&func, Value::Null, &argv, pos)
                }))
            }
        }
    }

    fn closure(
        &mut self,
        name: &str,
        params: &[Param],
        body: &Expr,
        pos: Pos,
    ) -> Result<Thunk, MacroError> {
        let (proto, caps) = self.closure_proto(name, params, body, pos)?;
        Ok(thunk(move |vm| {
            // Capture by value at creation time: each closure instance gets
            // independent storage cells, not aliases into the live stack
            let mut env = Vec::with_capacity(caps.len());
            for cap in &caps {
                env.push(match cap {
                    CapAccess::Stack(rel) => vm.local(*rel),
                    CapAccess::Env(i) => vm.env_value(*i),
                });
            }
            Ok(Value::Closure(Rc::new(Closure {
                proto: proto.clone(),
                env: Rc::new(RefCell::new(env)),
            })))
        }))
    }

    /// Compile a function body once, yielding its shared prototype and the
    /// creation-site capture accessors
    fn closure_proto(
        &mut self,
        name: &str,
        params: &[Param],
        body: &Expr,
        pos: Pos,
    ) -> Result<(Rc<FnProto>, Vec<CapAccess>), MacroError> {
        let param_names: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
        self.resolver.enter_function(&param_names);

        let mut specs = Vec::with_capacity(params.len());
        for p in params {
            // Defaults run while the callee frame is still being set up, so
            // they are compiled in isolation: globals only, no locals
            let default = p
                .default_value
                .as_ref()
                .map(|d| self.comp_isolated(d))
                .transpose()?;
            specs.push(ParamSpec {
                name: p.name.clone(),
                optional: p.optional,
                rest: p.rest,
                default,
            });
        }

        let body_t = match self.comp(body) {
            Ok(t) => t,
            Err(e) => {
                self.resolver.exit_function();
                return Err(e);
            }
        };
        let captures = self.resolver.exit_function();

        let caps: Vec<CapAccess> = captures
            .iter()
            .map(|(_, source)| match source {
                CaptureSource::ParentLocal(abs) => CapAccess::Stack(self.resolver.relative_of(*abs)),
                CaptureSource::ParentEnv(i) => CapAccess::Env(*i),
            })
            .collect();

        let proto = Rc::new(FnProto {
            name: name.to_string(),
            params: specs,
            body: body_t,
            pos,
        });
        Ok((proto, caps))
    }

    /// Compile an expression against an empty scope: every free name is a
    /// global. Used for parameter defaults.
    fn comp_isolated(&mut self, e: &Expr) -> Result<Thunk, MacroError> {
        let mut sub = Compiler {
            ctx: &mut *self.ctx,
            resolver: Resolver::new(),
        };
        sub.comp(e)
    }
}

/// Apply the compound-assignment operator, or pass the right side through
fn combined(
    vm: &mut Vm,
    bop: &Option<BinaryOp>,
    current: Value,
    rhs: &Thunk,
    pos: Pos,
) -> EvalResult {
    let r = rhs(vm)?;
    match bop {
        Some(op) => ops::binop(vm, *op, &current, &r, pos),
        None => Ok(r),
    }
}

/// `++`/`--` arithmetic step
fn step(vm: &mut Vm, value: &Value, delta: i64) -> EvalResult {
    match value {
        Value::Int(i) => Ok(Value::Int(i + delta)),
        Value::Float(f) => Ok(Value::Float(f + delta as f64)),
        other => Err(vm.raise_str(format!("cannot increment a {}", other.type_name()))),
    }
}

/// Runtime catch-clause matching: by builtin type name, unconditionally for
/// `Dynamic`/untyped catches, or against an object's `__type` marker
fn catch_matches(hint: Option<&str>, value: &Value, type_fid: FieldId) -> bool {
    let Some(hint) = hint else { return true };
    match hint {
        "Dynamic" => true,
        "String" => matches!(value, Value::Str(_)),
        "Int" => matches!(value, Value::Int(_)),
        "Float" => matches!(value, Value::Int(_) | Value::Float(_)),
        "Bool" => matches!(value, Value::Bool(_)),
        "Array" => matches!(value, Value::Array(_)),
        other => match value {
            Value::Object(obj) => {
                let marker = obj.borrow().get(type_fid);
                matches!(marker, Some(Value::Str(s)) if &*s == other)
            }
            _ => false,
        },
    }
}

/// Build a jump table when every case key is a non-negative literal
/// integer within the table limit. Entry `i` holds the index of the
/// matching body.
fn jump_table(cases: &[Case]) -> Option<Vec<Option<usize>>> {
    let mut max = -1i64;
    for case in cases {
        for value in &case.values {
            match value.kind {
                ExprKind::Int(i) if (0..JUMP_TABLE_LIMIT).contains(&i) => max = max.max(i),
                _ => return None,
            }
        }
    }
    if max < 0 {
        return None;
    }
    let mut table: Vec<Option<usize>> = vec![None; (max + 1) as usize];
    for (body_index, case) in cases.iter().enumerate() {
        for value in &case.values {
            if let ExprKind::Int(i) = value.kind {
                let slot = &mut table[i as usize];
                // First match in source order wins
                if slot.is_none() {
                    *slot = Some(body_index);
                }
            }
        }
    }
    Some(table)
}
