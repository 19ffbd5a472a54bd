//! Evaluator runtime: value stack, call frames and the public interpreter
//!
//! Compiled thunks run against a [`Vm`]: a value stack for locals, the
//! current closure environment, the implicit receiver and a chain of call
//! frames used for stack traces and unwinding. All process-scoped state
//! (field-id table, global cells, native tables, registries, bridge
//! caches, host hooks) hangs off the [`EvalContext`] owned by the
//! interpreter instance, so independent evaluators never share anything.

use super::bridge::BridgeCache;
use super::compile;
use super::context::MacroContext;
use super::errors::{AbortReason, Control, MacroError};
use super::object::{FieldTable, Object};
use super::registry::{MacroRegistry, NativeRegistry, TypeRegistry};
use super::value::{Closure, FnProto, NativeFn, Value};
use crate::tast::{TConst, TypedDecl};
use diagnostics::StackFrame;
use fxhash::FxHashMap;
use source_map::{Pos, SourceMap};
use std::cell::RefCell;
use std::rc::Rc;

/// Result of evaluating one thunk
pub type EvalResult = Result<Value, Control>;

/// A compiled, reusable evaluation closure for one syntax node
pub type Thunk = Rc<dyn Fn(&mut Vm) -> EvalResult>;

/// Default maximum closure call depth
const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// One entry of the evaluator call stack
pub struct CallFrame {
    /// Callee name for stack traces
    pub callee: String,
    /// Call-site position
    pub pos: Pos,
    /// Value-stack depth at frame entry; unwinding truncates back to it
    pub stack_base: usize,
    saved_env: Rc<RefCell<Vec<Value>>>,
    saved_this: Value,
}

/// Process-scoped evaluator state, owned by one interpreter instance
pub struct EvalContext {
    /// Global field-id table with collision detection
    pub fields: FieldTable,
    /// Global mutable cells, created on first reference
    pub globals: FxHashMap<String, Rc<RefCell<Value>>>,
    /// Native primitive tables
    pub natives: NativeRegistry,
    /// Scripted macro definitions
    pub macros: MacroRegistry,
    /// Typed declarations registered by the host
    pub types: TypeRegistry,
    /// Identity caches of the typed-world bridge
    pub bridge: BridgeCache,
    /// Host-compiler hooks, flags and diagnostics
    pub host: MacroContext,
    /// Registered source files for position rendering
    pub sources: SourceMap,
    /// Accumulated `trace` output
    pub trace: Vec<String>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self {
            fields: FieldTable::new(),
            globals: FxHashMap::default(),
            natives: NativeRegistry::with_standard_libraries(),
            macros: MacroRegistry::new(),
            types: TypeRegistry::new(),
            bridge: BridgeCache::new(),
            host: MacroContext::new(),
            sources: SourceMap::new(),
            trace: Vec::new(),
        }
    }

    /// The global cell for `name`, created on first reference
    pub fn global_cell(&mut self, name: &str) -> Rc<RefCell<Value>> {
        self.globals
            .entry(name.to_string())
            .or_insert_with(|| Rc::new(RefCell::new(Value::Null)))
            .clone()
    }

    /// Set a global by name (creating the cell when needed)
    pub fn set_global(&mut self, name: &str, value: Value) {
        *self.global_cell(name).borrow_mut() = value;
    }
}

impl Default for EvalContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The evaluator runtime state thunks execute against
pub struct Vm {
    /// Local value stack; slot addressing is relative to its length
    pub(crate) stack: Vec<Value>,
    /// Environment of the currently executing closure
    pub(crate) env: Rc<RefCell<Vec<Value>>>,
    /// Implicit receiver
    pub(crate) this_val: Value,
    /// Call frames, outermost first
    pub(crate) frames: Vec<CallFrame>,
    call_depth: usize,
    max_call_depth: usize,
    /// Position of the most recent call/field/operator site, used when a
    /// primitive raises without a position of its own
    pub(crate) last_pos: Pos,
    pub ctx: EvalContext,
}

impl Vm {
    pub fn new(ctx: EvalContext) -> Self {
        Self {
            stack: Vec::new(),
            env: Rc::new(RefCell::new(Vec::new())),
            this_val: Value::Null,
            frames: Vec::new(),
            call_depth: 0,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            last_pos: Pos::unknown(),
            ctx,
        }
    }

    /// Current stack depth (used by tests asserting the unwind invariant)
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn set_max_call_depth(&mut self, max: usize) {
        self.max_call_depth = max;
    }

    // --- Accessor primitives used by compiled thunks ---

    pub(crate) fn truncate_stack(&mut self, depth: usize) {
        self.stack.truncate(depth);
    }

    pub(crate) fn push_local(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop_local(&mut self) {
        self.stack.pop();
    }

    /// Read the local `rel` slots down from the stack top
    pub(crate) fn local(&self, rel: usize) -> Value {
        self.stack[self.stack.len() - rel].clone()
    }

    pub(crate) fn set_local(&mut self, rel: usize, value: Value) {
        let i = self.stack.len() - rel;
        self.stack[i] = value;
    }

    pub(crate) fn env_value(&self, i: usize) -> Value {
        self.env.borrow()[i].clone()
    }

    pub(crate) fn set_env_value(&mut self, i: usize, value: Value) {
        self.env.borrow_mut()[i] = value;
    }

    pub(crate) fn this(&self) -> Value {
        self.this_val.clone()
    }

    pub(crate) fn set_last_pos(&mut self, pos: Pos) {
        self.last_pos = pos;
    }

    /// Snapshot the call-frame chain, innermost frame first
    pub fn snapshot_stack(&self) -> Vec<StackFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| StackFrame::new(f.callee.clone(), f.pos))
            .collect()
    }

    /// Raise a value as a catchable exception at an explicit position
    pub fn raise_at(&mut self, value: Value, pos: Pos) -> Control {
        Control::Exc(super::errors::Exception {
            value,
            pos,
            stack: self.snapshot_stack(),
        })
    }

    /// Raise a string exception at the most recent dispatch position
    pub fn raise_str(&mut self, message: impl Into<String>) -> Control {
        let pos = self.last_pos;
        self.raise_at(Value::str(message.into()), pos)
    }

    /// Raise the non-catchable abort signal
    pub fn abort(&mut self, message: impl Into<String>) -> Control {
        let pos = self.last_pos;
        Control::Abort(AbortReason::Fatal {
            message: message.into(),
            pos,
        })
    }

    /// Call any callable value with an explicit receiver
    pub fn call_value(&mut self, func: &Value, this: Value, args: &[Value], pos: Pos) -> EvalResult {
        match func {
            Value::Closure(closure) => {
                let closure = closure.clone();
                self.call_closure(&closure, this, args, pos)
            }
            Value::Native(native) => {
                let native = native.clone();
                self.call_native(&native, args, pos)
            }
            other => {
                self.last_pos = pos;
                Err(self.raise_str(format!("cannot call a {} value", other.type_name())))
            }
        }
    }

    /// Call a script closure: push a frame, swap environment and receiver,
    /// bind parameters as the first locals, run the body, unwind.
    pub fn call_closure(
        &mut self,
        closure: &Closure,
        this: Value,
        args: &[Value],
        pos: Pos,
    ) -> EvalResult {
        if self.call_depth >= self.max_call_depth {
            self.last_pos = pos;
            return Err(self.raise_str(format!(
                "call depth exceeded the limit of {}",
                self.max_call_depth
            )));
        }

        let proto = closure.proto.clone();
        self.frames.push(CallFrame {
            callee: proto.trace_name().to_string(),
            pos,
            stack_base: self.stack.len(),
            saved_env: std::mem::replace(&mut self.env, closure.env.clone()),
            saved_this: std::mem::replace(&mut self.this_val, this),
        });
        self.call_depth += 1;

        let result = self.bind_and_run(&proto, args);

        self.call_depth -= 1;
        if let Some(frame) = self.frames.pop() {
            // Unwind to the exact depth recorded at entry, on every path
            self.stack.truncate(frame.stack_base);
            self.env = frame.saved_env;
            self.this_val = frame.saved_this;
        }

        match result {
            Err(Control::Return(v)) => Ok(v),
            Err(Control::Break) | Err(Control::Continue) => {
                self.last_pos = pos;
                Err(self.raise_str("break/continue outside of a loop"))
            }
            other => other,
        }
    }

    fn bind_and_run(&mut self, proto: &FnProto, args: &[Value]) -> EvalResult {
        for (i, spec) in proto.params.iter().enumerate() {
            let value = if spec.rest {
                Value::array(args.get(i..).map(<[Value]>::to_vec).unwrap_or_default())
            } else if let Some(arg) = args.get(i) {
                arg.clone()
            } else if let Some(default) = &spec.default {
                default(self)?
            } else {
                Value::Null
            };
            self.stack.push(value);
        }
        (proto.body)(self)
    }

    /// Call a native primitive, checking its declared arity first
    pub fn call_native(&mut self, native: &NativeFn, args: &[Value], pos: Pos) -> EvalResult {
        self.last_pos = pos;
        if !native.arity.accepts(args.len()) {
            return Err(self.raise_str(format!(
                "invalid call to {}: got {} arguments",
                native.name,
                args.len()
            )));
        }
        log::trace!("native dispatch: {} ({} args)", native.name, args.len());
        native.invoke(self, args)
    }
}

/// The macro interpreter: compiles macro scripts once into thunks and
/// evaluates them against an owned context.
pub struct MacroInterpreter {
    vm: Vm,
}

impl MacroInterpreter {
    pub fn new() -> Self {
        Self {
            vm: Vm::new(EvalContext::new()),
        }
    }

    pub fn context(&self) -> &EvalContext {
        &self.vm.ctx
    }

    pub fn context_mut(&mut self) -> &mut EvalContext {
        &mut self.vm.ctx
    }

    /// Host-compiler hooks and flags
    pub fn host_mut(&mut self) -> &mut MacroContext {
        &mut self.vm.ctx.host
    }

    pub fn set_max_call_depth(&mut self, max: usize) {
        self.vm.set_max_call_depth(max);
    }

    /// Take accumulated `trace` output, draining the internal buffer
    pub fn take_trace_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.vm.ctx.trace)
    }

    /// Evaluate a macro script expression to a value
    pub fn evaluate(&mut self, expr: &syntax::Expr) -> Result<Value, MacroError> {
        let thunk = compile::compile_program(&mut self.vm.ctx, expr)?;
        let result = thunk(&mut self.vm);
        self.boundary(result, expr.pos)
    }

    /// Invoke a registered macro method by path, e.g.
    /// `invoke("tools.Build", "fields", args, pos)`.
    ///
    /// An unregistered path or method yields a `NotFound` error value,
    /// never a host-level panic.
    pub fn invoke(
        &mut self,
        path: &str,
        method: &str,
        args: &[Value],
        pos: Pos,
    ) -> Result<Value, MacroError> {
        let Some(def) = self.vm.ctx.macros.lookup(path, method) else {
            log::debug!("invoke miss: {}.{}", path, method);
            return Err(MacroError::NotFound {
                path: path.to_string(),
                method: method.to_string(),
                pos,
            });
        };

        self.vm.ctx.macros.enter_expansion(&def.qualified, pos)?;

        let compiled = def.compiled.borrow().clone();
        let proto = match compiled {
            Some(proto) => proto,
            None => {
                log::debug!("compiling macro {}", def.qualified);
                match compile::compile_function(&mut self.vm.ctx, &def.fun, def.pos) {
                    Ok(proto) => {
                        *def.compiled.borrow_mut() = Some(proto.clone());
                        proto
                    }
                    Err(err) => {
                        self.vm.ctx.macros.exit_expansion(&def.qualified);
                        return Err(err);
                    }
                }
            }
        };

        let closure = Closure {
            proto,
            env: Rc::new(RefCell::new(Vec::new())),
        };
        self.vm.ctx.host.set_call_pos(pos);
        let result = self.vm.call_closure(&closure, Value::Null, args, pos);
        self.vm.ctx.macros.exit_expansion(&def.qualified);
        self.boundary(result, pos)
    }

    /// Register a parsed macro script module: its macro methods become
    /// invokable and each class surfaces as a global object carrying its
    /// compiled static methods and evaluated static values.
    pub fn register_module(&mut self, module: &syntax::Module) -> Result<(), MacroError> {
        log::info!("registering macro module {}", module.path);
        self.vm.ctx.macros.register_module(module)?;

        for decl in &module.decls {
            let syntax::Decl::Class(class) = decl;
            let mut object = Object::new();
            for field in &class.fields {
                if !field.is_static() {
                    continue;
                }
                let fid = self.vm.ctx.fields.intern(&field.name)?;
                match &field.kind {
                    syntax::ClassFieldKind::Method(fun) => {
                        let proto = compile::compile_function(&mut self.vm.ctx, fun, field.pos)?;
                        object.set(
                            fid,
                            Value::Closure(Rc::new(Closure {
                                proto,
                                env: Rc::new(RefCell::new(Vec::new())),
                            })),
                        );
                    }
                    syntax::ClassFieldKind::Var(init) => {
                        let value = match init {
                            Some(expr) => self.evaluate(expr)?,
                            None => Value::Null,
                        };
                        object.set(fid, value);
                    }
                }
            }
            self.vm.ctx.set_global(&class.name, Value::object(object));
        }
        Ok(())
    }

    /// Register typed declarations into the global namespace. Idempotent
    /// per declaration identity: already-registered declarations are
    /// skipped.
    pub fn add_types(&mut self, decls: &[TypedDecl]) -> Result<(), MacroError> {
        for decl in decls {
            if !self.vm.ctx.types.add(decl.clone()) {
                continue;
            }
            log::info!("registering type {}", decl.path());
            match decl {
                TypedDecl::Enum(enum_ref) => {
                    let value = super::bridge::enum_namespace(&mut self.vm.ctx, enum_ref)?;
                    let name = enum_ref.borrow().name.clone();
                    self.vm.ctx.set_global(&name, value);
                }
                TypedDecl::Class(class_ref) => {
                    let value = class_namespace(&mut self.vm.ctx, class_ref)?;
                    let name = class_ref.borrow().name.clone();
                    self.vm.ctx.set_global(&name, value);
                }
            }
        }
        Ok(())
    }

    // --- Typed-world bridge surface ---

    /// Encode a typed expression as a Value for macro consumption
    pub fn encode_expr(&mut self, expr: &crate::tast::TExpr) -> Result<Value, MacroError> {
        super::bridge::encode_texpr(&mut self.vm.ctx, expr)
    }

    /// Decode a Value back into a typed expression
    pub fn decode_expr(&mut self, value: &Value) -> Result<crate::tast::TExpr, MacroError> {
        super::bridge::decode_texpr(&mut self.vm.ctx, value)
    }

    /// Encode a type as a Value
    pub fn encode_type(&mut self, ty: &crate::tast::Type) -> Result<Value, MacroError> {
        super::bridge::encode_type(&mut self.vm.ctx, ty)
    }

    /// Decode a Value back into a type
    pub fn decode_type(&mut self, value: &Value) -> Result<crate::tast::Type, MacroError> {
        super::bridge::decode_type(&mut self.vm.ctx, value)
    }

    /// Convert a terminal evaluation signal into a boundary error,
    /// guaranteeing the evaluator is back to a consistent state.
    fn boundary(&mut self, result: EvalResult, pos: Pos) -> Result<Value, MacroError> {
        debug_assert!(self.vm.frames.is_empty(), "call frames must unwind fully");
        match result {
            Ok(v) => Ok(v),
            Err(Control::Exc(exc)) => Err(MacroError::UncaughtException {
                rendered: exc.value.display(),
                pos: if exc.pos.is_unknown() { pos } else { exc.pos },
                stack: exc.stack,
            }),
            Err(Control::Abort(AbortReason::Fatal { message, pos })) => {
                Err(MacroError::Aborted { message, pos })
            }
            Err(Control::Abort(AbortReason::FieldIdCollision {
                id,
                existing,
                incoming,
            })) => Err(MacroError::FieldIdCollision {
                id,
                existing,
                incoming,
            }),
            Err(Control::Return(_)) | Err(Control::Break) | Err(Control::Continue) => {
                Err(MacroError::CompileError {
                    message: "misplaced control-flow statement".to_string(),
                    pos,
                })
            }
        }
    }
}

impl Default for MacroInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Call a registered macro by simple name, compiling its body on first
/// use. Lets registered macros call each other (and themselves) from
/// script code; depth is bounded by the closure call limit.
pub(crate) fn call_macro_by_name(
    vm: &mut Vm,
    name: &str,
    args: &[Value],
    pos: Pos,
) -> Option<EvalResult> {
    let def = vm.ctx.macros.find_by_name(name)?;
    let compiled = def.compiled.borrow().clone();
    let proto = match compiled {
        Some(proto) => proto,
        None => match compile::compile_function(&mut vm.ctx, &def.fun, def.pos) {
            Ok(proto) => {
                *def.compiled.borrow_mut() = Some(proto.clone());
                proto
            }
            Err(err) => {
                vm.set_last_pos(pos);
                return Some(Err(vm.raise_str(err.to_string())));
            }
        },
    };
    let closure = Closure {
        proto,
        env: Rc::new(RefCell::new(Vec::new())),
    };
    Some(vm.call_closure(&closure, Value::Null, args, pos))
}

/// Build the global namespace object for a typed class: its path plus the
/// constant static fields macros may read. Method bodies belong to the
/// backends, not the evaluator.
fn class_namespace(
    ctx: &mut EvalContext,
    class_ref: &crate::tast::ClassRef,
) -> Result<Value, MacroError> {
    let mut object = Object::new();
    let name_id = ctx.fields.intern("__name")?;
    object.set(name_id, Value::str(class_ref.path()));
    let class = class_ref.borrow();
    for field in &class.statics {
        if let Some(constant) = &field.constant {
            let fid = ctx.fields.intern(&field.name)?;
            object.set(fid, const_to_value(constant));
        }
    }
    Ok(Value::object(object))
}

pub(crate) fn const_to_value(constant: &TConst) -> Value {
    match constant {
        TConst::Int(i) => Value::Int(*i),
        TConst::Float(f) => Value::Float(*f),
        TConst::Str(s) => Value::str(s),
        TConst::Bool(b) => Value::Bool(*b),
        TConst::Null => Value::Null,
        TConst::This => Value::Null,
    }
}
