//! Registries: native primitives, scripted macros and typed declarations
//!
//! Native primitives are registered under `library@name` keys with a
//! declared arity; loading resolves by (key, arity) and returns `None` for
//! anything unknown, which the evaluator surfaces as a catchable
//! "primitive not found" exception, so a macro can probe for optional
//! capabilities with `try/catch`.

use super::errors::MacroError;
use super::value::{Arity, NativeCall, NativeFn, Value};
use crate::tast::TypedDecl;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use source_map::Pos;
use std::cell::RefCell;
use std::rc::Rc;

/// Default maximum macro expansion depth
const DEFAULT_MAX_EXPANSION_DEPTH: usize = 256;

/// Tables of native primitives, keyed `library@name`
pub struct NativeRegistry {
    prims: IndexMap<String, Vec<Rc<NativeFn>>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            prims: IndexMap::new(),
        }
    }

    /// A registry with every standard library loaded
    pub fn with_standard_libraries() -> Self {
        let mut reg = Self::new();
        super::natives::register_all(&mut reg);
        reg
    }

    /// Register a primitive under `library@name`
    pub fn register(&mut self, name: &str, arity: Arity, call: NativeCall) {
        let native = Rc::new(NativeFn {
            name: name.to_string(),
            arity,
            call,
        });
        self.prims.entry(name.to_string()).or_default().push(native);
    }

    /// Register a plain function primitive with fixed arity
    pub fn register_fn(
        &mut self,
        name: &str,
        arity: u8,
        f: fn(&mut super::eval::Vm, &[Value]) -> super::eval::EvalResult,
    ) {
        self.register(name, Arity::Exact(arity), NativeCall::Static(f));
    }

    /// Register a plain variadic function primitive
    pub fn register_var(
        &mut self,
        name: &str,
        f: fn(&mut super::eval::Vm, &[Value]) -> super::eval::EvalResult,
    ) {
        self.register(name, Arity::Variadic, NativeCall::Static(f));
    }

    /// Resolve a primitive by key and declared arity. A negative arity
    /// requests the variadic form. Returns `None` when no exact match is
    /// registered.
    pub fn resolve(&self, name: &str, arity: i64) -> Option<Rc<NativeFn>> {
        let candidates = self.prims.get(name)?;
        candidates
            .iter()
            .find(|n| match n.arity {
                Arity::Exact(a) => arity >= 0 && a as i64 == arity,
                Arity::Variadic => arity < 0,
            })
            .cloned()
    }

    /// Resolve for a call with `nargs` arguments: prefer the exact-arity
    /// form, fall back to the variadic one.
    pub fn resolve_for_call(&self, name: &str, nargs: usize) -> Option<Rc<NativeFn>> {
        self.resolve(name, nargs as i64)
            .or_else(|| self.resolve(name, -1))
    }

    pub fn len(&self) -> usize {
        self.prims.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.prims.is_empty()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered scripted macro function
pub struct MacroDefinition {
    /// Simple method name
    pub name: String,
    /// Fully qualified `pack.Class.method`
    pub qualified: String,
    pub fun: syntax::FunctionExpr,
    pub pos: Pos,
    /// Compiled body, cached after the first invocation
    pub compiled: RefCell<Option<Rc<super::value::FnProto>>>,
}

/// Registry of scripted macro definitions plus expansion guards
pub struct MacroRegistry {
    defs: FxHashMap<String, Rc<MacroDefinition>>,
    /// Macros currently being expanded, outermost first
    expanding: Vec<String>,
    max_depth: usize,
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self {
            defs: FxHashMap::default(),
            expanding: Vec::new(),
            max_depth: DEFAULT_MAX_EXPANSION_DEPTH,
        }
    }

    pub fn set_max_depth(&mut self, max_depth: usize) {
        self.max_depth = max_depth;
    }

    /// Scan a module's classes and register every static macro method
    pub fn register_module(&mut self, module: &syntax::Module) -> Result<(), MacroError> {
        for decl in &module.decls {
            let syntax::Decl::Class(class) = decl;
            let class_path = if module.path.is_empty() {
                class.name.clone()
            } else {
                // Module paths name the package; the class completes them
                match module.path.rsplit_once('.') {
                    Some((_, last)) if last == class.name => module.path.clone(),
                    _ => format!("{}.{}", module.path, class.name),
                }
            };
            for field in &class.fields {
                if !field.is_macro() || !field.is_static() {
                    continue;
                }
                let syntax::ClassFieldKind::Method(fun) = &field.kind else {
                    return Err(MacroError::CompileError {
                        message: format!("macro field '{}' must be a method", field.name),
                        pos: field.pos,
                    });
                };
                let qualified = format!("{}.{}", class_path, field.name);
                log::debug!("registered macro {}", qualified);
                self.defs.insert(
                    qualified.clone(),
                    Rc::new(MacroDefinition {
                        name: field.name.clone(),
                        qualified,
                        fun: fun.clone(),
                        pos: field.pos,
                        compiled: RefCell::new(None),
                    }),
                );
            }
        }
        Ok(())
    }

    /// Look up a macro by class path and method name
    pub fn lookup(&self, path: &str, method: &str) -> Option<Rc<MacroDefinition>> {
        self.defs.get(&format!("{}.{}", path, method)).cloned()
    }

    /// Look up by simple method name, preferring an exact qualified match
    pub fn find_by_name(&self, name: &str) -> Option<Rc<MacroDefinition>> {
        if let Some(def) = self.defs.get(name) {
            return Some(def.clone());
        }
        self.defs.values().find(|d| d.name == name).cloned()
    }

    pub fn is_registered(&self, qualified: &str) -> bool {
        self.defs.contains_key(qualified)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Enter a macro expansion, enforcing the depth limit and rejecting
    /// re-entry into a macro already being expanded
    pub fn enter_expansion(&mut self, qualified: &str, pos: Pos) -> Result<(), MacroError> {
        if self.expanding.len() >= self.max_depth {
            return Err(MacroError::RecursionLimit {
                depth: self.expanding.len() + 1,
                max: self.max_depth,
                pos,
            });
        }
        if self.expanding.iter().any(|n| n == qualified) {
            let mut chain = self.expanding.clone();
            chain.push(qualified.to_string());
            return Err(MacroError::CircularExpansion { chain, pos });
        }
        self.expanding.push(qualified.to_string());
        Ok(())
    }

    pub fn exit_expansion(&mut self, qualified: &str) {
        if let Some(i) = self.expanding.iter().rposition(|n| n == qualified) {
            self.expanding.remove(i);
        }
    }

    pub fn expansion_depth(&self) -> usize {
        self.expanding.len()
    }
}

impl Default for MacroRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed declarations the host registered, in registration order
pub struct TypeRegistry {
    decls: IndexMap<String, TypedDecl>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            decls: IndexMap::new(),
        }
    }

    /// Add a declaration; returns false when the same declaration identity
    /// is already registered under its path
    pub fn add(&mut self, decl: TypedDecl) -> bool {
        let path = decl.path();
        match self.decls.get(&path) {
            Some(existing) if existing.same_decl(&decl) => false,
            _ => {
                self.decls.insert(path, decl);
                true
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<&TypedDecl> {
        self.decls.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TypedDecl)> {
        self.decls.iter()
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_depth_tracking() {
        let mut reg = MacroRegistry::new();
        reg.set_max_depth(3);
        let p = Pos::unknown();

        assert!(reg.enter_expansion("a", p).is_ok());
        assert!(reg.enter_expansion("b", p).is_ok());
        assert!(reg.enter_expansion("c", p).is_ok());
        assert_eq!(reg.expansion_depth(), 3);
        assert!(matches!(
            reg.enter_expansion("d", p),
            Err(MacroError::RecursionLimit { .. })
        ));

        reg.exit_expansion("c");
        reg.exit_expansion("b");
        reg.exit_expansion("a");
        assert_eq!(reg.expansion_depth(), 0);
    }

    #[test]
    fn test_circular_expansion_reports_chain() {
        let mut reg = MacroRegistry::new();
        let p = Pos::unknown();
        reg.enter_expansion("tools.A.run", p).unwrap();
        reg.enter_expansion("tools.B.run", p).unwrap();
        let err = reg.enter_expansion("tools.A.run", p).unwrap_err();
        match err {
            MacroError::CircularExpansion { chain, .. } => {
                assert_eq!(chain, vec!["tools.A.run", "tools.B.run", "tools.A.run"]);
            }
            other => panic!("expected CircularExpansion, got {:?}", other),
        }
    }

    #[test]
    fn test_native_resolution_by_arity() {
        let mut reg = NativeRegistry::new();
        fn zero(_vm: &mut super::super::eval::Vm, _args: &[Value]) -> super::super::eval::EvalResult {
            Ok(Value::Int(0))
        }
        reg.register_fn("test@n", 2, zero);
        reg.register_var("test@v", zero);

        assert!(reg.resolve("test@n", 2).is_some());
        assert!(reg.resolve("test@n", 3).is_none());
        assert!(reg.resolve("test@n", -1).is_none());
        assert!(reg.resolve("test@v", -1).is_some());
        assert!(reg.resolve("missing@x", 0).is_none());

        assert!(reg.resolve_for_call("test@v", 7).is_some());
    }

    #[test]
    fn test_type_registry_idempotent_by_identity() {
        use crate::tast::{ClassDef, ClassRef};
        let mk = |name: &str| {
            ClassRef::new(ClassDef {
                pack: Vec::new(),
                name: name.to_string(),
                params: Vec::new(),
                superclass: None,
                is_interface: false,
                fields: Vec::new(),
                statics: Vec::new(),
                pos: Pos::unknown(),
            })
        };
        let mut reg = TypeRegistry::new();
        let a = mk("Widget");
        assert!(reg.add(TypedDecl::Class(a.clone())));
        // Same identity: skipped
        assert!(!reg.add(TypedDecl::Class(a.clone())));
        // Different identity under the same path: re-registered
        let b = mk("Widget");
        assert!(reg.add(TypedDecl::Class(b)));
        assert_eq!(reg.len(), 1);
    }
}
