//! Host-compiler interface for macro evaluation
//!
//! The evaluator never talks to the rest of the compiler directly: the
//! host registers hooks and flags here, macros reach them through the
//! `compiler@*` primitives, and diagnostics/generated declarations
//! accumulate here for the host to drain after each invocation.

use crate::tast::{Type, TypedDecl};
use diagnostics::Diagnostic;
use fxhash::FxHashMap;
use source_map::Pos;

/// Invoked once with all generated declarations before backend codegen
pub type GenerateHandler = Box<dyn FnMut(&[TypedDecl])>;

/// Replaces the default backend; receives an opaque generation-API value
pub type CodeGenerator = Box<dyn FnMut(super::value::Value)>;

/// Source-relative file lookup
pub type FileResolver = Box<dyn Fn(&str) -> Option<String>>;

/// Re-entrant typing of a script expression
pub type TypeOfHook = Box<dyn FnMut(&syntax::Expr) -> Result<Type, String>>;

/// Re-entrant parsing of a code string at a position
pub type ParseHook = Box<dyn FnMut(&str, Pos) -> Result<syntax::Expr, String>>;

/// Hooks, flags and diagnostic sinks shared with the host compiler
pub struct MacroContext {
    defines: FxHashMap<String, Option<String>>,
    diagnostics: Vec<Diagnostic>,
    defined_types: Vec<TypedDecl>,
    on_generate: Vec<GenerateHandler>,
    code_generator: Option<CodeGenerator>,
    resolve_file: Option<FileResolver>,
    type_of: Option<TypeOfHook>,
    parse_string: Option<ParseHook>,
    /// Position of the macro invocation currently being evaluated
    call_pos: Pos,
}

impl MacroContext {
    pub fn new() -> Self {
        Self {
            defines: FxHashMap::default(),
            diagnostics: Vec::new(),
            defined_types: Vec::new(),
            on_generate: Vec::new(),
            code_generator: None,
            resolve_file: None,
            type_of: None,
            parse_string: None,
            call_pos: Pos::unknown(),
        }
    }

    // --- Conditional-compilation flags ---

    pub fn define_flag(&mut self, name: &str) {
        self.define_flag_value(name, None);
    }

    pub fn define_flag_value(&mut self, name: &str, value: Option<String>) {
        if self.defines.insert(name.to_string(), value).is_some() {
            log::warn!("flag '{}' redefined", name);
        }
    }

    pub fn is_flag_defined(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    /// The flag's value, when it was defined with one
    pub fn defined_value(&self, name: &str) -> Option<&str> {
        self.defines.get(name).and_then(|v| v.as_deref())
    }

    // --- Diagnostics ---

    pub fn report_error(&mut self, message: impl Into<String>, pos: Pos) {
        self.diagnostics.push(Diagnostic::error(message, pos));
    }

    pub fn report_warning(&mut self, message: impl Into<String>, pos: Pos) {
        self.diagnostics.push(Diagnostic::warning(message, pos));
    }

    pub fn report_info(&mut self, message: impl Into<String>, pos: Pos) {
        self.diagnostics.push(Diagnostic::info(message, pos));
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Drain accumulated diagnostics
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    // --- Invocation position ---

    pub fn set_call_pos(&mut self, pos: Pos) {
        self.call_pos = pos;
    }

    pub fn call_pos(&self) -> Pos {
        self.call_pos
    }

    // --- Generated declarations ---

    /// Queue a declaration a macro defined; the host drains and typechecks
    pub fn add_defined_type(&mut self, decl: TypedDecl) {
        self.defined_types.push(decl);
    }

    pub fn take_defined_types(&mut self) -> Vec<TypedDecl> {
        std::mem::take(&mut self.defined_types)
    }

    // --- Host callbacks ---

    /// Register a handler invoked once with all generated declarations
    pub fn on_generate(&mut self, handler: GenerateHandler) {
        self.on_generate.push(handler);
    }

    /// Host side: fire every `on_generate` handler
    pub fn run_generate(&mut self, decls: &[TypedDecl]) {
        for handler in &mut self.on_generate {
            handler(decls);
        }
    }

    /// Install a custom code generator in place of the default backend
    pub fn set_code_generator(&mut self, generator: CodeGenerator) {
        if self.code_generator.is_some() {
            log::warn!("code generator replaced");
        }
        self.code_generator = Some(generator);
    }

    /// Host side: run the custom generator, if any. Returns whether the
    /// default backend should be skipped.
    pub fn run_code_generator(&mut self, api: super::value::Value) -> bool {
        match &mut self.code_generator {
            Some(generator) => {
                generator(api);
                true
            }
            None => false,
        }
    }

    pub fn set_file_resolver(&mut self, resolver: FileResolver) {
        self.resolve_file = Some(resolver);
    }

    /// Resolve a path relative to the source roots
    pub fn resolve_file(&self, path: &str) -> Option<String> {
        match &self.resolve_file {
            Some(resolver) => resolver(path),
            None => None,
        }
    }

    pub fn set_type_of(&mut self, hook: TypeOfHook) {
        self.type_of = Some(hook);
    }

    /// Type a script expression through the host type checker
    pub fn type_of(&mut self, expr: &syntax::Expr) -> Option<Result<Type, String>> {
        self.type_of.as_mut().map(|hook| hook(expr))
    }

    pub fn set_parse_string(&mut self, hook: ParseHook) {
        self.parse_string = Some(hook);
    }

    /// Parse a code string through the host parser
    pub fn parse_string(&mut self, text: &str, pos: Pos) -> Option<Result<syntax::Expr, String>> {
        self.parse_string.as_mut().map(|hook| hook(text, pos))
    }
}

impl Default for MacroContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut ctx = MacroContext::new();
        assert!(!ctx.is_flag_defined("debug"));
        ctx.define_flag("debug");
        assert!(ctx.is_flag_defined("debug"));
        assert_eq!(ctx.defined_value("debug"), None);

        ctx.define_flag_value("target", Some("js".to_string()));
        assert_eq!(ctx.defined_value("target"), Some("js"));
    }

    #[test]
    fn test_diagnostics_accumulate_and_drain() {
        let mut ctx = MacroContext::new();
        ctx.report_error("bad", Pos::unknown());
        ctx.report_warning("odd", Pos::unknown());
        assert_eq!(ctx.diagnostics().len(), 2);
        let drained = ctx.take_diagnostics();
        assert_eq!(drained.len(), 2);
        assert!(ctx.diagnostics().is_empty());
    }

    #[test]
    fn test_generate_handlers_fire_once_each() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut ctx = MacroContext::new();
        let count = Rc::new(RefCell::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        ctx.on_generate(Box::new(move |_| *c1.borrow_mut() += 1));
        ctx.on_generate(Box::new(move |_| *c2.borrow_mut() += 10));
        ctx.run_generate(&[]);
        assert_eq!(*count.borrow(), 11);
    }

    #[test]
    fn test_code_generator_replaces_backend() {
        let mut ctx = MacroContext::new();
        assert!(!ctx.run_code_generator(super::super::value::Value::Null));
        ctx.set_code_generator(Box::new(|_| {}));
        assert!(ctx.run_code_generator(super::super::value::Value::Null));
    }

    #[test]
    fn test_file_resolver() {
        let mut ctx = MacroContext::new();
        assert_eq!(ctx.resolve_file("data.json"), None);
        ctx.set_file_resolver(Box::new(|p| Some(format!("src/{}", p))));
        assert_eq!(ctx.resolve_file("data.json"), Some("src/data.json".to_string()));
    }
}
