//! Compile-time resolution of identifier references
//!
//! Every identifier occurrence is resolved exactly once, while the
//! enclosing function body is compiled, to one of: the implicit receiver,
//! a local slot, a closure-captured environment slot, or a global cell.
//! The outcome is baked into the generated accessor thunk; there is no
//! per-call re-resolution.
//!
//! Local slots are addressed relative to the top of the value stack:
//! slot `r` means "the r-th most recently pushed still-live local". The
//! resolver tracks, per compilation point, how many locals are live, so a
//! declaration's absolute index converts to the correct relative offset at
//! each access site. Blocks record how many locals they introduce so the
//! runtime can pop them symmetrically on exit.

use fxhash::FxHashMap;

/// Where an identifier occurrence resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolvedVar {
    /// Relative stack offset (≥ 1) at the access site
    Local(usize),
    /// Index into the enclosing closure's environment array
    Env(usize),
}

/// How a captured variable is fetched from the creating scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureSource {
    /// Absolute local slot in the creating function
    ParentLocal(usize),
    /// Environment slot of the creating closure (transitive capture)
    ParentEnv(usize),
}

/// Compile-time state of one function body
struct FunctionScope {
    /// name → absolute declaration slot within this frame
    locals: FxHashMap<String, usize>,
    /// number of locals live at the current compilation point
    locals_count: usize,
    /// captured variables in environment order
    captures: Vec<(String, CaptureSource)>,
    capture_index: FxHashMap<String, usize>,
    /// open blocks: (locals_count at entry, shadowed bindings to restore)
    blocks: Vec<BlockMark>,
}

struct BlockMark {
    count_at_entry: usize,
    saved: Vec<(String, Option<usize>)>,
}

impl FunctionScope {
    fn new() -> Self {
        Self {
            locals: FxHashMap::default(),
            locals_count: 0,
            captures: Vec::new(),
            capture_index: FxHashMap::default(),
            blocks: vec![BlockMark {
                count_at_entry: 0,
                saved: Vec::new(),
            }],
        }
    }
}

/// Scope resolver driving one compilation
pub(crate) struct Resolver {
    scopes: Vec<FunctionScope>,
}

impl Resolver {
    /// A resolver with the implicit top-level function frame
    pub fn new() -> Self {
        Self {
            scopes: vec![FunctionScope::new()],
        }
    }

    // The scope stack always holds at least the top-level frame.
    fn current(&self) -> &FunctionScope {
        &self.scopes[self.scopes.len() - 1]
    }

    fn current_mut(&mut self) -> &mut FunctionScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Enter a nested function body, declaring its parameters in order
    pub fn enter_function(&mut self, params: &[String]) {
        let mut scope = FunctionScope::new();
        for name in params {
            let slot = scope.locals_count;
            scope.locals.insert(name.clone(), slot);
            scope.locals_count += 1;
        }
        self.scopes.push(scope);
    }

    /// Leave a function body, yielding its capture list in environment order
    pub fn exit_function(&mut self) -> Vec<(String, CaptureSource)> {
        debug_assert!(self.scopes.len() > 1, "cannot exit the top-level frame");
        self.scopes.pop().map(|s| s.captures).unwrap_or_default()
    }

    /// Declare a local in the innermost block; returns its absolute slot
    pub fn declare_local(&mut self, name: &str) -> usize {
        let scope = self.current_mut();
        let slot = scope.locals_count;
        let previous = scope.locals.insert(name.to_string(), slot);
        scope.locals_count += 1;
        if let Some(block) = scope.blocks.last_mut() {
            block.saved.push((name.to_string(), previous));
        }
        slot
    }

    /// Open a block scope
    pub fn enter_block(&mut self) {
        let count = self.current().locals_count;
        self.current_mut().blocks.push(BlockMark {
            count_at_entry: count,
            saved: Vec::new(),
        });
    }

    /// Close a block scope, restoring shadowed bindings; returns how many
    /// locals the block declared (the runtime pops exactly that many)
    pub fn exit_block(&mut self) -> usize {
        let scope = self.current_mut();
        let Some(block) = scope.blocks.pop() else {
            return 0;
        };
        let declared = scope.locals_count - block.count_at_entry;
        for (name, previous) in block.saved.into_iter().rev() {
            match previous {
                Some(slot) => {
                    scope.locals.insert(name, slot);
                }
                None => {
                    scope.locals.remove(&name);
                }
            }
        }
        scope.locals_count = block.count_at_entry;
        declared
    }

    /// Number of locals live at the current compilation point
    pub fn locals_count(&self) -> usize {
        self.current().locals_count
    }

    /// Relative offset of an absolute slot at the current point
    pub fn relative_of(&self, abs_slot: usize) -> usize {
        self.current().locals_count - abs_slot
    }

    /// Resolve a name against the scope chain. `None` means the name is a
    /// global. Capture entries are registered in every function scope the
    /// reference crosses.
    pub fn resolve(&mut self, name: &str) -> Option<ResolvedVar> {
        let top = self.scopes.len() - 1;
        match self.resolve_at(top, name)? {
            CaptureSource::ParentLocal(abs) => Some(ResolvedVar::Local(self.relative_of(abs))),
            CaptureSource::ParentEnv(idx) => Some(ResolvedVar::Env(idx)),
        }
    }

    /// Resolve within scope `idx`; the result is expressed as how scope
    /// `idx` itself reaches the variable.
    fn resolve_at(&mut self, idx: usize, name: &str) -> Option<CaptureSource> {
        if let Some(&abs) = self.scopes[idx].locals.get(name) {
            return Some(CaptureSource::ParentLocal(abs));
        }
        if let Some(&ci) = self.scopes[idx].capture_index.get(name) {
            return Some(CaptureSource::ParentEnv(ci));
        }
        if idx == 0 {
            return None;
        }
        let source = self.resolve_at(idx - 1, name)?;
        let scope = &mut self.scopes[idx];
        let ci = scope.captures.len();
        scope.captures.push((name.to_string(), source));
        scope.capture_index.insert(name.to_string(), ci);
        Some(CaptureSource::ParentEnv(ci))
    }
}
