//! Lumen compile-time macro evaluator
//!
//! A dynamically-typed tree-walking interpreter that runs macro scripts
//! during compilation. It covers:
//!
//! - **Value Store**: tagged-union runtime values and prototype-chained
//!   objects with hashed, sorted field storage
//! - **Scope Resolver**: one-shot resolution of identifiers into
//!   this/local-slot/environment-slot/global-cell accessors
//! - **Evaluator Core**: compilation of syntax nodes into reusable thunks,
//!   control flow as an explicit signal channel, operator dispatch and the
//!   diagnostic call stack
//! - **Native Library Registry**: `library@name` primitive tables with
//!   declared arities
//! - **Typed-World Bridge**: identity-preserving encode/decode between
//!   runtime values and the compiler's typed representation

pub mod bridge;
mod compile;
pub mod context;
pub mod errors;
pub mod eval;
mod natives;
pub mod object;
mod ops;
pub mod registry;
mod scope;
pub mod value;

pub use bridge::signature;
pub use context::MacroContext;
pub use natives::compress::CompressState;
pub use natives::io::FileState;
pub use natives::regexp::RegexState;
pub use errors::{AbortReason, Control, Exception, MacroError};
pub use eval::{EvalContext, MacroInterpreter, Vm};
pub use object::{FieldId, FieldTable, Object};
pub use registry::{MacroRegistry, NativeRegistry, TypeRegistry};
pub use value::{Arity, Closure, FnProto, Handle, NativeCall, NativeFn, Value};
