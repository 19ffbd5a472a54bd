//! Error taxonomy and control signals for the macro evaluator
//!
//! Non-local control flow (`return`/`break`/`continue`), scripted
//! exceptions and host-level aborts all travel up the evaluation call
//! chain as variants of [`Control`], the single signal channel. Only
//! [`Control::Exc`] is visible to scripted `try/catch`; an [`Control::Abort`]
//! unwinds all the way to the macro-invocation boundary where it becomes a
//! [`MacroError`].

use super::value::Value;
use diagnostics::{Diagnostic, StackFrame};
use source_map::Pos;
use std::fmt;

/// Non-local exit signal returned up the evaluation call chain
#[derive(Debug, Clone)]
pub enum Control {
    /// `return`, caught at the nearest function boundary
    Return(Value),
    /// `break`, caught at the nearest loop boundary
    Break,
    /// `continue`, caught at the nearest loop boundary
    Continue,
    /// A thrown value; catchable by scripted `try/catch`
    Exc(Exception),
    /// Host-fatal unwind; never visible to scripted handlers
    Abort(AbortReason),
}

impl Control {
    /// Whether this signal is plain control flow rather than an error
    pub fn is_loop_signal(&self) -> bool {
        matches!(self, Control::Break | Control::Continue)
    }
}

/// A value thrown by scripted code or raised by a primitive
#[derive(Debug, Clone)]
pub struct Exception {
    pub value: Value,
    pub pos: Pos,
    /// Call-stack snapshot at the throw site, innermost frame first
    pub stack: Vec<StackFrame>,
}

impl Exception {
    pub fn new(value: Value, pos: Pos) -> Self {
        Self {
            value,
            pos,
            stack: Vec::new(),
        }
    }
}

/// Why a macro evaluation was aborted by the host
#[derive(Debug, Clone)]
pub enum AbortReason {
    /// `Context.fatalError` or an equivalent compiler-reported error
    Fatal { message: String, pos: Pos },
    /// Two distinct field names hashed to the same id
    FieldIdCollision {
        id: u32,
        existing: String,
        incoming: String,
    },
}

/// Error surfaced to the host compiler at the macro-invocation boundary
#[derive(Debug, Clone)]
pub enum MacroError {
    /// A scripted exception escaped to the boundary
    UncaughtException {
        rendered: String,
        pos: Pos,
        stack: Vec<StackFrame>,
    },

    /// `invoke` named a path or method with no registered macro
    NotFound {
        path: String,
        method: String,
        pos: Pos,
    },

    /// The bridge met a Value shape it cannot decode
    InvalidExpression { message: String, pos: Pos },

    /// Syntax the evaluator cannot compile
    CompileError { message: String, pos: Pos },

    /// Closure call depth exceeded the configured limit
    RecursionLimit { depth: usize, max: usize, pos: Pos },

    /// Macro expansion re-entered a macro already being expanded
    CircularExpansion { chain: Vec<String>, pos: Pos },

    /// Host-fatal abort reached the boundary
    Aborted { message: String, pos: Pos },

    /// Two field names hashed onto one id; fatal configuration error
    FieldIdCollision {
        id: u32,
        existing: String,
        incoming: String,
    },
}

impl MacroError {
    pub fn pos(&self) -> Pos {
        match self {
            MacroError::UncaughtException { pos, .. } => *pos,
            MacroError::NotFound { pos, .. } => *pos,
            MacroError::InvalidExpression { pos, .. } => *pos,
            MacroError::CompileError { pos, .. } => *pos,
            MacroError::RecursionLimit { pos, .. } => *pos,
            MacroError::CircularExpansion { pos, .. } => *pos,
            MacroError::Aborted { pos, .. } => *pos,
            MacroError::FieldIdCollision { .. } => Pos::unknown(),
        }
    }

    /// Fine-grained error code. E08xx is reserved for macro evaluation:
    /// - E0801: uncaught exception
    /// - E0802: macro not found
    /// - E0803: invalid expression (bridge decode)
    /// - E0804: compile error
    /// - E0805: recursion limit
    /// - E0806: circular expansion
    /// - E0807: aborted
    /// - E0808: field id collision
    pub fn error_code(&self) -> &'static str {
        match self {
            MacroError::UncaughtException { .. } => "E0801",
            MacroError::NotFound { .. } => "E0802",
            MacroError::InvalidExpression { .. } => "E0803",
            MacroError::CompileError { .. } => "E0804",
            MacroError::RecursionLimit { .. } => "E0805",
            MacroError::CircularExpansion { .. } => "E0806",
            MacroError::Aborted { .. } => "E0807",
            MacroError::FieldIdCollision { .. } => "E0808",
        }
    }

    /// Convert into a diagnostic, attaching the call-stack snapshot when
    /// one was captured
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = Diagnostic::error(format!("[{}] {}", self.error_code(), self), self.pos());
        match self {
            MacroError::UncaughtException { stack, .. } => diag.with_call_stack(stack.clone()),
            _ => diag,
        }
    }
}

impl fmt::Display for MacroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacroError::UncaughtException { rendered, .. } => {
                write!(f, "uncaught exception: {}", rendered)
            }
            MacroError::NotFound { path, method, .. } => {
                write!(f, "macro not found: {}.{}", path, method)
            }
            MacroError::InvalidExpression { message, .. } => {
                write!(f, "invalid expression: {}", message)
            }
            MacroError::CompileError { message, .. } => {
                write!(f, "cannot compile macro expression: {}", message)
            }
            MacroError::RecursionLimit { depth, max, .. } => {
                write!(f, "call depth {} exceeded the limit of {}", depth, max)
            }
            MacroError::CircularExpansion { chain, .. } => {
                write!(f, "circular macro expansion: {}", chain.join(" -> "))
            }
            MacroError::Aborted { message, .. } => {
                write!(f, "macro aborted: {}", message)
            }
            MacroError::FieldIdCollision {
                id,
                existing,
                incoming,
            } => {
                write!(
                    f,
                    "field id collision: '{}' and '{}' both hash to {:#010x}",
                    existing, incoming, id
                )
            }
        }
    }
}

impl std::error::Error for MacroError {}
