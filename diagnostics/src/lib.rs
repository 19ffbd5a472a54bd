//! Diagnostic reporting for the Lumen compiler
//!
//! Diagnostics produced during macro evaluation carry a severity, a source
//! position and, when the error escaped a running script, a snapshot of
//! the evaluator call stack. The renderer turns a diagnostic into the
//! classic `file:line:col: severity: message` form followed by the source
//! line, a caret marker and any `Called from ...` trace lines.

use source_map::{Pos, SourceMap};
use std::fmt;

/// Severity level for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// One frame of an evaluator call-stack snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Name of the called function, or `<anonymous>`
    pub callee: String,
    /// Position of the call site
    pub pos: Pos,
}

impl StackFrame {
    pub fn new(callee: impl Into<String>, pos: Pos) -> Self {
        Self {
            callee: callee.into(),
            pos,
        }
    }
}

/// A diagnostic message with position and optional call-stack snapshot
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub pos: Pos,
    /// Innermost frame first; empty when the diagnostic did not originate
    /// inside a running script
    pub call_stack: Vec<StackFrame>,
    /// Optional hint appended after the main message
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(Severity::Error, message, pos)
    }

    pub fn warning(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(Severity::Warning, message, pos)
    }

    pub fn info(message: impl Into<String>, pos: Pos) -> Self {
        Self::new(Severity::Info, message, pos)
    }

    fn new(severity: Severity, message: impl Into<String>, pos: Pos) -> Self {
        Self {
            severity,
            message: message.into(),
            pos,
            call_stack: Vec::new(),
            suggestion: None,
        }
    }

    pub fn with_call_stack(mut self, frames: Vec<StackFrame>) -> Self {
        self.call_stack = frames;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Renders diagnostics as plain text against a [`SourceMap`]
pub struct Renderer<'a> {
    source_map: &'a SourceMap,
}

impl<'a> Renderer<'a> {
    pub fn new(source_map: &'a SourceMap) -> Self {
        Self { source_map }
    }

    /// Render a single diagnostic, including the offending source line
    /// and call-stack trace when available
    pub fn render(&self, diag: &Diagnostic) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{}: {}: {}",
            self.source_map.display(diag.pos),
            diag.severity,
            diag.message
        ));

        if let Some(snippet) = self.snippet(diag.pos) {
            out.push('\n');
            out.push_str(&snippet);
        }

        for frame in &diag.call_stack {
            out.push('\n');
            out.push_str(&format!(
                "Called from {} ({})",
                frame.callee,
                self.source_map.display(frame.pos)
            ));
        }

        if let Some(suggestion) = &diag.suggestion {
            out.push('\n');
            out.push_str(&format!("help: {}", suggestion));
        }

        out
    }

    /// Render a batch in order, separated by blank lines
    pub fn render_all(&self, diags: &[Diagnostic]) -> String {
        diags
            .iter()
            .map(|d| self.render(d))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// The source line under the position with a caret marker, when the
    /// file is registered
    fn snippet(&self, pos: Pos) -> Option<String> {
        let resolved = self.source_map.resolve(pos)?;
        let file = self.source_map.file(pos.file)?;
        let line = file.line(resolved.line)?;
        let mut caret = String::new();
        for _ in 1..resolved.column {
            caret.push(' ');
        }
        let width = if resolved.end_line == resolved.line {
            (resolved.end_column.saturating_sub(resolved.column)).max(1)
        } else {
            line.len().saturating_sub(resolved.column - 1).max(1)
        };
        for _ in 0..width {
            caret.push('^');
        }
        Some(format!("  {}\n  {}", line, caret))
    }
}
