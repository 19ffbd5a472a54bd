//! Source file registry and position mapping for the Lumen compiler
//!
//! Macro evaluation carries source positions around as opaque `Pos` values:
//! a file identifier plus a byte range. This library owns the mapping from
//! those compact positions back to human-readable file/line/column
//! information, which is only needed when a diagnostic is actually printed.

use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a registered source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Sentinel for positions synthesized outside any real file
    pub const fn unknown() -> Self {
        Self(u32::MAX)
    }

    pub const fn is_unknown(self) -> bool {
        self.0 == u32::MAX
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown>")
        } else {
            write!(f, "file#{}", self.0)
        }
    }
}

/// A compact source position: file plus byte range.
///
/// `Pos` is the currency of the macro evaluator: it is stored on AST
/// nodes, threaded through call frames and attached to diagnostics, but
/// never decomposed into line/column except through a [`SourceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pos {
    pub file: FileId,
    pub min: u32,
    pub max: u32,
}

impl Pos {
    pub const fn new(file: FileId, min: u32, max: u32) -> Self {
        Self { file, min, max }
    }

    pub const fn unknown() -> Self {
        Self {
            file: FileId::unknown(),
            min: 0,
            max: 0,
        }
    }

    pub const fn is_unknown(self) -> bool {
        self.file.is_unknown()
    }

    /// Join two positions into one covering both (same file only;
    /// mismatched files keep the left position).
    pub fn union(self, other: Pos) -> Pos {
        if self.file != other.file {
            return self;
        }
        Pos {
            file: self.file,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

impl Default for Pos {
    fn default() -> Self {
        Self::unknown()
    }
}

/// A registered source file with a precomputed line-start table
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
    line_starts: Vec<u32>,
}

impl SourceFile {
    pub fn new(name: String, content: String) -> Self {
        let line_starts = compute_line_starts(&content);
        Self {
            name,
            content,
            line_starts,
        }
    }

    /// Number of lines in the file (a trailing newline does not open a line)
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Fetch one line of source text (1-based), without its terminator
    pub fn line(&self, line_number: usize) -> Option<&str> {
        if line_number == 0 || line_number > self.line_starts.len() {
            return None;
        }
        let start = self.line_starts[line_number - 1] as usize;
        let end = self
            .line_starts
            .get(line_number)
            .map(|&o| o as usize)
            .unwrap_or(self.content.len());
        Some(self.content[start..end].trim_end_matches(['\n', '\r']))
    }

    /// Resolve a byte offset to 1-based (line, column)
    pub fn line_col(&self, offset: u32) -> (usize, usize) {
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let line_start = self.line_starts.get(line_index).copied().unwrap_or(0);
        (line_index + 1, (offset - line_start) as usize + 1)
    }
}

/// Resolved, human-readable form of a [`Pos`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPos {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

impl fmt::Display for ResolvedPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Registry of source files for one compilation
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    files: HashMap<FileId, SourceFile>,
    next_id: u32,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source file and return its id
    pub fn add_file(&mut self, name: impl Into<String>, content: impl Into<String>) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        self.files.insert(id, SourceFile::new(name.into(), content.into()));
        id
    }

    pub fn file(&self, id: FileId) -> Option<&SourceFile> {
        self.files.get(&id)
    }

    /// Look up a file id by registered name
    pub fn file_by_name(&self, name: &str) -> Option<FileId> {
        self.files
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| *id)
    }

    pub fn file_name(&self, id: FileId) -> Option<&str> {
        self.files.get(&id).map(|f| f.name.as_str())
    }

    /// Resolve an opaque position to file/line/column form
    pub fn resolve(&self, pos: Pos) -> Option<ResolvedPos> {
        let file = self.files.get(&pos.file)?;
        let (line, column) = file.line_col(pos.min);
        let (end_line, end_column) = file.line_col(pos.max);
        Some(ResolvedPos {
            file: file.name.clone(),
            line,
            column,
            end_line,
            end_column,
        })
    }

    /// Format a position for diagnostics; falls back to a raw form when
    /// the file is not registered
    pub fn display(&self, pos: Pos) -> String {
        match self.resolve(pos) {
            Some(r) => r.to_string(),
            None if pos.is_unknown() => "<unknown>".to_string(),
            None => format!("{}:{}-{}", pos.file, pos.min, pos.max),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn compute_line_starts(source: &str) -> Vec<u32> {
    let mut line_starts = vec![0];
    for (i, ch) in source.char_indices() {
        if ch == '\n' {
            line_starts.push((i + 1) as u32);
        }
    }
    line_starts
}
