//! Error types surfaced by the core.
//!
//! Parse and compile errors abort their phase with a message. Runtime
//! errors unwind the interpreter back to the outermost host call, which
//! then returns `null` and reports the error with the fragment name and
//! source line. Errors are never catchable from within the language.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// Result alias for operations that can raise a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// What class of runtime failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum RunErrorKind {
    /// Operator/operand mismatch, calling a non-function, key on a
    /// non-object, and similar.
    TypeError,
    /// Array index out of range or missing object key on load.
    BoundsError,
    /// A call would push past the stack capacity.
    StackOverflow,
    /// Wrong number of arguments for a Tack function.
    ArityError,
}

/// A runtime error, raised at an instruction and decorated with the
/// fragment name and source line as it unwinds.
#[derive(Debug, Clone)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub message: String,
    /// Fragment name and 1-based line, filled in by the interpreter loop.
    pub location: Option<(String, u32)>,
}

impl RunError {
    pub(crate) fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::new(RunErrorKind::TypeError, message)
    }

    pub(crate) fn bounds_error(message: impl Into<String>) -> Self {
        Self::new(RunErrorKind::BoundsError, message)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some((fragment, line)) = &self.location {
            write!(f, " (line {line} in {fragment})")?;
        }
        Ok(())
    }
}

/// Malformed source text. Carries the line and a prefix of the remaining
/// input so the message points at where recognition stopped.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
    pub remainder: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at line {}: {}", self.line, self.message)?;
        if !self.remainder.is_empty() {
            write!(f, " near '{}'", self.remainder)?;
        }
        Ok(())
    }
}

/// A fault found while lowering the AST: undeclared names, const
/// reassignment, illegal assignment targets, out-of-range jumps,
/// duplicate parameters, register exhaustion.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl CompileError {
    pub(crate) fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compile error at line {}: {}", self.line, self.message)
    }
}

/// Umbrella error for the host-facing entry points.
#[derive(Debug)]
pub enum TackError {
    Parse(ParseError),
    Compile(CompileError),
    /// Module file not found or unreadable.
    Module(String),
}

impl fmt::Display for TackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => e.fmt(f),
            Self::Compile(e) => e.fmt(f),
            Self::Module(msg) => write!(f, "module error: {msg}"),
        }
    }
}

impl std::error::Error for TackError {}

impl From<ParseError> for TackError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<CompileError> for TackError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}
