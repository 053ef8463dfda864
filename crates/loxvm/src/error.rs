//! Error types shared by the compiler and the VM.
//!
//! Kept as hand-rolled enums with manual `Display`/`Error` impls rather than
//! reaching for `thiserror`, in the same style as hand-rolled error shapes
//! elsewhere in this crate's lineage (`callable.rs`, `function.rs`).

use std::fmt;

/// A single compile-time diagnostic, reported at a specific source location.
///
/// Panic-mode recovery means a single `compile()` call can produce more than
/// one of these; `compile()` keeps going after the first and returns all of
/// them together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: usize,
    pub column: usize,
    /// The offending lexeme, or `None` for an end-of-file error.
    pub lexeme: Option<String>,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lexeme {
            Some(lexeme) => write!(
                f,
                "[line {}:{}] ERROR at '{}': {}",
                self.line, self.column, lexeme, self.message
            ),
            None => write!(f, "[line {}:{}] ERROR at end: {}", self.line, self.column, self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub line: usize,
    /// The function name, or `"script"` for the top-level frame.
    pub name: String,
}

/// A runtime error, with the stack trace captured at the point it was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub frames: Vec<StackFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Runtime Error: {}", self.message)?;
        for (i, frame) in self.frames.iter().enumerate() {
            if i + 1 == self.frames.len() {
                write!(f, "  line {} in {}", frame.line, frame.name)?;
            } else {
                writeln!(f, "  line {} in {}", frame.line, frame.name)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Outcome of interpreting a complete program, mapping to the process exit
/// code contract (0 / 65 / 70).
#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl InterpretError {
    /// The process exit code this error maps to.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Compile(_) => 65, // EX_DATAERR
            Self::Runtime(_) => 70, // EX_SOFTWARE
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            Self::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}
