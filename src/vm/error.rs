//! Script-level failures and their diagnostic rendering.
//!
//! Compile errors and uncaught exceptions share one report shape:
//!
//! ```text
//!     at inner (main.js:2:9)        <- stack trace, when available
//! main.js:2: Error: boom
//!   throw new Error("boom");
//!   ^^^^^^^^^^^^^^^^^^^^^^^^
//! ```

use std::fmt;
use std::io::{self, Write};

use swc_common::Span;

use super::value::JsValue;

/// One entry of a captured call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub resource: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = if self.function.is_empty() {
            "<anonymous>"
        } else {
            &self.function
        };
        write!(f, "    at {} ({}:{}:{})", name, self.resource, self.line, self.column)
    }
}

/// Where in a compiled unit an error happened. Lines are 1-based,
/// columns 0-based character offsets into `source_line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorLocation {
    pub resource: String,
    pub line: usize,
    pub start_column: usize,
    pub end_column: usize,
    pub source_line: String,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.line, self.start_column + 1)
    }
}

/// A thrown script value together with the throw site.
pub struct Exception {
    pub value: JsValue,
    pub span: Span,
    pub stack: Vec<StackFrame>,
}

/// Non-local exit out of the interpreter.
pub enum Abrupt {
    /// A script `throw` (or an engine-raised error object); catchable.
    Throw(Box<Exception>),
    /// `node.exit(code)` or a fatal `node.compile`; never caught by script.
    Exit(i32),
}

impl Abrupt {
    pub fn throw(value: JsValue, span: Span, stack: Vec<StackFrame>) -> Self {
        Abrupt::Throw(Box::new(Exception { value, span, stack }))
    }
}

impl fmt::Debug for Abrupt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Abrupt::Throw(e) => write!(f, "Throw({})", e.value.to_js_string()),
            Abrupt::Exit(code) => write!(f, "Exit({})", code),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{location}: SyntaxError: {message}")]
pub struct CompileError {
    pub message: String,
    pub location: ErrorLocation,
}

impl CompileError {
    pub fn report(&self, out: &mut dyn Write) -> io::Result<()> {
        write_report(out, &[], Some(&self.location), &format!("SyntaxError: {}", self.message))
    }
}

/// An uncaught exception, detached from engine values so it can outlive
/// the runtime that raised it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Uncaught {message}")]
pub struct ScriptError {
    pub message: String,
    pub location: Option<ErrorLocation>,
    pub stack: Vec<StackFrame>,
}

impl ScriptError {
    pub fn report(&self, out: &mut dyn Write) -> io::Result<()> {
        write_report(out, &self.stack, self.location.as_ref(), &self.message)
    }
}

/// Unrecoverable failure of the engine or reactor itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{location} {message}")]
pub struct EngineError {
    pub location: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(location: &'static str, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }

    pub fn report(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "FATAL ERROR: {} {}", self.location, self.message)
    }
}

fn write_report(
    out: &mut dyn Write,
    stack: &[StackFrame],
    location: Option<&ErrorLocation>,
    message: &str,
) -> io::Result<()> {
    let Some(location) = location else {
        // No position information; the message alone.
        return writeln!(out, "{}", message);
    };

    for frame in stack {
        writeln!(out, "{}", frame)?;
    }
    writeln!(out, "{}:{}: {}", location.resource, location.line, message)?;
    writeln!(out, "{}", location.source_line)?;

    let start = location.start_column;
    let end = location.end_column.max(start + 1);
    writeln!(out, "{}{}", " ".repeat(start), "^".repeat(end - start))
}
