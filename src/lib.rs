//! tactus - a small homoiconic scripting language for music work
//!
//! This crate implements a tree-walking interpreter for an S-expression
//! language whose only compound datum is the list and whose only number is
//! the IEEE double, carried in dense arrays (a scalar is a length-1 array).
//! The pieces fit together as a classic pipeline:
//!
//! - `reader`: text -> `Value` forms (quote sugar, string escapes, comments)
//! - `ast`: the shared, reference-counted `Value` model, printing, equality
//! - `evaluator`: environments, the trampolined eval loop, special forms,
//!   closures and first-class macros, partial application
//! - `builtinops`: the primitive registry (list, array, string, I/O ops)
//! - `scheduler`: deferred evaluation behind the `schedule` form
//!
//! ## Language sketch
//!
//! ```lisp
//! (def f (\ (x y) (* x y)))   ; closures capture lexically
//! (f 3 4)                     ; 12
//! ((f 3) 4)                   ; 12 - partial application
//! (schedule (display "tick") 500 1)  ; deferred, off-thread
//! ```
//!
//! Host programs embed the interpreter with [`evaluator::make_env`] and add
//! their own primitives through [`evaluator::Environment::register_op`].

use std::fmt;

/// Upper bound on non-tail evaluator nesting. Tail calls are rewritten in
/// place and never count against this; the bound exists so runaway non-tail
/// recursion fails with a clean error instead of exhausting the native stack.
pub const MAX_CALL_DEPTH: usize = 1_000;

/// Maximum number of stack frames rendered into an error's trace.
const MAX_TRACE_FRAMES: usize = 12;

/// Failure categories reported by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reader failure: bad token, unbalanced parens, unterminated string.
    Parse,
    /// Symbol lookup miss.
    Unbound,
    /// Wrong number of arguments to an op, lambda, or special form.
    Arity,
    /// A value's tag does not match what the operation expects.
    Type,
    /// Right type, invalid value (negative index, empty condition, ...).
    Domain,
    /// File open/read/write failure.
    Io,
    /// Failure from the host: `exec`, OS-level conditions.
    Host,
}

/// The uniform failure value raised by every layer of the interpreter.
///
/// Errors carry a message, optionally the form under evaluation when the
/// error surfaced, and a snapshot of the evaluator's call stack rendered as
/// text (innermost first). The evaluator fills `form` and `trace` the first
/// time an error crosses an activation with an empty trace, so the snapshot
/// reflects the deepest point reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub form: Option<String>,
    pub trace: Vec<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            form: None,
            trace: Vec::new(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn unbound(name: &str) -> Self {
        Self::new(ErrorKind::Unbound, format!("unbound identifier: {name}"))
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn domain(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Domain, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Host, message)
    }

    /// Attach the offending form and a call-stack snapshot, keeping the
    /// innermost (first-attached) context if one is already present.
    pub(crate) fn with_context(mut self, form: String, mut trace: Vec<String>) -> Self {
        if self.form.is_none() {
            self.form = Some(form);
            trace.truncate(MAX_TRACE_FRAMES);
            self.trace = trace;
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {}", self.message)?;
        if let Some(form) = &self.form {
            write!(f, " -> {form}")?;
        }
        for (i, frame) in self.trace.iter().enumerate() {
            write!(f, "\n  {}: {}", i + 1, frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod reader;
pub mod scheduler;
