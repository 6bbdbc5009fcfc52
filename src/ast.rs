//! The core value model of the interpreter. The single polymorphic entity is
//! [`Value`], a tagged variant covering lists, symbols, strings, numeric
//! arrays, user closures (lambdas and macros) and built-in ops. Values are
//! cheaply clonable handles: payloads that the language mutates in place
//! (lists and arrays) live behind `Arc<RwLock<..>>` so every handle to the
//! same datum observes `lset`/`lappend`/`assign`-style mutation, and so
//! values may cross into the scheduler's worker thread.
//!
//! Ergonomic constructors ([`num`], [`sym`], [`text`], [`list`], [`nil`])
//! keep tests and primitives readable. Equality is deep and structural, with
//! a small numeric tolerance on array elements. Printing has two modes:
//! `Display` renders for humans, [`WriteForm`] renders reader-compatible
//! text (quoted strings, op names).

use crate::builtinops::OpDef;
use crate::evaluator::Environment;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Absolute tolerance used when comparing array elements.
pub const EQ_EPSILON: f64 = 1e-6;

/// Lock a shared payload for reading, ignoring poisoning: a panicking
/// background task must not wedge the values it was touching.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Lock a shared payload for writing, ignoring poisoning.
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A user-defined callable: parameters, body forms, and the environment
/// captured when `\` (or `macro`) was evaluated.
pub struct Closure {
    pub params: Vec<Arc<str>>,
    pub body: Vec<Value>,
    pub env: Environment,
}

/// The universal tagged datum. A `Value` never changes tag after
/// construction; `nil` is the empty list.
#[derive(Clone)]
pub enum Value {
    /// Ordered sequence of values. The empty list is nil.
    List(Arc<RwLock<Vec<Value>>>),
    /// Identifier, resolved through the environment chain.
    Symbol(Arc<str>),
    /// String literal; the stored lexeme carries no surrounding quotes.
    Str(Arc<str>),
    /// Dense vector of 64-bit reals. Scalars are length-1 arrays.
    Array(Arc<RwLock<Vec<f64>>>),
    /// User function with lexical scope.
    Lambda(Arc<Closure>),
    /// Like a lambda, but receives argument forms unevaluated and returns a
    /// form that is evaluated again.
    Macro(Arc<Closure>),
    /// Built-in primitive (or special-form marker) from the registry.
    Op(Arc<OpDef>),
}

/// Scalar number as a length-1 array.
pub fn num(x: f64) -> Value {
    Value::Array(Arc::new(RwLock::new(vec![x])))
}

/// Array from a vector of reals.
pub fn array(cells: Vec<f64>) -> Value {
    Value::Array(Arc::new(RwLock::new(cells)))
}

/// Symbol from a lexeme.
pub fn sym(name: &str) -> Value {
    Value::Symbol(Arc::from(name))
}

/// String value from a lexeme.
pub fn text(s: &str) -> Value {
    Value::Str(Arc::from(s))
}

/// List from a vector of values.
pub fn list(items: Vec<Value>) -> Value {
    Value::List(Arc::new(RwLock::new(items)))
}

/// The empty list.
pub fn nil() -> Value {
    list(Vec::new())
}

impl Value {
    /// Tag name, as reported by the `type` primitive.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::List(_) => "list",
            Value::Symbol(_) => "symbol",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Lambda(_) => "lambda",
            Value::Macro(_) => "macro",
            Value::Op(_) => "op",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::List(items) if read_lock(items).is_empty())
    }

    pub fn as_list(&self) -> Result<&Arc<RwLock<Vec<Value>>>, crate::Error> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(type_mismatch("list", other)),
        }
    }

    pub fn as_array(&self) -> Result<&Arc<RwLock<Vec<f64>>>, crate::Error> {
        match self {
            Value::Array(cells) => Ok(cells),
            other => Err(type_mismatch("array", other)),
        }
    }

    pub fn as_symbol(&self) -> Result<&Arc<str>, crate::Error> {
        match self {
            Value::Symbol(name) => Ok(name),
            other => Err(type_mismatch("symbol", other)),
        }
    }

    pub fn as_text(&self) -> Result<&Arc<str>, crate::Error> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(type_mismatch("string", other)),
        }
    }

    /// First element of an array value; how every primitive reads a scalar.
    pub fn number(&self) -> Result<f64, crate::Error> {
        let cells = read_lock(self.as_array()?);
        cells
            .first()
            .copied()
            .ok_or_else(|| crate::Error::domain("empty array where a number is required"))
    }
}

pub(crate) fn type_mismatch(expected: &str, got: &Value) -> crate::Error {
    crate::Error::type_error(format!("expected {expected}, got {}", got.type_name()))
}

// Conversions used pervasively by tests and embedders.

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        num(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        num(if b { 1.0 } else { 0.0 })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        text(s)
    }
}

impl From<Vec<f64>> for Value {
    fn from(cells: Vec<f64>) -> Self {
        array(cells)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        list(items)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (read_lock(a), read_lock(b));
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (read_lock(a), read_lock(b));
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < EQ_EPSILON)
            }
            (Value::Lambda(a), Value::Lambda(b)) | (Value::Macro(a), Value::Macro(b)) => {
                // Environments are not compared.
                Arc::ptr_eq(a, b) || (a.params == b.params && a.body == b.body)
            }
            (Value::Op(a), Value::Op(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PrintMode {
    /// Human output: raw strings, opaque ops.
    Display,
    /// Reader-compatible output: quoted strings, op names.
    Write,
}

fn fmt_real(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    // Whole numbers print without a fractional part so that scalars
    // round-trip through the reader in their shortest form.
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
        write!(f, "{}", x as i64)
    } else {
        write!(f, "{x}")
    }
}

impl Value {
    fn format(&self, f: &mut fmt::Formatter<'_>, mode: PrintMode) -> fmt::Result {
        match self {
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in read_lock(items).iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    item.format(f, mode)?;
                }
                write!(f, ")")
            }
            Value::Symbol(name) => write!(f, "{name}"),
            Value::Str(s) => match mode {
                PrintMode::Display => write!(f, "{s}"),
                PrintMode::Write => {
                    write!(f, "\"")?;
                    for ch in s.chars() {
                        match ch {
                            '"' => write!(f, "\\\"")?,
                            '\\' => write!(f, "\\\\")?,
                            '\n' => write!(f, "\\n")?,
                            '\t' => write!(f, "\\t")?,
                            '\r' => write!(f, "\\r")?,
                            c => write!(f, "{c}")?,
                        }
                    }
                    write!(f, "\"")
                }
            },
            Value::Array(cells) => {
                let cells = read_lock(cells);
                if cells.len() == 1 {
                    fmt_real(f, cells[0])
                } else {
                    write!(f, "[")?;
                    for (i, x) in cells.iter().enumerate() {
                        if i > 0 {
                            write!(f, " ")?;
                        }
                        fmt_real(f, *x)?;
                    }
                    write!(f, "]")
                }
            }
            Value::Lambda(c) | Value::Macro(c) => {
                let head = if matches!(self, Value::Lambda(_)) {
                    "lambda"
                } else {
                    "macro"
                };
                write!(f, "({head} (")?;
                for (i, p) in c.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")")?;
                for expr in &c.body {
                    write!(f, " ")?;
                    expr.format(f, mode)?;
                }
                write!(f, ")")
            }
            Value::Op(op) => match mode {
                PrintMode::Display => write!(f, "<op @ {}>", op.name),
                PrintMode::Write => write!(f, "{}", op.name),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format(f, PrintMode::Display)
    }
}

/// Reader-compatible rendering of a value, used by `save` and the tests'
/// round-trip checks: `read(write(v)) == v` for every reader-producible `v`.
pub struct WriteForm<'a>(pub &'a Value);

impl fmt::Display for WriteForm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.format(f, PrintMode::Write)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.format(f, PrintMode::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names() {
        let cases: Vec<(Value, &str)> = vec![
            (nil(), "list"),
            (list(vec![num(1.0)]), "list"),
            (sym("osc"), "symbol"),
            (text("osc"), "string"),
            (num(440.0), "array"),
            (array(vec![]), "array"),
        ];
        for (value, expected) in cases {
            assert_eq!(value.type_name(), expected);
        }
    }

    #[test]
    fn test_nil_is_empty_list() {
        assert!(nil().is_nil());
        assert!(!list(vec![nil()]).is_nil());
        assert_eq!(nil(), list(Vec::new()));
    }

    #[test]
    fn test_equality_tolerance() {
        assert_eq!(num(1.0), num(1.0000001));
        assert_ne!(num(1.0), num(1.001));
        assert_eq!(array(vec![1.0, 2.0]), array(vec![1.0, 2.0]));
        assert_ne!(array(vec![1.0, 2.0]), array(vec![1.0]));
        // Tags must match: a scalar is not a one-element list.
        assert_ne!(num(1.0), list(vec![num(1.0)]));
        assert_ne!(sym("a"), text("a"));
    }

    #[test]
    fn test_deep_list_equality() {
        let a = list(vec![sym("seq"), array(vec![1.0, 2.0]), text("x")]);
        let b = list(vec![sym("seq"), array(vec![1.0, 2.0]), text("x")]);
        assert_eq!(a, b);

        let shared = list(vec![num(7.0)]);
        assert_eq!(shared, shared.clone());
    }

    #[test]
    fn test_shared_mutation_visible_through_handles() {
        let xs = list(vec![num(1.0), num(2.0)]);
        let alias = xs.clone();
        if let Value::List(items) = &xs {
            write_lock(items).push(num(3.0));
        }
        assert_eq!(alias, list(vec![num(1.0), num(2.0), num(3.0)]));
    }

    #[test]
    fn test_display_modes() {
        let v = list(vec![sym("play"), text("a\"b"), num(2.0), array(vec![1.0, 2.5])]);
        assert_eq!(format!("{v}"), "(play a\"b 2 [1 2.5])");
        assert_eq!(format!("{}", WriteForm(&v)), "(play \"a\\\"b\" 2 [1 2.5])");
    }

    #[test]
    fn test_scalar_prints_bare() {
        assert_eq!(format!("{}", num(12.0)), "12");
        assert_eq!(format!("{}", num(0.5)), "0.5");
        assert_eq!(format!("{}", array(vec![11.0, 12.0, 13.0])), "[11 12 13]");
        assert_eq!(format!("{}", array(vec![])), "[]");
    }
}
