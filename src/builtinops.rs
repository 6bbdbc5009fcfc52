//! Built-in operation registry and every core primitive.
//!
//! An [`OpDef`] couples a registered name with either a native function of
//! the uniform signature `fn(&[Value], &Environment) -> Result<Value, Error>`
//! or a [`Form`] discriminant the evaluator dispatches on. Every core op
//! lives in one static registry table (`CORE_OPS`, with a derived name map
//! behind [`find_op`]); `install` binds the shared entries into an
//! environment, where ops are values like any other. The evaluator
//! recognizes special forms by the identity carried in the resolved head,
//! never by re-parsing names.
//!
//! Primitives are grouped the way the language manual groups them: list
//! operations, numeric-array operations (elementwise arithmetic with scalar
//! broadcast, reductions, strided slice/assign), string operations behind
//! the `str` dispatcher, and I/O (`display`, `save`, `read`, `load`,
//! `exec`, `exit`).
//!
//! In-place mutation is deliberate and limited: `lset`, `lappend`,
//! `lreplace` and `assign` write through the shared payload of their first
//! argument; everything else allocates fresh values.

use crate::Error;
use crate::ast::{self, Value, WriteForm, read_lock, write_lock};
use crate::evaluator::{self, Environment};
use crate::reader;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::io::Write as _;
use std::sync::{Arc, LazyLock};

/// Canonical signature of a native primitive.
pub type NativeFn = fn(&[Value], &Environment) -> Result<Value, Error>;

/// Special forms the evaluator implements itself. The discriminant travels
/// inside the op value, so rebinding the name keeps the behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    Quote,
    Def,
    Assign,
    Lambda,
    Macro,
    If,
    While,
    Begin,
    Eval,
    Apply,
    Schedule,
}

pub enum OpKind {
    Native(NativeFn),
    Form(Form),
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Native(_) => write!(f, "Native(<fn>)"),
            OpKind::Form(form) => write!(f, "Form({form:?})"),
        }
    }
}

/// A registered primitive: name, implementation, minimum argument count.
/// Special forms validate their own shapes; `min_args` is enforced by the
/// evaluator for natives only.
#[derive(Debug)]
pub struct OpDef {
    pub name: String,
    pub kind: OpKind,
    pub min_args: usize,
}

/// Global registry of the core operations, built once. Every op lives in a
/// single auditable table; `install` binds each entry into an environment
/// and [`find_op`] resolves names through the derived map.
static CORE_OPS: LazyLock<Vec<Arc<OpDef>>> = LazyLock::new(|| {
    fn native(name: &'static str, f: NativeFn, min_args: usize) -> Arc<OpDef> {
        Arc::new(OpDef {
            name: name.to_owned(),
            kind: OpKind::Native(f),
            min_args,
        })
    }

    fn form(name: &'static str, marker: Form, min_args: usize) -> Arc<OpDef> {
        Arc::new(OpDef {
            name: name.to_owned(),
            kind: OpKind::Form(marker),
            min_args,
        })
    }

    vec![
        // Special forms: the evaluator recognizes these by the op identity
        // carried in the value, not by name.
        form("quote", Form::Quote, 1),
        form("def", Form::Def, 2),
        form("=", Form::Assign, 2),
        form("\\", Form::Lambda, 2),
        form("macro", Form::Macro, 2),
        form("if", Form::If, 2),
        form("while", Form::While, 2),
        form("begin", Form::Begin, 0),
        form("eval", Form::Eval, 1),
        form("apply", Form::Apply, 2),
        form("schedule", Form::Schedule, 3),
        // Environment and type inspection
        native("env", fn_env, 0),
        native("type", fn_type, 1),
        // List operations
        native("list", fn_list, 0),
        native("lindex", fn_lindex, 2),
        native("lset", fn_lset, 3),
        native("llength", fn_llength, 1),
        native("lappend", fn_lappend, 2),
        native("lrange", fn_lrange, 3),
        native("lreplace", fn_lreplace, 4),
        native("lshuffle", fn_lshuffle, 1),
        // Array operations
        native("array", fn_array, 0),
        native("==", fn_equal, 2),
        native("+", fn_add, 2),
        native("-", fn_sub, 2),
        native("*", fn_mul, 2),
        native("/", fn_div, 2),
        native("<", fn_lt, 2),
        native("<=", fn_le, 2),
        native(">", fn_gt, 2),
        native(">=", fn_ge, 2),
        native("min", fn_min, 1),
        native("max", fn_max, 1),
        native("sum", fn_sum, 1),
        native("size", fn_size, 1),
        native("sqrt", fn_sqrt, 1),
        native("sin", fn_sin, 1),
        native("cos", fn_cos, 1),
        native("tan", fn_tan, 1),
        native("asin", fn_asin, 1),
        native("acos", fn_acos, 1),
        native("atan", fn_atan, 1),
        native("sinh", fn_sinh, 1),
        native("cosh", fn_cosh, 1),
        native("tanh", fn_tanh, 1),
        native("log", fn_log, 1),
        native("log10", fn_log10, 1),
        native("exp", fn_exp, 1),
        native("abs", fn_abs, 1),
        native("neg", fn_neg, 1),
        native("floor", fn_floor, 1),
        native("slice", fn_slice, 3),
        native("assign", fn_assign, 4),
        // String operations
        native("str", fn_str, 2),
        // I/O and host
        native("display", fn_display, 0),
        native("save", fn_save, 1),
        native("read", fn_read, 0),
        native("load", fn_load, 1),
        native("exec", fn_exec, 1),
        native("exit", fn_exit, 0),
    ]
});

/// Name -> op map derived from [`CORE_OPS`].
static CORE_BY_NAME: LazyLock<HashMap<&'static str, Arc<OpDef>>> = LazyLock::new(|| {
    let ops: &'static [Arc<OpDef>] = CORE_OPS.as_slice();
    ops.iter().map(|op| (op.name.as_str(), op.clone())).collect()
});

/// Look up a core primitive by its registered name. The returned op shares
/// identity with the registry entry, so it compares equal to the binding
/// `install` placed in any environment.
pub fn find_op(name: &str) -> Option<Value> {
    CORE_BY_NAME.get(name).map(|op| Value::Op(op.clone()))
}

/// Bind every registry entry into the given environment.
pub(crate) fn install(env: &Environment) {
    for op in CORE_OPS.iter() {
        env.define(&op.name, Value::Op(op.clone()));
    }
}

//
// Argument helpers
//

/// Owned copy of an array payload; avoids nested locks when an op receives
/// the same array twice.
fn array_cells(value: &Value) -> Result<Vec<f64>, Error> {
    Ok(read_lock(value.as_array()?).clone())
}

fn checked_index(value: &Value, what: &str) -> Result<usize, Error> {
    let x = value.number()?;
    if !x.is_finite() || x < 0.0 {
        return Err(Error::domain(format!(
            "{what} must be non-negative, got {x}"
        )));
    }
    Ok(x as usize)
}

/// Optional trailing stride argument, defaulting to 1.
fn stride_of(args: &[Value], position: usize) -> Result<usize, Error> {
    if args.len() <= position {
        return Ok(1);
    }
    let stride = checked_index(&args[position], "stride")?;
    if stride == 0 {
        return Err(Error::domain("stride must be positive"));
    }
    Ok(stride)
}

/// Indices `start, start+stride, ...` for `count` steps. With `clamp` the
/// walk stops at `bound`; without it, stepping past `bound` is an error.
fn strided_indices(
    start: usize,
    count: usize,
    stride: usize,
    bound: usize,
    clamp: bool,
) -> Result<Vec<usize>, Error> {
    let mut indices = Vec::new();
    let mut i = start;
    for _ in 0..count {
        if i >= bound {
            if clamp {
                break;
            }
            return Err(Error::domain(format!(
                "index {i} out of range (length {bound})"
            )));
        }
        indices.push(i);
        i += stride;
    }
    Ok(indices)
}

//
// Environment and type inspection
//

fn fn_env(args: &[Value], env: &Environment) -> Result<Value, Error> {
    match args {
        [] => Ok(ast::list(env.local_symbols())),
        [Value::Symbol(name)] if name.as_ref() == "full" => Ok(ast::list(env.all_bindings())),
        _ => Err(Error::domain(
            "env takes no argument, or the symbol full",
        )),
    }
}

fn fn_type(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(ast::sym(args[0].type_name()))
}

//
// List operations
//

fn fn_list(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(ast::list(args.to_vec()))
}

fn fn_lindex(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let items = read_lock(args[0].as_list()?);
    let index = checked_index(&args[1], "list index")?;
    items
        .get(index)
        .cloned()
        .ok_or_else(|| Error::domain(format!("index {index} out of range (length {})", items.len())))
}

fn fn_lset(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    {
        let mut items = write_lock(args[0].as_list()?);
        let index = checked_index(&args[2], "list index")?;
        let len = items.len();
        let slot = items
            .get_mut(index)
            .ok_or_else(|| Error::domain(format!("index {index} out of range (length {len})")))?;
        *slot = args[1].clone();
    }
    Ok(args[0].clone())
}

fn fn_llength(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(ast::num(read_lock(args[0].as_list()?).len() as f64))
}

fn fn_lappend(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    {
        let mut items = write_lock(args[0].as_list()?);
        items.extend(args[1..].iter().cloned());
    }
    Ok(args[0].clone())
}

fn fn_lrange(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let items = read_lock(args[0].as_list()?);
    let start = checked_index(&args[1], "start")?;
    let count = checked_index(&args[2], "length")?;
    let stride = stride_of(args, 3)?;
    let indices = strided_indices(start, count, stride, items.len(), true)?;
    Ok(ast::list(indices.iter().map(|i| items[*i].clone()).collect()))
}

fn fn_lreplace(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    // Copy the source first: the destination may be the same list.
    let source: Vec<Value> = read_lock(args[1].as_list()?).clone();
    {
        let mut items = write_lock(args[0].as_list()?);
        let start = checked_index(&args[2], "start")?;
        let count = checked_index(&args[3], "length")?;
        let stride = stride_of(args, 4)?;
        let indices = strided_indices(start, count, stride, items.len(), true)?;
        for (k, i) in indices.into_iter().enumerate() {
            match source.get(k) {
                Some(value) => items[i] = value.clone(),
                None => break,
            }
        }
    }
    Ok(args[1].clone())
}

fn fn_lshuffle(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let mut items: Vec<Value> = read_lock(args[0].as_list()?).clone();
    items.shuffle(&mut rand::thread_rng());
    Ok(ast::list(items))
}

//
// Array operations
//

fn fn_array(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let mut cells = Vec::new();
    for arg in args {
        cells.extend(array_cells(arg)?);
    }
    Ok(ast::array(cells))
}

fn fn_equal(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(ast::num(if args[0] == args[1] { 1.0 } else { 0.0 }))
}

/// Elementwise combination with scalar broadcast on either side.
fn broadcast(a: &[f64], b: &[f64], op: impl Fn(f64, f64) -> f64) -> Result<Vec<f64>, Error> {
    if a.len() == b.len() {
        Ok(a.iter().zip(b.iter()).map(|(x, y)| op(*x, *y)).collect())
    } else if a.len() == 1 {
        Ok(b.iter().map(|y| op(a[0], *y)).collect())
    } else if b.len() == 1 {
        Ok(a.iter().map(|x| op(*x, b[0])).collect())
    } else {
        Err(Error::domain(format!(
            "nonconformant array sizes: {} and {}",
            a.len(),
            b.len()
        )))
    }
}

macro_rules! arith_op {
    ($name:ident, $op:expr) => {
        fn $name(args: &[Value], _env: &Environment) -> Result<Value, Error> {
            let mut acc = array_cells(&args[0])?;
            for arg in &args[1..] {
                let rhs = array_cells(arg)?;
                acc = broadcast(&acc, &rhs, $op)?;
            }
            Ok(ast::array(acc))
        }
    };
}

arith_op!(fn_add, |a, b| a + b);
arith_op!(fn_sub, |a, b| a - b);
arith_op!(fn_mul, |a, b| a * b);
arith_op!(fn_div, |a, b| a / b);

macro_rules! compare_op {
    ($name:ident, $op:tt) => {
        fn $name(args: &[Value], _env: &Environment) -> Result<Value, Error> {
            let a = array_cells(&args[0])?;
            let b = array_cells(&args[1])?;
            let cells = broadcast(&a, &b, |x, y| if x $op y { 1.0 } else { 0.0 })?;
            Ok(ast::array(cells))
        }
    };
}

compare_op!(fn_lt, <);
compare_op!(fn_le, <=);
compare_op!(fn_gt, >);
compare_op!(fn_ge, >=);

fn fn_min(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let cells = array_cells(&args[0])?;
    cells
        .into_iter()
        .reduce(f64::min)
        .map(ast::num)
        .ok_or_else(|| Error::domain("min of an empty array"))
}

fn fn_max(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let cells = array_cells(&args[0])?;
    cells
        .into_iter()
        .reduce(f64::max)
        .map(ast::num)
        .ok_or_else(|| Error::domain("max of an empty array"))
}

fn fn_sum(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(ast::num(array_cells(&args[0])?.iter().sum()))
}

fn fn_size(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(ast::num(array_cells(&args[0])?.len() as f64))
}

macro_rules! elementwise_unary {
    ($(($name:ident, $method:path)),+ $(,)?) => {
        $(
            fn $name(args: &[Value], _env: &Environment) -> Result<Value, Error> {
                let cells = array_cells(&args[0])?;
                Ok(ast::array(cells.into_iter().map($method).collect()))
            }
        )+
    };
}

elementwise_unary!(
    (fn_sqrt, f64::sqrt),
    (fn_sin, f64::sin),
    (fn_cos, f64::cos),
    (fn_tan, f64::tan),
    (fn_asin, f64::asin),
    (fn_acos, f64::acos),
    (fn_atan, f64::atan),
    (fn_sinh, f64::sinh),
    (fn_cosh, f64::cosh),
    (fn_tanh, f64::tanh),
    (fn_log, f64::ln),
    (fn_log10, f64::log10),
    (fn_exp, f64::exp),
    (fn_abs, f64::abs),
);

/// One array in, one array out; several in, a list of arrays out.
fn per_argument(args: &[Value], op: impl Fn(f64) -> f64) -> Result<Value, Error> {
    let mut results = Vec::with_capacity(args.len());
    for arg in args {
        let cells = array_cells(arg)?;
        results.push(ast::array(cells.into_iter().map(&op).collect()));
    }
    if results.len() == 1 {
        Ok(results.remove(0))
    } else {
        Ok(ast::list(results))
    }
}

fn fn_neg(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    per_argument(args, |x| -x)
}

fn fn_floor(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    per_argument(args, f64::floor)
}

fn fn_slice(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let cells = array_cells(&args[0])?;
    let start = checked_index(&args[1], "start")?;
    let count = checked_index(&args[2], "length")?;
    let stride = stride_of(args, 3)?;
    let indices = strided_indices(start, count, stride, cells.len(), false)?;
    Ok(ast::array(indices.iter().map(|i| cells[*i]).collect()))
}

fn fn_assign(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    // Copy the source first: destination and source may share a payload.
    let source = array_cells(&args[1])?;
    {
        let mut cells = write_lock(args[0].as_array()?);
        let start = checked_index(&args[2], "start")?;
        let count = checked_index(&args[3], "length")?;
        let stride = stride_of(args, 4)?;
        if source.len() < count {
            return Err(Error::domain(format!(
                "assign source holds {} element(s), need {count}",
                source.len()
            )));
        }
        let indices = strided_indices(start, count, stride, cells.len(), false)?;
        for (k, i) in indices.into_iter().enumerate() {
            cells[i] = source[k];
        }
    }
    Ok(args[0].clone())
}

//
// String operations
//

/// One `str` subcommand: name, argument count after the command symbol,
/// and the implementation over those arguments.
struct StrCmd {
    name: &'static str,
    args: usize,
    run: fn(&[Value]) -> Result<Value, Error>,
}

static STR_CMDS: LazyLock<HashMap<&'static str, StrCmd>> = LazyLock::new(|| {
    [
        StrCmd { name: "length", args: 1, run: str_length },
        StrCmd { name: "find", args: 2, run: str_find },
        StrCmd { name: "range", args: 3, run: str_range },
        StrCmd { name: "replace", args: 3, run: str_replace },
        StrCmd { name: "split", args: 2, run: str_split },
        StrCmd { name: "regex", args: 2, run: str_regex },
    ]
    .into_iter()
    .map(|cmd| (cmd.name, cmd))
    .collect()
});

/// Dispatch `(str 'cmd ...)` through the subcommand table.
fn fn_str(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let name = args[0].as_symbol()?;
    let Some(cmd) = STR_CMDS.get(name.as_ref()) else {
        return Err(Error::domain(format!("unknown string operation: {name}")));
    };
    let rest = &args[1..];
    if rest.len() != cmd.args {
        return Err(Error::arity(format!(
            "str {} expects {} argument(s), got {}",
            cmd.name,
            cmd.args,
            rest.len()
        )));
    }
    (cmd.run)(rest)
}

fn str_length(args: &[Value]) -> Result<Value, Error> {
    Ok(ast::num(args[0].as_text()?.chars().count() as f64))
}

fn str_find(args: &[Value]) -> Result<Value, Error> {
    let s = args[0].as_text()?;
    let needle = args[1].as_text()?;
    match s.find(needle.as_ref()) {
        Some(byte) => Ok(ast::num(s[..byte].chars().count() as f64)),
        None => Ok(ast::num(-1.0)),
    }
}

fn str_range(args: &[Value]) -> Result<Value, Error> {
    let s = args[0].as_text()?;
    let start = checked_index(&args[1], "start")?;
    let count = checked_index(&args[2], "length")?;
    let out: String = s.chars().skip(start).take(count).collect();
    Ok(ast::text(&out))
}

fn str_replace(args: &[Value]) -> Result<Value, Error> {
    let s = args[0].as_text()?;
    let from = args[1].as_text()?;
    let to = args[2].as_text()?;
    if from.is_empty() {
        return Err(Error::domain("str replace needle must not be empty"));
    }
    Ok(ast::text(&s.replace(from.as_ref(), to)))
}

fn str_split(args: &[Value]) -> Result<Value, Error> {
    let s = args[0].as_text()?;
    let sep = args[1].as_text()?;
    if sep.is_empty() {
        return Err(Error::domain("str split separator must not be empty"));
    }
    Ok(ast::list(s.split(sep.as_ref()).map(ast::text).collect()))
}

fn str_regex(args: &[Value]) -> Result<Value, Error> {
    let s = args[0].as_text()?;
    let pattern = args[1].as_text()?;
    let re = Regex::new(pattern).map_err(|err| Error::domain(format!("invalid regex: {err}")))?;
    Ok(ast::list(
        re.find_iter(s).map(|m| ast::text(m.as_str())).collect(),
    ))
}

//
// I/O and host operations
//

fn fn_display(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let line = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(ast::nil())
}

fn fn_save(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let path = args[0].as_text()?;
    let mut file = std::fs::File::create(path.as_ref())
        .map_err(|err| Error::io(format!("cannot open {path}: {err}")))?;
    for value in &args[1..] {
        writeln!(file, "{}", WriteForm(value))
            .map_err(|err| Error::io(format!("cannot write {path}: {err}")))?;
    }
    Ok(ast::nil())
}

fn fn_read(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    match args {
        [] => {
            let mut reader = reader::Reader::new(std::io::stdin().lock());
            Ok(reader.next_form()?.unwrap_or_else(ast::nil))
        }
        [path, ..] => {
            let path = path.as_text()?;
            let source = std::fs::read_to_string(path.as_ref())
                .map_err(|err| Error::io(format!("cannot open {path}: {err}")))?;
            let forms = reader::parse_all(&source).map_err(Error::from)?;
            Ok(ast::list(forms.into_iter().map(|(form, _)| form).collect()))
        }
    }
}

fn fn_load(args: &[Value], env: &Environment) -> Result<Value, Error> {
    let path = args[0].as_text()?;
    load_file(path, env)
}

/// Read and evaluate a whole file. Evaluation errors are reported with a
/// `[file:line]` tag and do not abort the rest of the file; the last
/// successful value is returned.
pub fn load_file(path: &str, env: &Environment) -> Result<Value, Error> {
    let source = std::fs::read_to_string(path)
        .map_err(|err| Error::io(format!("cannot open {path}: {err}")))?;
    let forms = match reader::parse_all(&source) {
        Ok(forms) => forms,
        Err(err) => {
            eprintln!("[{path}:{}] error: {}", err.line, err.message);
            return Ok(ast::nil());
        }
    };
    let mut last = ast::nil();
    for (form, line) in forms {
        match evaluator::eval(&form, env) {
            Ok(value) => last = value,
            Err(err) => eprintln!("[{path}:{line}] {err}"),
        }
    }
    Ok(last)
}

fn fn_exec(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let command = args[0].as_text()?;
    let status = std::process::Command::new("sh")
        .arg("-c")
        .arg(command.as_ref())
        .status()
        .map_err(|err| Error::host(format!("cannot run command: {err}")))?;
    Ok(ast::num(f64::from(status.code().unwrap_or(-1))))
}

fn fn_exit(_args: &[Value], _env: &Environment) -> Result<Value, Error> {
    std::process::exit(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{array, list, num, sym, text};
    use crate::evaluator::make_env;
    use crate::reader::parse_one;

    fn run(env: &Environment, input: &str) -> Result<Value, Error> {
        evaluator::eval(&parse_one(input).expect("test source must parse"), env)
    }

    fn run_ok(env: &Environment, input: &str) -> Value {
        run(env, input).unwrap_or_else(|err| panic!("'{input}' failed: {err}"))
    }

    #[test]
    fn test_core_registry() {
        // The name map and the table agree, and environment bindings share
        // identity with the registry entries.
        let env = make_env();
        for op in CORE_OPS.iter() {
            let found = find_op(&op.name).unwrap();
            assert_eq!(found, env.lookup(&op.name).unwrap(), "for {}", op.name);
        }
        assert!(find_op("nonesuch").is_none());

        match find_op("lreplace") {
            Some(Value::Op(op)) => {
                assert_eq!(op.min_args, 4);
                assert!(matches!(op.kind, OpKind::Native(_)));
            }
            other => panic!("expected the lreplace op, got {other:?}"),
        }
        // Special forms are registry entries like everything else.
        match find_op("if") {
            Some(Value::Op(op)) => assert!(matches!(op.kind, OpKind::Form(Form::If))),
            other => panic!("expected the if op, got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_broadcast() {
        let env = make_env();
        let cases = vec![
            ("(+ (array 1 2 3) 10)", array(vec![11.0, 12.0, 13.0])),
            ("(+ 10 (array 1 2 3))", array(vec![11.0, 12.0, 13.0])),
            ("(+ (array 1 2) (array 3 4))", array(vec![4.0, 6.0])),
            ("(- (array 5 6) 1)", array(vec![4.0, 5.0])),
            ("(* (array 1 2 3) (array 2 2 2))", array(vec![2.0, 4.0, 6.0])),
            ("(/ (array 4 9) 2)", array(vec![2.0, 4.5])),
            ("(+ 1 2 3)", num(6.0)),
            ("(- 10 3 2)", num(5.0)),
        ];
        for (input, expected) in cases {
            assert_eq!(run_ok(&env, input), expected, "for {input}");
        }
        assert!(run(&env, "(+ (array 1 2) (array 1 2 3))").is_err());
        assert!(run(&env, "(+ 1 \"x\")").is_err());
    }

    #[test]
    fn test_comparisons_yield_masks() {
        let env = make_env();
        assert_eq!(run_ok(&env, "(< 2 3)"), num(1.0));
        assert_eq!(run_ok(&env, "(>= 2 3)"), num(0.0));
        assert_eq!(
            run_ok(&env, "(< (array 1 5 3) 3)"),
            array(vec![1.0, 0.0, 0.0])
        );
        assert_eq!(
            run_ok(&env, "(<= (array 1 2) (array 1 1))"),
            array(vec![1.0, 0.0])
        );
    }

    #[test]
    fn test_reductions() {
        let env = make_env();
        assert_eq!(run_ok(&env, "(min (array 4 2 9))"), num(2.0));
        assert_eq!(run_ok(&env, "(max (array 4 2 9))"), num(9.0));
        assert_eq!(run_ok(&env, "(sum (array 1 2 3))"), num(6.0));
        assert_eq!(run_ok(&env, "(size (array 1 2 3))"), num(3.0));
        assert_eq!(run_ok(&env, "(sum (array))"), num(0.0));
        assert_eq!(run_ok(&env, "(size (array))"), num(0.0));
        assert!(run(&env, "(min (array))").is_err());
    }

    #[test]
    fn test_elementwise_unary_and_per_argument() {
        let env = make_env();
        assert_eq!(run_ok(&env, "(abs (array -1 2 -3))"), array(vec![1.0, 2.0, 3.0]));
        assert_eq!(run_ok(&env, "(sqrt 9)"), num(3.0));
        assert_eq!(run_ok(&env, "(exp 0)"), num(1.0));
        assert_eq!(run_ok(&env, "(log 1)"), num(0.0));
        assert_eq!(run_ok(&env, "(neg 2)"), num(-2.0));
        assert_eq!(
            run_ok(&env, "(neg (array 1 2) 3)"),
            list(vec![array(vec![-1.0, -2.0]), num(-3.0)])
        );
        assert_eq!(run_ok(&env, "(floor 2.7)"), num(2.0));
        assert_eq!(
            run_ok(&env, "(floor 1.5 -1.5)"),
            list(vec![num(1.0), num(-2.0)])
        );
    }

    #[test]
    fn test_slice_and_assign() {
        let env = make_env();
        assert_eq!(
            run_ok(&env, "(slice (array 0 1 2 3 4 5 6 7) 1 4 2)"),
            array(vec![1.0, 3.0, 5.0, 7.0])
        );
        assert_eq!(
            run_ok(&env, "(slice (array 0 1 2 3) 1 2)"),
            array(vec![1.0, 2.0])
        );
        assert!(run(&env, "(slice (array 0 1 2) 1 5)").is_err());
        assert!(run(&env, "(slice (array 0 1 2) 0 2 0)").is_err());

        run_ok(&env, "(def a (array 0 0 0 0))");
        let returned = run_ok(&env, "(assign a (array 5 6) 1 2)");
        assert_eq!(returned, array(vec![0.0, 5.0, 6.0, 0.0]));
        assert_eq!(run_ok(&env, "a"), array(vec![0.0, 5.0, 6.0, 0.0]));
        // strided write
        run_ok(&env, "(assign a (array 9 9) 0 2 2)");
        assert_eq!(run_ok(&env, "a"), array(vec![9.0, 5.0, 9.0, 0.0]));
        assert!(run(&env, "(assign a (array 1) 0 2)").is_err());
        assert!(run(&env, "(assign a (array 1 2) 3 2)").is_err());
    }

    #[test]
    fn test_equality_op() {
        let env = make_env();
        assert_eq!(run_ok(&env, "(== (array 1.0) (array 1.0000001))"), num(1.0));
        assert_eq!(run_ok(&env, "(== (array 1.0) (array 1.001))"), num(0.0));
        assert_eq!(run_ok(&env, "(== (list 1 2) (list 1 2))"), num(1.0));
        assert_eq!(run_ok(&env, "(== \"a\" 'a)"), num(0.0));
        assert_eq!(run_ok(&env, "(== () ())"), num(1.0));
    }

    #[test]
    fn test_list_ops_mutate_shared_payloads() {
        let env = make_env();
        run_ok(&env, "(def xs (list 10 20 30))");
        run_ok(&env, "(def ys xs)");
        assert_eq!(run_ok(&env, "(lset xs 99 1)"), run_ok(&env, "xs"));
        // destructive update is visible through the alias
        assert_eq!(
            run_ok(&env, "ys"),
            list(vec![num(10.0), num(99.0), num(30.0)])
        );
        assert_eq!(run_ok(&env, "(llength xs)"), num(3.0));
        run_ok(&env, "(lappend xs 40 50)");
        assert_eq!(run_ok(&env, "(llength ys)"), num(5.0));
        assert_eq!(run_ok(&env, "(lindex ys 4)"), num(50.0));
        assert!(run(&env, "(lindex xs 9)").is_err());
        assert!(run(&env, "(lset xs 0 9)").is_err());
    }

    #[test]
    fn test_lrange_clamps() {
        let env = make_env();
        run_ok(&env, "(def xs (list 0 1 2 3 4))");
        assert_eq!(
            run_ok(&env, "(lrange xs 1 2)"),
            list(vec![num(1.0), num(2.0)])
        );
        assert_eq!(
            run_ok(&env, "(lrange xs 1 10 2)"),
            list(vec![num(1.0), num(3.0)])
        );
        assert_eq!(run_ok(&env, "(lrange xs 9 3)"), list(vec![]));
        // the window is a copy
        run_ok(&env, "(lset (lrange xs 0 2) 7 0)");
        assert_eq!(run_ok(&env, "(lindex xs 0)"), num(0.0));
    }

    #[test]
    fn test_lreplace_overwrites_in_place() {
        let env = make_env();
        run_ok(&env, "(def xs (list 0 1 2 3 4))");
        let returned = run_ok(&env, "(lreplace xs (list 9 8) 1 2)");
        assert_eq!(returned, list(vec![num(9.0), num(8.0)]));
        assert_eq!(
            run_ok(&env, "xs"),
            list(vec![num(0.0), num(9.0), num(8.0), num(3.0), num(4.0)])
        );
        // strided, clamped to the destination length
        run_ok(&env, "(lreplace xs (list 7 7 7) 2 3 2)");
        assert_eq!(
            run_ok(&env, "xs"),
            list(vec![num(0.0), num(9.0), num(7.0), num(3.0), num(7.0)])
        );
    }

    #[test]
    fn test_lshuffle_is_a_fresh_permutation() {
        let env = make_env();
        run_ok(&env, "(def xs (list 1 2 3 4 5 6 7 8))");
        let shuffled = run_ok(&env, "(lshuffle xs)");
        // original untouched
        assert_eq!(
            run_ok(&env, "xs"),
            list((1..=8).map(|i| num(f64::from(i))).collect())
        );
        let mut cells: Vec<f64> = read_lock(shuffled.as_list().unwrap())
            .iter()
            .map(|v| v.number().unwrap())
            .collect();
        cells.sort_by(f64::total_cmp);
        assert_eq!(cells, (1..=8).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn test_array_concatenation() {
        let env = make_env();
        assert_eq!(
            run_ok(&env, "(array 1 (array 2 3) 4)"),
            array(vec![1.0, 2.0, 3.0, 4.0])
        );
        assert_eq!(run_ok(&env, "(array)"), array(vec![]));
    }

    #[test]
    fn test_type_and_env_inspection() {
        let env = make_env();
        let cases = vec![
            ("(type ())", sym("list")),
            ("(type 'x)", sym("symbol")),
            ("(type \"s\")", sym("string")),
            ("(type 1)", sym("array")),
            ("(type (\\ (x) x))", sym("lambda")),
            ("(type (macro (x) x))", sym("macro")),
            ("(type type)", sym("op")),
        ];
        for (input, expected) in cases {
            assert_eq!(run_ok(&env, input), expected, "for {input}");
        }

        run_ok(&env, "(def melody 60)");
        let names = run_ok(&env, "(env)");
        let has_melody = read_lock(names.as_list().unwrap())
            .iter()
            .any(|v| v == &sym("melody"));
        assert!(has_melody);

        let full = run_ok(&env, "(env 'full)");
        let has_pair = read_lock(full.as_list().unwrap())
            .iter()
            .any(|v| v == &list(vec![sym("melody"), num(60.0)]));
        assert!(has_pair);

        assert!(run(&env, "(env 'whatever)").is_err());
    }

    #[test]
    fn test_str_operations() {
        let env = make_env();
        let cases = vec![
            ("(str 'length \"hello\")", num(5.0)),
            ("(str 'length \"\")", num(0.0)),
            ("(str 'find \"hello world\" \"world\")", num(6.0)),
            ("(str 'find \"hello\" \"zzz\")", num(-1.0)),
            ("(str 'range \"hello world\" 6 5)", text("world")),
            ("(str 'range \"abc\" 1 99)", text("bc")),
            ("(str 'replace \"a-b-c\" \"-\" \"+\")", text("a+b+c")),
            (
                "(str 'split \"do:re:mi\" \":\")",
                list(vec![text("do"), text("re"), text("mi")]),
            ),
            (
                "(str 'regex \"ab12cd345\" \"[0-9]+\")",
                list(vec![text("12"), text("345")]),
            ),
            ("(str 'regex \"abc\" \"[0-9]+\")", list(vec![])),
        ];
        for (input, expected) in cases {
            assert_eq!(run_ok(&env, input), expected, "for {input}");
        }
        assert!(run(&env, "(str 'regex \"abc\" \"[\")").is_err());
        assert!(run(&env, "(str 'nope \"abc\")").is_err());
        assert!(run(&env, "(str 'length 5)").is_err());
    }

    #[test]
    fn test_exec_reports_exit_status() {
        let env = make_env();
        assert_eq!(run_ok(&env, "(exec \"true\")"), num(0.0));
        assert_eq!(run_ok(&env, "(exec \"exit 3\")"), num(3.0));
    }

    #[test]
    fn test_save_and_read_round_trip() {
        let env = make_env();
        let path = std::env::temp_dir().join(format!("tactus-save-{}.tac", std::process::id()));
        let path_str = path.to_string_lossy().to_string();
        run_ok(
            &env,
            &format!("(save \"{path_str}\" (list 1 2) 'tempo \"raw text\")"),
        );
        let forms = run_ok(&env, &format!("(read \"{path_str}\")"));
        assert_eq!(
            forms,
            list(vec![
                list(vec![num(1.0), num(2.0)]),
                sym("tempo"),
                text("raw text"),
            ])
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_evaluates_and_traps_per_form() {
        let env = make_env();
        let path = std::env::temp_dir().join(format!("tactus-load-{}.tac", std::process::id()));
        std::fs::write(
            &path,
            "(def a 1)\n(lindex (list 1) 99)\n(def b (+ a 1))\n(+ a b)\n",
        )
        .unwrap();
        let last = load_file(&path.to_string_lossy(), &env).unwrap();
        // the bad middle form was reported but did not abort the load
        assert_eq!(last, num(3.0));
        assert_eq!(run_ok(&env, "a"), num(1.0));
        assert_eq!(run_ok(&env, "b"), num(2.0));
        let _ = std::fs::remove_file(&path);

        assert!(load_file("/no/such/tactus/file.tac", &env).is_err());
    }

    #[test]
    fn test_display_returns_nil() {
        let env = make_env();
        assert!(run_ok(&env, "(display \"ping\" 1)").is_nil());
    }

    #[test]
    fn test_min_args_enforced() {
        let env = make_env();
        for input in ["(lindex (list 1))", "(lset (list 1) 2)", "(slice 1 2)", "(str 'length)"] {
            let err = run(&env, input).unwrap_err();
            assert_eq!(err.kind, crate::ErrorKind::Arity, "for {input}");
        }
    }
}
