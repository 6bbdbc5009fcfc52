//! Environments and the evaluation loop.
//!
//! An [`Environment`] is a chain of frames, each holding `(symbol, value)`
//! bindings scanned front-to-back (first occurrence wins) before deferring
//! to the parent. `def` stays local, `=` walks up.
//!
//! [`eval`] is a single dispatch loop with an explicit trampoline: tail
//! positions (`if` branches, the last expression of `begin` and of lambda
//! bodies, `eval`'s inner step, `apply`, macro re-dispatch) rewrite the
//! current `(node, env)` pair and continue in the same activation, so tail
//! recursion runs in constant stack. A per-thread stack of the forms under
//! evaluation is maintained for diagnostics and attached to errors on the
//! way out.
//!
//! Special forms are recognized by the op identity carried in the resolved
//! head value - not by name - so rebinding `(def when if)` keeps working.

use crate::ast::{self, Closure, Value, read_lock, write_lock};
use crate::builtinops::{self, Form, NativeFn, OpDef, OpKind};
use crate::scheduler;
use crate::{Error, MAX_CALL_DEPTH};
use std::cell::RefCell;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// A shared handle to one frame of the environment chain.
#[derive(Clone)]
pub struct Environment(Arc<RwLock<Frame>>);

struct Frame {
    parent: Option<Environment>,
    bindings: Vec<(Arc<str>, Value)>,
}

impl Environment {
    /// Fresh frame with no parent. Most callers want [`make_env`], which
    /// also installs the core primitives.
    pub fn root() -> Self {
        Environment(Arc::new(RwLock::new(Frame {
            parent: None,
            bindings: Vec::new(),
        })))
    }

    pub fn child_of(parent: &Environment) -> Self {
        Environment(Arc::new(RwLock::new(Frame {
            parent: Some(parent.clone()),
            bindings: Vec::new(),
        })))
    }

    /// Capture for a closure: a snapshot of the current frame's bindings
    /// (handles, not copies) chained onto the live frame itself. Symbols
    /// bound now keep resolving to their values at capture time even if
    /// later redefined; symbols defined only afterwards - a function's own
    /// name during `(def f (\ ...))` in particular - resolve through the
    /// live parent, so self-recursion works.
    pub(crate) fn capture(&self) -> Environment {
        let bindings = read_lock(&self.0).bindings.clone();
        Environment(Arc::new(RwLock::new(Frame {
            parent: Some(self.clone()),
            bindings,
        })))
    }

    /// Resolve a symbol: scan the current frame, then the parents.
    pub fn lookup(&self, name: &str) -> Result<Value, Error> {
        let mut current = Some(self.clone());
        while let Some(env) = current {
            let frame = read_lock(&env.0);
            for (bound, value) in &frame.bindings {
                if bound.as_ref() == name {
                    return Ok(value.clone());
                }
            }
            let parent = frame.parent.clone();
            drop(frame);
            current = parent;
        }
        Err(Error::unbound(name))
    }

    /// Bind in the current frame, overwriting an existing local binding.
    pub fn define(&self, name: &str, value: Value) {
        let mut frame = write_lock(&self.0);
        for slot in frame.bindings.iter_mut() {
            if slot.0.as_ref() == name {
                slot.1 = value;
                return;
            }
        }
        frame.bindings.push((Arc::from(name), value));
    }

    fn define_shared(&self, name: Arc<str>, value: Value) {
        let mut frame = write_lock(&self.0);
        for slot in frame.bindings.iter_mut() {
            if slot.0 == name {
                slot.1 = value;
                return;
            }
        }
        frame.bindings.push((name, value));
    }

    /// Overwrite the nearest existing binding, walking up the chain.
    pub fn assign(&self, name: &str, value: Value) -> Result<(), Error> {
        let mut current = Some(self.clone());
        while let Some(env) = current {
            let mut frame = write_lock(&env.0);
            for slot in frame.bindings.iter_mut() {
                if slot.0.as_ref() == name {
                    slot.1 = value;
                    return Ok(());
                }
            }
            let parent = frame.parent.clone();
            drop(frame);
            current = parent;
        }
        Err(Error::unbound(name))
    }

    /// Add a host primitive; the surface consumed by extensions.
    pub fn register_op(&self, name: &str, op: NativeFn, min_args: usize) {
        self.define(
            name,
            Value::Op(Arc::new(OpDef {
                name: name.to_owned(),
                kind: OpKind::Native(op),
                min_args,
            })),
        );
    }

    /// Symbols bound in this frame only (the `env` primitive, no argument).
    pub(crate) fn local_symbols(&self) -> Vec<Value> {
        read_lock(&self.0)
            .bindings
            .iter()
            .map(|(name, _)| Value::Symbol(name.clone()))
            .collect()
    }

    /// Every `(symbol value)` pair in the chain, current frame first
    /// (the `env` primitive with `full`).
    pub(crate) fn all_bindings(&self) -> Vec<Value> {
        let mut out = Vec::new();
        let mut current = Some(self.clone());
        while let Some(env) = current {
            let frame = read_lock(&env.0);
            for (name, value) in &frame.bindings {
                out.push(ast::list(vec![Value::Symbol(name.clone()), value.clone()]));
            }
            let parent = frame.parent.clone();
            drop(frame);
            current = parent;
        }
        out
    }
}

/// Root environment with every core primitive registered.
pub fn make_env() -> Environment {
    let env = Environment::root();
    builtinops::install(&env);
    env
}

// Per-thread stack of the forms currently under evaluation, outermost first.
// Pushed on entry to eval, popped on every exit path via the slot guard.
thread_local! {
    static CALL_STACK: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
}

struct StackSlot {
    index: usize,
}

impl StackSlot {
    fn push(node: &Value) -> StackSlot {
        CALL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(node.clone());
            StackSlot {
                index: stack.len() - 1,
            }
        })
    }

    /// Tail rewrite: the activation stays, the form it is reducing changes.
    fn set(&self, node: &Value) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut()[self.index] = node.clone();
        });
    }
}

impl Drop for StackSlot {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut().truncate(self.index);
        });
    }
}

fn stack_snapshot() -> Vec<String> {
    CALL_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .map(|form| form.to_string())
            .collect()
    })
}

/// Either a finished value or a tail rewrite for the trampoline.
enum Flow {
    Done(Value),
    Tail(Value, Environment),
}

/// Evaluate a form.
pub fn eval(expr: &Value, env: &Environment) -> Result<Value, Error> {
    let slot = StackSlot::push(expr);
    if slot.index >= MAX_CALL_DEPTH {
        return Err(Error::domain(format!(
            "evaluation nested deeper than {MAX_CALL_DEPTH}"
        )));
    }
    let mut node = expr.clone();
    let mut env = env.clone();
    match eval_loop(&mut node, &mut env, &slot) {
        Ok(value) => Ok(value),
        Err(err) if err.form.is_none() => {
            Err(err.with_context(node.to_string(), stack_snapshot()))
        }
        Err(err) => Err(err),
    }
}

fn eval_loop(node: &mut Value, env: &mut Environment, slot: &StackSlot) -> Result<Value, Error> {
    loop {
        slot.set(node);
        match node.clone() {
            Value::Symbol(name) => return env.lookup(&name),
            Value::List(items) => {
                let items: Vec<Value> = read_lock(&items).clone();
                if items.is_empty() {
                    // nil evaluates to itself
                    return Ok(node.clone());
                }
                let head = eval(&items[0], env)?;
                let flow = match head {
                    Value::Op(op) => match op.kind {
                        OpKind::Form(special) => dispatch_form(special, &items[1..], env)?,
                        OpKind::Native(f) => {
                            let args = eval_args(&items[1..], env)?;
                            if args.len() < op.min_args {
                                return Err(Error::arity(format!(
                                    "too few arguments to {}: expected at least {}, got {}",
                                    op.name,
                                    op.min_args,
                                    args.len()
                                )));
                            }
                            Flow::Done(f(&args, env)?)
                        }
                    },
                    Value::Lambda(closure) => {
                        let args = eval_args(&items[1..], env)?;
                        apply_lambda(&closure, args)?
                    }
                    Value::Macro(closure) => {
                        let (expansion, macro_env) = expand_macro(&closure, &items[1..])?;
                        Flow::Tail(expansion, macro_env)
                    }
                    other => {
                        return Err(Error::type_error(format!(
                            "cannot apply {}",
                            other.type_name()
                        )));
                    }
                };
                match flow {
                    Flow::Done(value) => return Ok(value),
                    Flow::Tail(next, next_env) => {
                        *node = next;
                        *env = next_env;
                    }
                }
            }
            other => return Ok(other),
        }
    }
}

fn eval_args(exprs: &[Value], env: &Environment) -> Result<Vec<Value>, Error> {
    exprs.iter().map(|expr| eval(expr, env)).collect()
}

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), Error> {
    if args.len() != count {
        return Err(Error::arity(format!(
            "{name} expects {count} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

/// An array value is false iff its first element is 0.
fn truthy(value: &Value) -> Result<bool, Error> {
    let cells = read_lock(value.as_array()?);
    match cells.first() {
        Some(x) => Ok(*x != 0.0),
        None => Err(Error::domain("empty array used as a condition")),
    }
}

fn param_list(form: &Value) -> Result<Vec<Arc<str>>, Error> {
    read_lock(form.as_list()?)
        .iter()
        .map(|item| Ok(item.as_symbol()?.clone()))
        .collect()
}

fn dispatch_form(special: Form, args: &[Value], env: &Environment) -> Result<Flow, Error> {
    match special {
        Form::Quote => {
            expect_args("quote", args, 1)?;
            Ok(Flow::Done(args[0].clone()))
        }
        Form::Def => {
            expect_args("def", args, 2)?;
            let name = args[0].as_symbol()?.clone();
            let value = eval(&args[1], env)?;
            env.define_shared(name, value.clone());
            Ok(Flow::Done(value))
        }
        Form::Assign => {
            expect_args("=", args, 2)?;
            let name = args[0].as_symbol()?;
            let value = eval(&args[1], env)?;
            env.assign(name, value.clone())?;
            Ok(Flow::Done(value))
        }
        Form::Lambda | Form::Macro => {
            if args.len() < 2 {
                return Err(Error::arity(
                    "closure definition needs a parameter list and a body",
                ));
            }
            let closure = Arc::new(Closure {
                params: param_list(&args[0])?,
                body: args[1..].to_vec(),
                env: env.capture(),
            });
            Ok(Flow::Done(if special == Form::Lambda {
                Value::Lambda(closure)
            } else {
                Value::Macro(closure)
            }))
        }
        Form::If => {
            if args.len() != 2 && args.len() != 3 {
                return Err(Error::arity(format!(
                    "if expects 2 or 3 arguments, got {}",
                    args.len()
                )));
            }
            let test = eval(&args[0], env)?;
            if truthy(&test)? {
                Ok(Flow::Tail(args[1].clone(), env.clone()))
            } else if args.len() == 3 {
                Ok(Flow::Tail(args[2].clone(), env.clone()))
            } else {
                Ok(Flow::Done(ast::nil()))
            }
        }
        Form::While => {
            expect_args("while", args, 2)?;
            let mut last = None;
            loop {
                let test = eval(&args[0], env)?;
                if !truthy(&test)? {
                    return Ok(Flow::Done(last.unwrap_or_else(ast::nil)));
                }
                last = Some(eval(&args[1], env)?);
            }
        }
        Form::Begin => match args {
            [] => Ok(Flow::Done(ast::nil())),
            [init @ .., last] => {
                for expr in init {
                    eval(expr, env)?;
                }
                Ok(Flow::Tail(last.clone(), env.clone()))
            }
        },
        Form::Eval => {
            expect_args("eval", args, 1)?;
            let once = eval(&args[0], env)?;
            Ok(Flow::Tail(once, env.clone()))
        }
        Form::Apply => {
            expect_args("apply", args, 2)?;
            let target = eval(&args[0], env)?;
            let arg_list = eval(&args[1], env)?;
            let argv: Vec<Value> = read_lock(arg_list.as_list()?).clone();
            apply_value(&target, argv, env)
        }
        Form::Schedule => {
            expect_args("schedule", args, 3)?;
            let delay = eval(&args[1], env)?.number()?;
            if !delay.is_finite() || delay < 0.0 {
                return Err(Error::domain(
                    "schedule delay must be a non-negative number of milliseconds",
                ));
            }
            let background = eval(&args[2], env)?.number()? != 0.0;
            let task = args[0].clone();
            scheduler::schedule(task, Duration::from_millis(delay as u64), background, env)
                .map(Flow::Done)
        }
    }
}

/// Call a value with an already-produced argument list (`apply`).
fn apply_value(target: &Value, args: Vec<Value>, env: &Environment) -> Result<Flow, Error> {
    match target {
        Value::Lambda(closure) => apply_lambda(closure, args),
        Value::Op(op) => match op.kind {
            OpKind::Native(f) => {
                if args.len() < op.min_args {
                    return Err(Error::arity(format!(
                        "too few arguments to {}: expected at least {}, got {}",
                        op.name,
                        op.min_args,
                        args.len()
                    )));
                }
                f(&args, env).map(Flow::Done)
            }
            OpKind::Form(_) => Err(Error::type_error(format!(
                "cannot apply special form {}",
                op.name
            ))),
        },
        other => Err(Error::type_error(format!(
            "cannot apply {}",
            other.type_name()
        ))),
    }
}

fn apply_lambda(closure: &Closure, args: Vec<Value>) -> Result<Flow, Error> {
    if args.len() > closure.params.len() {
        return Err(Error::arity(format!(
            "too many arguments to lambda: expected {}, got {}",
            closure.params.len(),
            args.len()
        )));
    }
    let frame = Environment::child_of(&closure.env);
    for (param, arg) in closure.params.iter().zip(args.iter()) {
        frame.define_shared(param.clone(), arg.clone());
    }
    if args.len() < closure.params.len() {
        // Partial application: the unbound parameter tail over a frame
        // holding the supplied bindings.
        return Ok(Flow::Done(Value::Lambda(Arc::new(Closure {
            params: closure.params[args.len()..].to_vec(),
            body: closure.body.clone(),
            env: frame,
        }))));
    }
    let Some((last, init)) = closure.body.split_last() else {
        return Ok(Flow::Done(ast::nil()));
    };
    for expr in init {
        eval(expr, &frame)?;
    }
    Ok(Flow::Tail(last.clone(), frame))
}

/// Bind raw argument forms, run the body (each result is evaluated again in
/// the macro frame), and hand the final expansion back for tail dispatch.
fn expand_macro(closure: &Closure, raw_args: &[Value]) -> Result<(Value, Environment), Error> {
    if raw_args.len() != closure.params.len() {
        return Err(Error::arity(format!(
            "macro expects {} argument(s), got {}",
            closure.params.len(),
            raw_args.len()
        )));
    }
    let frame = Environment::child_of(&closure.env);
    for (param, arg) in closure.params.iter().zip(raw_args.iter()) {
        frame.define_shared(param.clone(), arg.clone());
    }
    let Some((last, init)) = closure.body.split_last() else {
        return Ok((ast::nil(), frame));
    };
    for expr in init {
        let produced = eval(expr, &frame)?;
        eval(&produced, &frame)?;
    }
    let expansion = eval(last, &frame)?;
    Ok((expansion, frame))
}
