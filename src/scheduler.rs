//! Deferred evaluation behind the `schedule` form.
//!
//! The inline branch simply sleeps on the calling thread and evaluates the
//! task in place. The background branch hands `(deadline, form, env)` to a
//! single detached worker draining a deadline-ordered queue, so background
//! tasks serialize with each other in due order. Each task additionally
//! takes the process-wide evaluation gate - the same gate the REPL and file
//! drivers hold per top-level form - so background work observes the
//! environment only between driver steps. Task failures are reported on
//! stderr and never kill the worker.
//!
//! There is no cancellation: once armed, a task runs.

use crate::Error;
use crate::ast::{self, Value};
use crate::evaluator::{self, Environment};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

static GATE: Mutex<()> = Mutex::new(());

/// Run `f` while holding the process-wide evaluation gate. Top-level
/// drivers wrap each form in this so scheduled tasks interleave only at
/// form boundaries.
pub fn run_exclusive<T>(f: impl FnOnce() -> T) -> T {
    let _guard = GATE.lock().unwrap_or_else(PoisonError::into_inner);
    f()
}

struct Job {
    due: Instant,
    seq: u64,
    form: Value,
    env: Environment,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // Deadline order; enqueue order breaks ties.
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

static WORKER: LazyLock<Sender<Job>> = LazyLock::new(|| {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || drain(rx));
    tx
});

fn drain(rx: mpsc::Receiver<Job>) {
    let mut pending: BinaryHeap<Reverse<Job>> = BinaryHeap::new();
    loop {
        let wait = pending
            .peek()
            .map(|Reverse(job)| job.due.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::from_secs(86_400));
        match rx.recv_timeout(wait) {
            Ok(job) => pending.push(Reverse(job)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        while pending
            .peek()
            .is_some_and(|Reverse(job)| job.due <= Instant::now())
        {
            if let Some(Reverse(job)) = pending.pop() {
                let result = run_exclusive(|| evaluator::eval(&job.form, &job.env));
                if let Err(err) = result {
                    eprintln!("{err}");
                }
            }
        }
    }
}

/// Defer evaluation of `task`. With `background` false the calling thread
/// sleeps for `delay` and evaluates inline (task errors propagate); with
/// `background` true the task is enqueued and `1` returns immediately.
pub fn schedule(
    task: Value,
    delay: Duration,
    background: bool,
    env: &Environment,
) -> Result<Value, Error> {
    if background {
        let job = Job {
            due: Instant::now() + delay,
            seq: NEXT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            form: task,
            env: env.clone(),
        };
        WORKER
            .send(job)
            .map_err(|_| Error::host("scheduler worker is gone"))?;
        return Ok(ast::num(1.0));
    }
    thread::sleep(delay);
    evaluator::eval(&task, env)?;
    Ok(ast::num(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{list, num};
    use crate::evaluator::make_env;
    use crate::reader::parse_one;

    fn run(env: &Environment, input: &str) -> Result<Value, Error> {
        evaluator::eval(&parse_one(input).expect("test source must parse"), env)
    }

    #[test]
    fn test_inline_schedule_blocks_for_the_delay() {
        let env = make_env();
        let started = Instant::now();
        let result = run(&env, "(schedule (def inline-flag 5) 40 0)").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(result, num(1.0));
        assert_eq!(run(&env, "inline-flag").unwrap(), num(5.0));
    }

    #[test]
    fn test_inline_schedule_propagates_task_errors() {
        let env = make_env();
        assert!(run(&env, "(schedule (lindex (list) 0) 1 0)").is_err());
    }

    #[test]
    fn test_background_schedule_returns_immediately() {
        let env = make_env();
        let started = Instant::now();
        let result = run(&env, "(schedule (def background-flag 7) 80 1)").unwrap();
        assert!(started.elapsed() < Duration::from_millis(80));
        assert_eq!(result, num(1.0));
        // Not yet run...
        assert!(run(&env, "background-flag").is_err());
        // ...but it is after the deadline.
        thread::sleep(Duration::from_millis(400));
        assert_eq!(run(&env, "background-flag").unwrap(), num(7.0));
    }

    #[test]
    fn test_background_tasks_run_in_deadline_order() {
        let env = make_env();
        run(&env, "(def order (list))").unwrap();
        run(&env, "(schedule (lappend order 2) 120 1)").unwrap();
        run(&env, "(schedule (lappend order 1) 30 1)").unwrap();
        thread::sleep(Duration::from_millis(500));
        assert_eq!(
            run(&env, "order").unwrap(),
            list(vec![num(1.0), num(2.0)])
        );
    }

    #[test]
    fn test_delay_validation() {
        let env = make_env();
        assert!(run(&env, "(schedule (display 1) -5 0)").is_err());
        assert!(run(&env, "(schedule (display 1) 0 \"s\")").is_err());
    }
}
