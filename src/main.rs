//! CLI driver: evaluate files, then optionally (or by default) run a REPL.
//!
//! `tactus [-i] [file...]` - with no files, print a banner and read forms
//! interactively; with files, load each in order (warning and continuing if
//! one cannot be opened) and keep the REPL open afterwards when `-i` was
//! given. Each top-level form runs under the evaluation gate so scheduled
//! background tasks interleave only between forms.

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tactus::builtinops::load_file;
use tactus::evaluator::{self, Environment};
use tactus::reader::{self, ParseError, ParseErrorKind};
use tactus::scheduler;
use tactus::{Error, ErrorKind};

fn main() {
    let mut interactive = false;
    let mut files = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "-i" {
            interactive = true;
        } else if arg.starts_with('-') {
            eprintln!("usage: tactus [-i] [file...]");
            std::process::exit(1);
        } else {
            files.push(arg);
        }
    }

    let env = evaluator::make_env();

    if files.is_empty() {
        banner();
        repl(&env);
        return;
    }

    for file in &files {
        match scheduler::run_exclusive(|| load_file(file, &env)) {
            Ok(_) => {}
            Err(err) if err.kind == ErrorKind::Io => {
                eprintln!("warning: cannot open input file {file}");
            }
            Err(err) => eprintln!("{err}"),
        }
    }
    if interactive {
        repl(&env);
    }
}

fn banner() {
    println!("[tactus, version {}]", env!("CARGO_PKG_VERSION"));
    println!();
    println!("music scripting language");
    println!();
}

fn repl(env: &Environment) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => {
            eprintln!("error: cannot start line editor: {err}");
            std::process::exit(1);
        }
    };
    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { ">> " } else { ".. " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() && line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line.trim_end());
                pending.push_str(&line);
                pending.push('\n');
                drain_forms(&mut pending, env);
            }
            Err(ReadlineError::Interrupted) => pending.clear(),
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("error: {err}");
                break;
            }
        }
    }
}

enum Step {
    Run(tactus::ast::Value, usize),
    Drained,
    KeepReading,
    Bad(ParseError),
}

/// Evaluate every complete form buffered so far, printing results; leave
/// the remainder in place while the trailing form is still open.
fn drain_forms(pending: &mut String, env: &Environment) {
    loop {
        let step = match reader::parse_next(pending) {
            Ok(Some((form, rest))) => Step::Run(form, pending.len() - rest.len()),
            Ok(None) => Step::Drained,
            Err(err) if err.kind == ParseErrorKind::Incomplete => Step::KeepReading,
            Err(err) => Step::Bad(err),
        };
        match step {
            Step::Run(form, consumed) => {
                pending.drain(..consumed);
                match scheduler::run_exclusive(|| evaluator::eval(&form, env)) {
                    Ok(value) => println!("{value}"),
                    Err(err) => eprintln!("{err}"),
                }
            }
            Step::Drained => {
                pending.clear();
                return;
            }
            Step::KeepReading => return,
            Step::Bad(err) => {
                eprintln!("{}", Error::from(err));
                pending.clear();
                return;
            }
        }
    }
}
