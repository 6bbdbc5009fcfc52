//! Reader: source text -> `Value` forms.
//!
//! Tokens are delimited only by whitespace, parentheses, the quote mark,
//! double quotes and `;` (which starts a line comment). A token whose whole
//! lexeme parses as an `f64` becomes a length-1 array; everything else is a
//! symbol. `'X` is sugar for `(quote X)`. Strings decode the `\n` `\r` `\t`
//! `\"` escapes; any other escaped character passes through unchanged.
//!
//! Three entry points: [`parse_next`] yields one top-level form and the rest
//! of the input, [`parse_all`] yields every form together with its starting
//! line (used by `load` diagnostics), and [`Reader`] drives an arbitrary
//! `BufRead`, growing its buffer until a form is complete - unfinished lists
//! and strings are reported as [`ParseErrorKind::Incomplete`] so interactive
//! drivers know to keep reading.

use nom::{
    IResult, Needed, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::char,
    error::ErrorKind,
};
use std::io::BufRead;

use crate::Error;
use crate::ast::{self, Value};

/// Maximum nesting accepted by the reader.
pub const MAX_PARSE_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Bad token or malformed structure.
    InvalidSyntax,
    /// Input ended before the form was complete (unclosed list or string);
    /// interactive drivers should supply more input and retry.
    Incomplete,
    /// Nesting exceeded [`MAX_PARSE_DEPTH`].
    TooDeeplyNested,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// 1-based line within the parsed input.
    pub line: usize,
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::parse(format!("line {}: {}", err.line, err.message))
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '"' | ';')
}

/// Skip whitespace and `;` line comments.
fn skip_ws(mut input: &str) -> &str {
    loop {
        let trimmed = input.trim_start();
        if let Some(comment) = trimmed.strip_prefix(';') {
            input = match comment.split_once('\n') {
                Some((_, after)) => after,
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

fn parse_form(input: &str, depth: usize) -> IResult<&str, Value> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            ErrorKind::TooLarge,
        )));
    }
    let input = skip_ws(input);
    if input.is_empty() {
        return Err(nom::Err::Incomplete(Needed::Unknown));
    }
    alt((
        |i| parse_quote(i, depth),
        |i| parse_list(i, depth),
        parse_string,
        parse_token,
    ))
    .parse(input)
}

/// `'x` reads as `(quote x)`.
fn parse_quote(input: &str, depth: usize) -> IResult<&str, Value> {
    let (input, _) = char('\'').parse(input)?;
    let (input, inner) = parse_form(input, depth + 1)?;
    Ok((input, ast::list(vec![ast::sym("quote"), inner])))
}

fn parse_list(input: &str, depth: usize) -> IResult<&str, Value> {
    let (mut input, _) = char('(').parse(input)?;
    let mut items = Vec::new();
    loop {
        input = skip_ws(input);
        if input.is_empty() {
            return Err(nom::Err::Incomplete(Needed::Unknown));
        }
        if let Some(rest) = input.strip_prefix(')') {
            return Ok((rest, ast::list(items)));
        }
        let (rest, item) = parse_form(input, depth + 1)?;
        items.push(item);
        input = rest;
    }
}

fn parse_string(input: &str) -> IResult<&str, Value> {
    let (start, _) = char('"').parse(input)?;
    let mut decoded = String::new();
    let mut chars = start.chars();
    loop {
        match chars.next() {
            Some('"') => return Ok((chars.as_str(), ast::text(&decoded))),
            Some('\\') => match chars.next() {
                Some('n') => decoded.push('\n'),
                Some('r') => decoded.push('\r'),
                Some('t') => decoded.push('\t'),
                Some('"') => decoded.push('"'),
                // Unknown escapes pass the escaped character through.
                Some(other) => decoded.push(other),
                None => return Err(nom::Err::Incomplete(Needed::Unknown)),
            },
            Some(ch) => decoded.push(ch),
            None => return Err(nom::Err::Incomplete(Needed::Unknown)),
        }
    }
}

/// Any run of non-delimiter bytes. A lexeme that parses wholly as a double
/// is a scalar array; everything else is a symbol (so `1-2` is one symbol
/// and `-5` is a number).
fn parse_token(input: &str) -> IResult<&str, Value> {
    let (rest, lexeme) = take_while1(|c: char| !is_delimiter(c)).parse(input)?;
    match lexeme.parse::<f64>() {
        Ok(x) => Ok((rest, ast::num(x))),
        Err(_) => Ok((rest, ast::sym(lexeme))),
    }
}

fn line_at(full: &str, offset: usize) -> usize {
    1 + full[..offset.min(full.len())].matches('\n').count()
}

fn classify(full: &str, err: nom::Err<nom::error::Error<&str>>) -> ParseError {
    match err {
        nom::Err::Incomplete(_) => ParseError {
            kind: ParseErrorKind::Incomplete,
            message: "unexpected end of input inside a form".to_owned(),
            line: line_at(full, full.len()),
        },
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let offset = full.len().saturating_sub(e.input.len());
            if e.code == ErrorKind::TooLarge {
                ParseError {
                    kind: ParseErrorKind::TooDeeplyNested,
                    message: format!("form nested deeper than {MAX_PARSE_DEPTH}"),
                    line: line_at(full, offset),
                }
            } else {
                let near: String = e.input.chars().take(16).collect();
                ParseError {
                    kind: ParseErrorKind::InvalidSyntax,
                    message: if near.is_empty() {
                        "invalid syntax".to_owned()
                    } else {
                        format!("invalid syntax near '{near}'")
                    },
                    line: line_at(full, offset),
                }
            }
        }
    }
}

/// Parse the next top-level form. Returns `Ok(None)` when the input holds
/// nothing but whitespace and comments.
pub fn parse_next(input: &str) -> Result<Option<(Value, &str)>, ParseError> {
    let at = skip_ws(input);
    if at.is_empty() {
        return Ok(None);
    }
    match parse_form(at, 0) {
        Ok((rest, value)) => Ok(Some((value, rest))),
        Err(err) => Err(classify(input, err)),
    }
}

/// Parse exactly one form; trailing content is an error.
pub fn parse_one(input: &str) -> Result<Value, Error> {
    match parse_next(input) {
        Ok(Some((value, rest))) => {
            let rest = skip_ws(rest);
            if rest.is_empty() {
                Ok(value)
            } else {
                let near: String = rest.chars().take(16).collect();
                Err(Error::parse(format!("trailing content: '{near}'")))
            }
        }
        Ok(None) => Err(Error::parse("empty input")),
        Err(err) => Err(err.into()),
    }
}

/// Parse every top-level form, pairing each with the 1-based line its first
/// token starts on.
pub fn parse_all(input: &str) -> Result<Vec<(Value, usize)>, ParseError> {
    let mut forms = Vec::new();
    let mut rest = input;
    loop {
        let at = skip_ws(rest);
        if at.is_empty() {
            return Ok(forms);
        }
        let line = line_at(input, input.len() - at.len());
        match parse_form(at, 0) {
            Ok((remaining, value)) => {
                forms.push((value, line));
                rest = remaining;
            }
            Err(err) => {
                let mut parsed = classify(input, err);
                // End-of-file inside a form is a hard error for file input.
                if parsed.kind == ParseErrorKind::Incomplete {
                    parsed.line = line;
                }
                return Err(parsed);
            }
        }
    }
}

/// Incremental reader over a byte stream, used by the `read` builtin. Lines
/// accumulate until a complete form is available.
pub struct Reader<R> {
    src: R,
    buf: String,
    line: usize,
}

enum Step {
    Complete(Value, usize),
    Drained,
    NeedMore,
    Bad(ParseError),
}

impl<R: BufRead> Reader<R> {
    pub fn new(src: R) -> Self {
        Reader {
            src,
            buf: String::new(),
            line: 1,
        }
    }

    /// Next top-level form, or `Ok(None)` at end of stream.
    pub fn next_form(&mut self) -> Result<Option<Value>, Error> {
        loop {
            let step = match parse_next(&self.buf) {
                Ok(Some((value, rest))) => Step::Complete(value, self.buf.len() - rest.len()),
                Ok(None) => Step::Drained,
                Err(err) if err.kind == ParseErrorKind::Incomplete => Step::NeedMore,
                Err(err) => Step::Bad(err),
            };
            match step {
                Step::Complete(value, consumed) => {
                    self.line += self.buf[..consumed].matches('\n').count();
                    self.buf.drain(..consumed);
                    return Ok(Some(value));
                }
                Step::Drained => {
                    self.line += self.buf.matches('\n').count();
                    self.buf.clear();
                }
                Step::NeedMore => {}
                Step::Bad(mut err) => {
                    err.line += self.line - 1;
                    self.buf.clear();
                    return Err(err.into());
                }
            }
            let mut chunk = String::new();
            match self.src.read_line(&mut chunk) {
                Ok(0) => {
                    if self.buf.trim().is_empty() {
                        return Ok(None);
                    }
                    let line = self.line + self.buf.matches('\n').count();
                    self.buf.clear();
                    return Err(Error::parse(format!(
                        "line {line}: unexpected end of input inside a form"
                    )));
                }
                Ok(_) => self.buf.push_str(&chunk),
                Err(err) => return Err(Error::io(format!("read failed: {err}"))),
            }
        }
    }
}
