//! A line-oriented script dialect for the bundled worker binary.
//!
//! [`DirectiveRunner`] interprets one directive per line, which is enough
//! to exercise every part of the protocol without embedding a language
//! runtime. Blank lines and lines starting with `#` are skipped; the last
//! `result` or `bind` value becomes the script's return value.
//!
//! Directives:
//!
//! - `progress N` — emit N UPDATE responses counting toward N, then yield N
//! - `sleep MS` — block for MS milliseconds
//! - `result JSON` — set the script's return value
//! - `output NAME JSON` — publish one named task output
//! - `export NAME JSON` — publish a global visible to later tasks
//! - `bind NAME` — yield the named binding, failing if it is absent
//! - `fail MESSAGE` — raise a failure with the given diagnostic
//! - `await-cancel` — block until cancellation is requested, then
//!   acknowledge it
//! - `panic MESSAGE` — panic the executing thread
//! - `exit CODE` — terminate the whole worker process

use std::time::Duration;
use std::{process, thread};

use serde_json::{Map, Value};

use crate::error::RunnerError;
use crate::runner::ScriptRunner;
use crate::task::WorkerTask;

/// Poll interval while blocked in `await-cancel`.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// Interprets the directive dialect.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectiveRunner;

impl DirectiveRunner {
    /// Creates a directive runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScriptRunner for DirectiveRunner {
    #[expect(
        clippy::panic_in_result_fn,
        reason = "the panic directive exists to kill the executing thread"
    )]
    fn run(
        &self,
        task: &WorkerTask,
        script: &str,
        bindings: &Map<String, Value>,
    ) -> Result<Option<Value>, RunnerError> {
        let mut last = None;
        for raw in script.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if task.cancel_requested() {
                task.cancel();
                return Ok(None);
            }
            let (directive, rest) = line
                .split_once(' ')
                .map_or((line, ""), |(word, tail)| (word, tail.trim()));
            match directive {
                "progress" => {
                    let total = parse_int(directive, rest)?;
                    for current in 0..total {
                        task.update(None, Some(current), Some(total))?;
                    }
                    last = Some(Value::from(total));
                }
                "sleep" => {
                    let millis = parse_int(directive, rest)?;
                    thread::sleep(Duration::from_millis(millis.unsigned_abs()));
                }
                "result" => last = Some(parse_json(directive, rest)?),
                "output" => {
                    let (name, value) = parse_named(directive, rest)?;
                    task.output(name, value);
                }
                "export" => {
                    let (name, value) = parse_named(directive, rest)?;
                    task.export(name, value);
                }
                "bind" => {
                    last = Some(bindings.get(rest).cloned().ok_or_else(|| {
                        RunnerError::new(format!("undefined binding: {rest}"))
                    })?);
                }
                "fail" => return Err(RunnerError::new(rest)),
                "await-cancel" => {
                    while !task.cancel_requested() {
                        thread::sleep(CANCEL_POLL);
                    }
                    task.cancel();
                    return Ok(None);
                }
                "panic" => panic!("{rest}"),
                "exit" => {
                    let code = i32::try_from(parse_int(directive, rest)?).unwrap_or(1);
                    process::exit(code);
                }
                other => return Err(RunnerError::new(format!("unknown directive: {other}"))),
            }
        }
        Ok(last)
    }
}

fn parse_int(directive: &str, rest: &str) -> Result<i64, RunnerError> {
    rest.parse()
        .map_err(|_| RunnerError::new(format!("{directive}: expected an integer, got '{rest}'")))
}

fn parse_json(directive: &str, rest: &str) -> Result<Value, RunnerError> {
    serde_json::from_str(rest)
        .map_err(|err| RunnerError::new(format!("{directive}: malformed value: {err}")))
}

fn parse_named(directive: &str, rest: &str) -> Result<(String, Value), RunnerError> {
    let (name, json) = rest
        .split_once(' ')
        .ok_or_else(|| RunnerError::new(format!("{directive}: expected NAME VALUE")))?;
    Ok((name.to_owned(), parse_json(directive, json.trim())?))
}
