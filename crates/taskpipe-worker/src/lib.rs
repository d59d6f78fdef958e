//! Worker-side engine for the taskpipe protocol.
//!
//! A worker process reads newline-delimited JSON requests on stdin and
//! writes responses on stdout. This crate provides the [`Worker`] dispatch
//! engine, the [`ScriptRunner`] seam for plugging in a payload interpreter,
//! and [`DirectiveRunner`], a small line-oriented dialect the bundled
//! `taskpipe-worker` binary runs.
//!
//! ```no_run
//! use std::io;
//!
//! use taskpipe_worker::{DirectiveRunner, Worker};
//!
//! # fn main() -> Result<(), taskpipe_worker::WorkerError> {
//! let worker = Worker::new(DirectiveRunner::new(), Box::new(io::stdout()));
//! worker.run(io::stdin().lock())
//! # }
//! ```

pub mod directive;
pub mod engine;
pub mod error;
pub mod runner;
pub mod task;
#[cfg(test)]
pub(crate) mod testing;

pub use directive::DirectiveRunner;
pub use engine::{INIT_SCRIPT_ENV, Worker};
pub use error::{RunnerError, WorkerError};
pub use runner::ScriptRunner;
pub use task::{ResponseSink, THREAD_DEATH, WorkerTask};
