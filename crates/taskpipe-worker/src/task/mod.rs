//! Worker-side task handles and response emission.
//!
//! A [`WorkerTask`] is the execution-side view of one task: it carries the
//! cooperative cancellation flag, accumulates outputs, and emits responses
//! on the shared stdout writer. Terminal emission is guarded so that at most
//! one terminal response ever leaves the worker per task, which is what
//! stops a failure-while-reporting-failure from looping forever.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use taskpipe_protocol::{Response, encode_response};

use crate::error::WorkerError;

/// Tracing target for worker task operations.
const TARGET: &str = "taskpipe_worker::task";

/// Sentinel diagnostic for a task whose execution thread died without
/// reporting a terminal response.
pub const THREAD_DEATH: &str = "thread death";

/// Serialises responses onto the shared output stream.
///
/// Cloning shares the underlying writer; every send flushes so the caller
/// sees each response promptly.
#[derive(Clone)]
pub struct ResponseSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ResponseSink {
    /// Creates a sink over the given writer.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Creates a sink that discards everything. Used for the init script,
    /// which runs outside any task.
    #[must_use]
    pub fn null() -> Self {
        Self::new(Box::new(std::io::sink()))
    }

    /// Encodes and writes one response line, flushing immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`] if encoding or the write fails.
    pub fn send(&self, response: &Response) -> Result<(), WorkerError> {
        let line = encode_response(response)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}").map_err(WorkerError::io)?;
        writer.flush().map_err(WorkerError::io)
    }
}

/// Execution-side handle for one task.
///
/// Handed to the [`ScriptRunner`](crate::runner::ScriptRunner) so the
/// running payload can report progress, publish outputs and exports, and
/// acknowledge cancellation.
pub struct WorkerTask {
    uuid: String,
    sink: ResponseSink,
    cancel_requested: AtomicBool,
    terminal_sent: AtomicBool,
    outputs: Mutex<Map<String, Value>>,
    exports: Arc<Mutex<Map<String, Value>>>,
}

impl WorkerTask {
    pub(crate) fn new(
        uuid: impl Into<String>,
        sink: ResponseSink,
        exports: Arc<Mutex<Map<String, Value>>>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            sink,
            cancel_requested: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            outputs: Mutex::new(Map::new()),
            exports,
        }
    }

    /// Returns the task's correlation id.
    #[must_use]
    pub fn uuid(&self) -> &str {
        self.uuid.as_str()
    }

    /// True once the caller has requested cancellation.
    ///
    /// Cancellation is strictly cooperative: long-running payloads must poll
    /// this flag and call [`WorkerTask::cancel`] themselves; nothing is
    /// interrupted forcibly.
    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    /// True once a terminal response has been sent for this task.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }

    /// Reports execution progress to the caller.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkerError`] if the response cannot be written.
    pub fn update(
        &self,
        message: Option<&str>,
        current: Option<i64>,
        maximum: Option<i64>,
    ) -> Result<(), WorkerError> {
        self.sink.send(&Response::update(
            self.uuid.clone(),
            message.map(str::to_owned),
            current,
            maximum,
        ))
    }

    /// Publishes one named output value.
    pub fn output(&self, name: impl Into<String>, value: Value) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    /// Exports a global binding visible to later tasks on this worker.
    pub fn export(&self, name: impl Into<String>, value: Value) {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    /// Acknowledges cancellation with a terminal CANCELATION response.
    pub fn cancel(&self) {
        self.send_terminal(Response::cancelation(self.uuid.clone()));
    }

    /// Reports a terminal FAILURE with the given diagnostic.
    ///
    /// Swallowed if a terminal response has already been sent; that guard is
    /// what prevents a failure raised while reporting a failure from
    /// recursing.
    pub fn fail(&self, error: &str) {
        self.send_terminal(Response::failure(self.uuid.clone(), error));
    }

    pub(crate) fn launch(&self) {
        if let Err(err) = self.sink.send(&Response::launch(self.uuid.clone())) {
            warn!(target: TARGET, task = self.uuid, error = %err, "failed to report launch");
        }
    }

    pub(crate) fn merge_outputs(&self, values: Map<String, Value>) {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(values);
    }

    /// Reports COMPLETION carrying the accumulated outputs.
    pub(crate) fn complete(&self) {
        let outputs = self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.send_terminal(Response::completion(self.uuid.clone(), outputs));
    }

    fn send_terminal(&self, response: Response) {
        if self
            .terminal_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                target: TARGET,
                task = self.uuid,
                response = ?response.response_type(),
                "terminal response already sent, dropping"
            );
            return;
        }
        if let Err(err) = self.sink.send(&response) {
            // The caller end is likely gone; there is no one left to tell.
            warn!(target: TARGET, task = self.uuid, error = %err, "failed to send terminal response");
        }
    }
}
