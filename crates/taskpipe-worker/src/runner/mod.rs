//! The pluggable payload-execution seam.
//!
//! The dispatch engine knows nothing about what a script *is*; it hands the
//! payload, the task handle, and the resolved bindings to a [`ScriptRunner`]
//! and classifies whatever comes back. Embedding an interpreter means
//! implementing this one trait; the bundled
//! [`DirectiveRunner`](crate::directive::DirectiveRunner) is the minimal
//! example, and engine tests substitute stubs.

use serde_json::{Map, Value};

use crate::error::RunnerError;
use crate::task::WorkerTask;

/// Executes one task payload inside the worker.
pub trait ScriptRunner: Send + Sync + 'static {
    /// Runs the script with the given bindings (task inputs merged over
    /// previously exported globals).
    ///
    /// The return value is classified by the engine: a JSON object merges
    /// into the task outputs, any other non-null value becomes
    /// `outputs["result"]`, and `None` adds nothing. Long-running payloads
    /// should poll [`WorkerTask::cancel_requested`] and acknowledge via
    /// [`WorkerTask::cancel`].
    ///
    /// # Errors
    ///
    /// Returns a [`RunnerError`] whose message becomes the FAILURE
    /// response's diagnostic.
    fn run(
        &self,
        task: &WorkerTask,
        script: &str,
        bindings: &Map<String, Value>,
    ) -> Result<Option<Value>, RunnerError>;
}
