//! Domain errors raised inside the worker process.

use std::sync::Arc;

use thiserror::Error;

use taskpipe_protocol::ProtocolError;

/// Errors arising from the dispatch engine and response transport.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Writing a response to the caller failed.
    #[error("failed to write response: {source}")]
    Io {
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A wire message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An engine thread could not be spawned.
    #[error("failed to spawn worker thread '{name}': {source}")]
    Thread {
        /// Name of the thread that failed to start.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl WorkerError {
    pub(crate) fn io(source: std::io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

/// Failure reported by a [`ScriptRunner`](crate::runner::ScriptRunner).
///
/// Carries the diagnostic text that becomes the FAILURE response's `error`
/// field. Runners embedding a language runtime put the captured trace here.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RunnerError {
    message: String,
}

impl RunnerError {
    /// Creates a runner error with the given diagnostic text.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the diagnostic text.
    #[must_use]
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

impl From<WorkerError> for RunnerError {
    fn from(error: WorkerError) -> Self {
        Self::new(error.to_string())
    }
}
