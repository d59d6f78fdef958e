//! Domain errors raised by the caller side.
//!
//! All errors use `thiserror`-derived enums with structured context so
//! callers can inspect the failure programmatically. I/O errors are wrapped
//! in `Arc` so error values stay clonable across the background threads.

use std::sync::Arc;

use thiserror::Error;

use taskpipe_protocol::ProtocolError;

use crate::task::TaskStatus;

/// Errors arising from service and task operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The worker process could not be spawned.
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        /// Program that was launched.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A stdio pipe of the spawned worker could not be captured.
    #[error("failed to capture worker {stream} pipe")]
    Pipe {
        /// Which stream was missing: "stdin", "stdout", or "stderr".
        stream: &'static str,
    },

    /// The init script could not be written to its temporary file.
    #[error("failed to stage init script: {source}")]
    InitScript {
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A service observer thread could not be spawned.
    #[error("failed to spawn service thread '{name}': {source}")]
    Thread {
        /// Name of the thread that failed to start.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The operation requires a started service.
    #[error("service has not been started")]
    NotStarted,

    /// The worker's stdin pipe has already been closed.
    #[error("worker stdin is closed")]
    Closed,

    /// Writing a request to the worker failed.
    #[error("failed to write request to worker: {source}")]
    Io {
        /// Underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A wire message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A task operation was invoked outside the INITIAL state.
    #[error("task {uuid} is not in the INITIAL state")]
    NotInitial {
        /// Correlation id of the misused task.
        uuid: String,
    },
}

/// Error returned by [`Task::wait_for`](crate::task::Task::wait_for) when a
/// task does not finish successfully.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task reached a terminal state other than COMPLETE.
    #[error("task {status}: {message}")]
    Unsuccessful {
        /// Terminal status: CANCELED, FAILED, or CRASHED.
        status: TaskStatus,
        /// Error text captured from the task, or a placeholder if none.
        message: String,
    },

    /// Auto-starting the task failed before it reached the worker.
    #[error(transparent)]
    Service(#[from] ServiceError),
}
