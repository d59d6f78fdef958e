//! Task registry and the request-sending capability.
//!
//! The registry is the only state shared between the caller's threads and
//! the service's background threads: the stdout loop resolves correlation
//! ids through it, and the monitor loop drains it wholesale when the worker
//! dies. Tasks hold it (plus a narrow [`RequestSender`]) explicitly rather
//! than capturing their owning service.

use std::collections::HashMap;
use std::io::Write;
use std::process::ChildStdin;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use taskpipe_protocol::{Request, encode_request};

use crate::error::ServiceError;
use crate::task::Task;

/// Tracing target for registry and sender operations.
const TARGET: &str = "taskpipe::registry";

/// Capability for writing requests to the worker.
///
/// The production implementation is `PipeSender`, which serialises each
/// request as a JSON line on the worker's stdin. Task unit tests substitute
/// a recording implementation so no process is spawned.
pub trait RequestSender: Send + Sync {
    /// Encodes and delivers one request.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the request cannot be encoded or the
    /// transport rejects the write.
    fn send(&self, request: &Request) -> Result<(), ServiceError>;
}

/// Sends requests over the worker's stdin pipe.
///
/// The pipe lives behind `Option` so [`Service::close`](crate::Service::close)
/// can drop it to signal graceful shutdown; sends after that fail with
/// [`ServiceError::Closed`].
pub(crate) struct PipeSender {
    stdin: Arc<Mutex<Option<ChildStdin>>>,
}

impl PipeSender {
    pub(crate) const fn new(stdin: Arc<Mutex<Option<ChildStdin>>>) -> Self {
        Self { stdin }
    }
}

impl RequestSender for PipeSender {
    fn send(&self, request: &Request) -> Result<(), ServiceError> {
        let line = encode_request(request)?;
        let mut guard = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        let stdin = guard.as_mut().ok_or(ServiceError::Closed)?;
        // Flush immediately so the worker sees the request promptly.
        writeln!(stdin, "{line}").map_err(|err| ServiceError::Io {
            source: Arc::new(err),
        })?;
        stdin.flush().map_err(|err| ServiceError::Io {
            source: Arc::new(err),
        })?;
        debug!(target: TARGET, task = request.task(), "request sent");
        Ok(())
    }
}

/// Correlation id to task map shared across service threads.
///
/// Supports the three concurrent access patterns the protocol needs:
/// insertion at task creation, lookup-and-dispatch from the stdout loop,
/// and bulk drain from the monitor loop on worker death.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Arc<Task>>>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a task under its correlation id.
    pub fn insert(&self, task: Arc<Task>) {
        self.guard().insert(task.uuid().to_owned(), task);
    }

    /// Looks up a task by correlation id.
    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<Arc<Task>> {
        self.guard().get(uuid).cloned()
    }

    /// Removes a task by correlation id.
    ///
    /// Called exactly once per task, by whichever terminal path wins.
    pub fn remove(&self, uuid: &str) {
        self.guard().remove(uuid);
    }

    /// Removes and returns every still-registered task.
    #[must_use]
    pub fn drain(&self) -> Vec<Arc<Task>> {
        self.guard().drain().map(|(_, task)| task).collect()
    }

    /// Returns the number of registered (pending) tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// True when no tasks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}
