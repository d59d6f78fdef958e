//! The caller-side task state machine.
//!
//! A [`Task`] tracks one asynchronous unit of work executing in the worker
//! process. It moves through [`TaskStatus`] states driven by responses the
//! service's stdout loop routes to `Task::handle`, or by a locally
//! synthesized `Task::crash` when the monitor loop detects worker death.
//! A per-task dispatch lock makes those two paths mutually exclusive, so a
//! straggling real response racing a crash notification can never fire two
//! terminal transitions.
//!
//! Listener callbacks run synchronously on whichever service thread delivers
//! the message (stdout loop or monitor loop). Callback bodies must not block
//! and must not call back into the task's mutating methods.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use taskpipe_protocol::{Request, Response, ResponseType};

use crate::error::{ServiceError, TaskError};
use crate::registry::{RequestSender, TaskRegistry};

/// Tracing target for task state transitions.
const TARGET: &str = "taskpipe::task";

/// Lifecycle states of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but not yet submitted to the worker.
    Initial,
    /// Submitted; the worker has not begun executing it.
    Queued,
    /// The worker has begun executing the payload.
    Running,
    /// Finished successfully; outputs are populated.
    Complete,
    /// The worker acknowledged cancellation.
    Canceled,
    /// The payload raised an error.
    Failed,
    /// The worker process died while the task was pending.
    Crashed,
}

impl TaskStatus {
    /// True once the task has reached any terminal state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Canceled | Self::Failed | Self::Crashed
        )
    }

    /// True for the unsuccessful terminal states.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Crashed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot delivered to task listeners.
///
/// Captures the response that caused the notification plus the task's status
/// after the corresponding transition was applied.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    task: String,
    status: TaskStatus,
    response_type: ResponseType,
    message: Option<String>,
    current: Option<i64>,
    maximum: Option<i64>,
    info: Option<Map<String, Value>>,
}

impl TaskEvent {
    fn from_response(task: &Task, status: TaskStatus, response: &Response) -> Self {
        Self {
            task: task.uuid.clone(),
            status,
            response_type: response.response_type(),
            message: response.message().map(str::to_owned),
            current: response.current(),
            maximum: response.maximum(),
            info: response.info().cloned(),
        }
    }

    fn crash(task: &Task) -> Self {
        Self {
            task: task.uuid.clone(),
            status: TaskStatus::Crashed,
            response_type: ResponseType::Crash,
            message: None,
            current: None,
            maximum: None,
            info: None,
        }
    }

    /// Correlation id of the task this event belongs to.
    #[must_use]
    pub fn task(&self) -> &str {
        self.task.as_str()
    }

    /// Task status after the transition that produced this event.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// The response type that produced this event.
    #[must_use]
    pub const fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Progress message, if the response carried one.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Current progress value, if the response carried one.
    #[must_use]
    pub const fn current(&self) -> Option<i64> {
        self.current
    }

    /// Maximum progress value, if the response carried one.
    #[must_use]
    pub const fn maximum(&self) -> Option<i64> {
        self.maximum
    }

    /// Structured info payload, if the response carried one.
    #[must_use]
    pub const fn info(&self) -> Option<&Map<String, Value>> {
        self.info.as_ref()
    }
}

/// Listener callback invoked for every event on a task.
pub type TaskListener = Box<dyn Fn(&TaskEvent) + Send + Sync>;

struct TaskState {
    status: TaskStatus,
    outputs: Map<String, Value>,
    error: Option<String>,
}

/// One asynchronous unit of work tracked by the caller.
///
/// Created through [`Service::task`](crate::Service::task), which registers
/// it in the service's registry under a fresh correlation id. The task holds
/// an explicit [`RequestSender`] capability and the shared registry rather
/// than a handle to the whole service.
pub struct Task {
    uuid: String,
    script: String,
    inputs: Map<String, Value>,
    queue: Option<String>,
    sender: Arc<dyn RequestSender>,
    registry: Arc<TaskRegistry>,
    state: Mutex<TaskState>,
    finished: Condvar,
    listeners: Mutex<Vec<TaskListener>>,
    // Serialises handle() against crash() so exactly one terminal
    // notification fires per task.
    dispatch: Mutex<()>,
}

impl Task {
    pub(crate) fn create(
        script: impl Into<String>,
        inputs: Map<String, Value>,
        queue: Option<String>,
        sender: Arc<dyn RequestSender>,
        registry: Arc<TaskRegistry>,
    ) -> Arc<Self> {
        let task = Arc::new(Self {
            uuid: Uuid::new_v4().to_string(),
            script: script.into(),
            inputs,
            queue,
            sender,
            registry: Arc::clone(&registry),
            state: Mutex::new(TaskState {
                status: TaskStatus::Initial,
                outputs: Map::new(),
                error: None,
            }),
            finished: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            dispatch: Mutex::new(()),
        });
        registry.insert(Arc::clone(&task));
        task
    }

    // Lock poisoning only happens if a listener panicked while a service
    // thread held the lock; the state itself is a plain record, so recover
    // it rather than propagating the panic to unrelated callers.
    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the task's correlation id.
    #[must_use]
    pub fn uuid(&self) -> &str {
        self.uuid.as_str()
    }

    /// Returns the script payload.
    #[must_use]
    pub fn script(&self) -> &str {
        self.script.as_str()
    }

    /// Returns the task's inputs, fixed at creation.
    #[must_use]
    pub const fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    /// Returns the queue hint, if any.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Returns the task's current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// Returns a snapshot of the task's outputs.
    ///
    /// Empty until a COMPLETION response has been handled.
    #[must_use]
    pub fn outputs(&self) -> Map<String, Value> {
        self.state().outputs.clone()
    }

    /// Returns `outputs["result"]`, the conventional single-value output.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        self.state().outputs.get("result").cloned()
    }

    /// Returns the error text captured from a FAILED or CRASHED transition.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    /// Submits the task to the worker for execution.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotInitial`] if the task has already been
    /// started, or a transport error if the request cannot be written.
    pub fn start(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.state();
            if state.status != TaskStatus::Initial {
                return Err(ServiceError::NotInitial {
                    uuid: self.uuid.clone(),
                });
            }
            state.status = TaskStatus::Queued;
        }
        self.sender.send(&Request::execute(
            self.uuid.clone(),
            self.script.clone(),
            self.inputs.clone(),
            self.queue.clone(),
        ))
    }

    /// Registers a listener for this task's events.
    ///
    /// The listener list is closed once the task leaves INITIAL, which
    /// guarantees listeners observe the full event sequence from LAUNCH on.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotInitial`] if the task has already been
    /// started.
    pub fn listen(&self, listener: TaskListener) -> Result<(), ServiceError> {
        let state = self.state();
        if state.status != TaskStatus::Initial {
            return Err(ServiceError::NotInitial {
                uuid: self.uuid.clone(),
            });
        }
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        Ok(())
    }

    /// Requests cooperative cancellation of the task.
    ///
    /// The worker sets a flag the payload must poll; nothing is forcibly
    /// interrupted. The task resolves to CANCELED only once the payload
    /// acknowledges.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request cannot be written.
    pub fn cancel(&self) -> Result<(), ServiceError> {
        self.sender.send(&Request::cancel(self.uuid.clone()))
    }

    /// Blocks until the task reaches a terminal state.
    ///
    /// Starts the task first if it is still INITIAL. Returns immediately if
    /// the task is already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Unsuccessful`] if the task ends CANCELED,
    /// FAILED, or CRASHED, carrying the terminal status and error text.
    pub fn wait_for(&self) -> Result<(), TaskError> {
        if self.status() == TaskStatus::Initial {
            self.start()?;
        }
        let mut state = self.state();
        while !state.status.is_finished() {
            state = self
                .finished
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.status.is_error() {
            return Err(TaskError::Unsuccessful {
                status: state.status,
                message: state
                    .error
                    .clone()
                    .unwrap_or_else(|| "no error message available".to_owned()),
            });
        }
        Ok(())
    }

    /// Applies a response from the worker to this task.
    ///
    /// Terminal states are idempotent: a second terminal notification for an
    /// already-terminal task is ignored.
    pub(crate) fn handle(&self, response: &Response) {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let event = {
            let mut state = self.state();
            if state.status.is_finished() {
                debug!(
                    target: TARGET,
                    task = self.uuid,
                    response = ?response.response_type(),
                    "response for already-terminal task ignored"
                );
                return;
            }
            match response.response_type() {
                ResponseType::Launch => state.status = TaskStatus::Running,
                ResponseType::Update => {}
                ResponseType::Completion => {
                    state.status = TaskStatus::Complete;
                    if let Some(outputs) = response.outputs() {
                        state.outputs.extend(outputs.clone());
                    }
                    self.registry.remove(&self.uuid);
                }
                ResponseType::Cancelation => {
                    state.status = TaskStatus::Canceled;
                    self.registry.remove(&self.uuid);
                }
                ResponseType::Failure => {
                    state.status = TaskStatus::Failed;
                    state.error = response.error().map(str::to_owned);
                    self.registry.remove(&self.uuid);
                }
                ResponseType::Crash => {
                    // CRASH is synthesized locally on process death; a wire
                    // message claiming it is protocol noise.
                    debug!(target: TARGET, task = self.uuid, "unexpected CRASH on the wire ignored");
                    return;
                }
            }
            TaskEvent::from_response(self, state.status, response)
        };
        self.fire(&event);
        if event.status.is_finished() {
            self.finished.notify_all();
        }
    }

    /// Drives the task to CRASHED after worker-process death.
    ///
    /// Synthesized by the service's monitor loop; never arrives on the wire.
    /// No-op if the task already reached a terminal state through a real
    /// response.
    pub(crate) fn crash(&self, error: &str) {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.state();
            if state.status.is_finished() {
                return;
            }
            state.status = TaskStatus::Crashed;
            state.error = Some(error.to_owned());
        }
        debug!(target: TARGET, task = self.uuid, "task crashed");
        let event = TaskEvent::crash(self);
        self.fire(&event);
        self.finished.notify_all();
    }

    fn fire(&self, event: &TaskEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(event);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Task")
            .field("uuid", &self.uuid)
            .field("status", &state.status)
            .field("error", &state.error)
            .finish_non_exhaustive()
    }
}
