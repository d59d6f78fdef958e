//! Request and response records.
//!
//! Field names and enum spellings here are the wire format: `task`,
//! `requestType`, `responseType`, and SCREAMING_CASE type tags. Unknown
//! fields are ignored on decode so newer workers can add information without
//! breaking older callers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The kind of request a caller sends to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    /// Submit a script for execution.
    Execute,
    /// Request cooperative cancellation of a previously submitted task.
    Cancel,
}

/// The kind of response a worker emits about a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    /// Execution of the task's payload has begun.
    Launch,
    /// A progress report from the running payload.
    Update,
    /// The payload finished successfully; `outputs` carries its results.
    Completion,
    /// The payload acknowledged cancellation and stopped.
    Cancelation,
    /// The payload raised an error; `error` carries the diagnostic.
    Failure,
    /// The worker process died. Never sent over the wire: the caller
    /// synthesizes this locally when it detects process death.
    Crash,
}

impl ResponseType {
    /// True for the four types after which no further response follows.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completion | Self::Cancelation | Self::Failure | Self::Crash
        )
    }
}

/// A request line written to the worker's stdin.
///
/// EXECUTE requests carry the script payload, its named inputs, and an
/// optional queue hint (`"main"` routes the task onto the worker's serial
/// main queue). CANCEL requests carry only the correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    task: String,
    request_type: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inputs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue: Option<String>,
}

impl Request {
    /// Creates an EXECUTE request.
    #[must_use]
    pub fn execute(
        task: impl Into<String>,
        script: impl Into<String>,
        inputs: Map<String, Value>,
        queue: Option<String>,
    ) -> Self {
        Self {
            task: task.into(),
            request_type: RequestType::Execute,
            script: Some(script.into()),
            inputs: Some(inputs),
            queue,
        }
    }

    /// Creates a CANCEL request.
    #[must_use]
    pub fn cancel(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            request_type: RequestType::Cancel,
            script: None,
            inputs: None,
            queue: None,
        }
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn task(&self) -> &str {
        self.task.as_str()
    }

    /// Returns the request type.
    #[must_use]
    pub const fn request_type(&self) -> RequestType {
        self.request_type
    }

    /// Returns the script payload, if any.
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Returns the named inputs, if any.
    #[must_use]
    pub const fn inputs(&self) -> Option<&Map<String, Value>> {
        self.inputs.as_ref()
    }

    /// Returns the queue hint, if any.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }
}

/// A response line read from the worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    task: String,
    response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    maximum: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    info: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outputs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    fn bare(task: impl Into<String>, response_type: ResponseType) -> Self {
        Self {
            task: task.into(),
            response_type,
            message: None,
            current: None,
            maximum: None,
            info: None,
            outputs: None,
            error: None,
        }
    }

    /// Creates a LAUNCH response.
    #[must_use]
    pub fn launch(task: impl Into<String>) -> Self {
        Self::bare(task, ResponseType::Launch)
    }

    /// Creates an UPDATE response carrying a progress report.
    #[must_use]
    pub fn update(
        task: impl Into<String>,
        message: Option<String>,
        current: Option<i64>,
        maximum: Option<i64>,
    ) -> Self {
        Self {
            message,
            current,
            maximum,
            ..Self::bare(task, ResponseType::Update)
        }
    }

    /// Creates a COMPLETION response carrying the task outputs.
    #[must_use]
    pub fn completion(task: impl Into<String>, outputs: Map<String, Value>) -> Self {
        Self {
            outputs: Some(outputs),
            ..Self::bare(task, ResponseType::Completion)
        }
    }

    /// Creates a CANCELATION response.
    #[must_use]
    pub fn cancelation(task: impl Into<String>) -> Self {
        Self::bare(task, ResponseType::Cancelation)
    }

    /// Creates a FAILURE response carrying the error diagnostic.
    #[must_use]
    pub fn failure(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::bare(task, ResponseType::Failure)
        }
    }

    /// Creates a CRASH response.
    ///
    /// Only used caller-side when synthesizing a terminal notification for a
    /// dead worker; workers never write this type.
    #[must_use]
    pub fn crash(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::bare(task, ResponseType::Crash)
        }
    }

    /// Attaches structured info to the response.
    #[must_use]
    pub fn with_info(mut self, info: Map<String, Value>) -> Self {
        self.info = Some(info);
        self
    }

    /// Returns the correlation id.
    #[must_use]
    pub fn task(&self) -> &str {
        self.task.as_str()
    }

    /// Returns the response type.
    #[must_use]
    pub const fn response_type(&self) -> ResponseType {
        self.response_type
    }

    /// Returns the progress message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the current progress value, if any.
    #[must_use]
    pub const fn current(&self) -> Option<i64> {
        self.current
    }

    /// Returns the maximum progress value, if any.
    #[must_use]
    pub const fn maximum(&self) -> Option<i64> {
        self.maximum
    }

    /// Returns the structured info payload, if any.
    #[must_use]
    pub const fn info(&self) -> Option<&Map<String, Value>> {
        self.info.as_ref()
    }

    /// Returns the task outputs, if any.
    #[must_use]
    pub const fn outputs(&self) -> Option<&Map<String, Value>> {
        self.outputs.as_ref()
    }

    /// Returns the error diagnostic, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
