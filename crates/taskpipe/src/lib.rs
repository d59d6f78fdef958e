//! Caller-side orchestration for worker processes.
//!
//! A [`Service`] provides access to a linked *worker* running in a separate
//! process. Callers create [`Task`]s that execute asynchronously in the
//! worker, which streams progress and result notifications back over plain
//! stdin/stdout pipes using the line protocol from `taskpipe-protocol`.
//!
//! The machinery guarantees that every task reaches exactly one terminal
//! state. Normal outcomes arrive as wire responses; if the worker process
//! dies mid-flight, the service's monitor thread synthesizes a CRASHED
//! transition for every pending task, so no caller is ever left blocking on
//! a worker that vanished.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskpipe::{Service, ServiceConfig};
//!
//! let service = Service::new(ServiceConfig::new("taskpipe-worker"));
//! let task = service.task("result 42")?;
//! task.wait_for()?;
//! assert_eq!(task.result(), Some(serde_json::json!(42)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod registry;
pub mod service;
pub mod task;

pub use self::error::{ServiceError, TaskError};
pub use self::registry::{RequestSender, TaskRegistry};
pub use self::service::{INIT_SCRIPT_ENV, Service, ServiceConfig};
pub use self::task::{Task, TaskEvent, TaskListener, TaskStatus};
