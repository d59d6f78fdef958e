//! The caller-side service orchestrator.
//!
//! A [`Service`] owns one worker process and the three background threads
//! that observe it: a stdout loop decoding and routing responses, a stderr
//! loop capturing diagnostics verbatim, and a monitor loop that detects
//! process death and resolves every still-pending task to CRASHED. The
//! worker is spawned lazily: [`Service::task`] auto-starts it.
//!
//! Protocol noise is never fatal here. Undecodable stdout lines and raw
//! stderr lines are accumulated and can be inspected through
//! [`Service::invalid_lines`] / [`Service::error_lines`]; the same history
//! seeds the error text of synthesized crash notifications.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use taskpipe_protocol::decode_response;

use crate::error::ServiceError;
use crate::registry::{PipeSender, RequestSender, TaskRegistry};
use crate::task::Task;

/// Tracing target for service operations.
const TARGET: &str = "taskpipe::service";

/// Environment variable through which the init script path reaches the worker.
pub const INIT_SCRIPT_ENV: &str = "TASKPIPE_INIT_SCRIPT";

/// Poll interval for the monitor loop and process-exit waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for spawning a worker process.
///
/// The service treats all of this as opaque constructor input; whatever
/// component constructs the worker environment decides the program, argument
/// vector, working directory, and environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    init_script: Option<String>,
    label: String,
}

impl ServiceConfig {
    /// Creates a configuration running the given program.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            init_script: None,
            label: "worker".to_owned(),
        }
    }

    /// Appends one argument to the worker command line.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments to the worker command line.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the worker's working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sets one environment variable for the worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Registers a script the worker runs once before accepting tasks.
    ///
    /// Useful for early initialisation that must happen before the worker's
    /// receive loop starts, such as importing libraries that interfere with
    /// I/O. The script is staged in a temporary file whose path is passed
    /// via the [`INIT_SCRIPT_ENV`] environment variable.
    #[must_use]
    pub fn init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script = Some(script.into());
        self
    }

    /// Sets the label used for thread names and log fields.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Returns the worker program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Returns the configured label.
    #[must_use]
    pub fn service_label(&self) -> &str {
        self.label.as_str()
    }
}

struct Runtime {
    child: Arc<Mutex<Child>>,
    threads: Vec<JoinHandle<()>>,
    // Holds the staged init script on disk for the worker's lifetime.
    _init_script: Option<NamedTempFile>,
}

/// Caller-side handle to one worker process.
pub struct Service {
    config: ServiceConfig,
    registry: Arc<TaskRegistry>,
    sender: Arc<PipeSender>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    invalid_lines: Arc<Mutex<Vec<String>>>,
    error_lines: Arc<Mutex<Vec<String>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl Service {
    /// Creates a service for the given worker configuration.
    ///
    /// The worker process is not spawned until [`Service::start`] or the
    /// first [`Service::task`] call.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        let stdin: Arc<Mutex<Option<ChildStdin>>> = Arc::new(Mutex::new(None));
        Self {
            config,
            registry: Arc::new(TaskRegistry::new()),
            sender: Arc::new(PipeSender::new(Arc::clone(&stdin))),
            stdin,
            invalid_lines: Arc::new(Mutex::new(Vec::new())),
            error_lines: Arc::new(Mutex::new(Vec::new())),
            runtime: Mutex::new(None),
        }
    }

    /// Spawns the worker process and its observer threads.
    ///
    /// Idempotent: a second call on a started service is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the process cannot be spawned, a stdio
    /// pipe cannot be captured, or a background thread fails to start.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            return Ok(());
        }

        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args);
        if let Some(dir) = &self.config.cwd {
            command.current_dir(dir);
        }
        command.envs(&self.config.env);

        let init_file = self
            .config
            .init_script
            .as_deref()
            .map(|script| {
                let file = stage_init_script(script)?;
                command.env(INIT_SCRIPT_ENV, file.path());
                Ok::<_, ServiceError>(file)
            })
            .transpose()?;

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            target: TARGET,
            service = self.config.label,
            program = %self.config.program.display(),
            "spawning worker process"
        );

        let mut process = command.spawn().map_err(|err| ServiceError::Spawn {
            program: self.config.program.display().to_string(),
            source: Arc::new(err),
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or(ServiceError::Pipe { stream: "stdin" })?;
        let stdout = process
            .stdout
            .take()
            .ok_or(ServiceError::Pipe { stream: "stdout" })?;
        let stderr = process
            .stderr
            .take()
            .ok_or(ServiceError::Pipe { stream: "stderr" })?;

        *self.stdin.lock().unwrap_or_else(PoisonError::into_inner) = Some(stdin);

        let child = Arc::new(Mutex::new(process));
        let stdout_done = Arc::new(AtomicBool::new(false));
        let stderr_done = Arc::new(AtomicBool::new(false));

        let stdout_handle = {
            let registry = Arc::clone(&self.registry);
            let invalid_lines = Arc::clone(&self.invalid_lines);
            let done = Arc::clone(&stdout_done);
            spawn_named(format!("{}-stdout", self.config.label), move || {
                stdout_loop(stdout, &registry, &invalid_lines);
                done.store(true, Ordering::Release);
            })?
        };
        let stderr_handle = {
            let error_lines = Arc::clone(&self.error_lines);
            let done = Arc::clone(&stderr_done);
            spawn_named(format!("{}-stderr", self.config.label), move || {
                stderr_loop(stderr, &error_lines);
                done.store(true, Ordering::Release);
            })?
        };
        let monitor_handle = {
            let watched = Arc::clone(&child);
            let registry = Arc::clone(&self.registry);
            let invalid_lines = Arc::clone(&self.invalid_lines);
            let error_lines = Arc::clone(&self.error_lines);
            spawn_named(format!("{}-monitor", self.config.label), move || {
                monitor_loop(
                    &watched,
                    &stdout_done,
                    &stderr_done,
                    &registry,
                    &invalid_lines,
                    &error_lines,
                );
            })?
        };

        *runtime = Some(Runtime {
            child,
            threads: vec![stdout_handle, stderr_handle, monitor_handle],
            _init_script: init_file,
        });
        Ok(())
    }

    /// Creates a task executing the given script, with no inputs and no
    /// queue hint.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if auto-starting the service fails.
    pub fn task(&self, script: &str) -> Result<Arc<Task>, ServiceError> {
        self.task_with(script, Map::new(), None)
    }

    /// Creates a task with named inputs and an optional queue hint.
    ///
    /// Passing `Some("main")` routes execution onto the worker's serial main
    /// queue. Auto-starts the service if necessary.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if auto-starting the service fails.
    pub fn task_with(
        &self,
        script: &str,
        inputs: Map<String, Value>,
        queue: Option<&str>,
    ) -> Result<Arc<Task>, ServiceError> {
        self.start()?;
        Ok(Task::create(
            script,
            inputs,
            queue.map(str::to_owned),
            Arc::clone(&self.sender) as Arc<dyn RequestSender>,
            Arc::clone(&self.registry),
        ))
    }

    /// Closes the worker's stdin pipe, signalling graceful shutdown.
    ///
    /// Tasks already dispatched keep running to completion; the worker exits
    /// once it has drained them. Idempotent; a no-op before [`Service::start`].
    pub fn close(&self) {
        self.stdin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Force-terminates the worker process.
    ///
    /// Tasks still pending will be resolved through the crash path by the
    /// monitor loop.
    pub fn kill(&self) {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rt) = runtime.as_ref() {
            let mut child = rt.child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = child.kill() {
                debug!(target: TARGET, error = %err, "kill on already-exited worker");
            }
        }
    }

    /// Blocks until the worker has exited and all three observer threads
    /// have joined.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotStarted`] if the service was never
    /// started, or an I/O error from polling the process.
    pub fn wait_for(&self) -> Result<i32, ServiceError> {
        let (child, threads) = {
            let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
            let rt = runtime.as_mut().ok_or(ServiceError::NotStarted)?;
            (Arc::clone(&rt.child), std::mem::take(&mut rt.threads))
        };

        let code = loop {
            let polled = child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait()
                .map_err(|err| ServiceError::Io {
                    source: Arc::new(err),
                })?;
            if let Some(status) = polled {
                break exit_code_of(status);
            }
            thread::sleep(POLL_INTERVAL);
        };

        for handle in threads {
            if handle.join().is_err() {
                warn!(target: TARGET, service = self.config.label, "observer thread panicked");
            }
        }
        Ok(code)
    }

    /// True while the worker process is running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        runtime.as_ref().is_some_and(|rt| {
            matches!(
                rt.child
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .try_wait(),
                Ok(None)
            )
        })
    }

    /// Undecodable lines seen on the worker's stdout since startup.
    #[must_use]
    pub fn invalid_lines(&self) -> Vec<String> {
        self.invalid_lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Lines seen on the worker's stderr since startup.
    #[must_use]
    pub fn error_lines(&self) -> Vec<String> {
        self.error_lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // Graceful shutdown signal; the worker drains and exits.
        self.close();
    }
}

fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<()>, ServiceError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|err| ServiceError::Thread {
            name,
            source: Arc::new(err),
        })
}

fn stage_init_script(script: &str) -> Result<NamedTempFile, ServiceError> {
    let stage = || -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("taskpipe-init-")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(script.as_bytes())?;
        file.flush()?;
        Ok(file)
    };
    stage().map_err(|err| ServiceError::InitScript {
        source: Arc::new(err),
    })
}

/// Reads worker stdout, decoding responses and routing them by correlation
/// id. Decode failures and unknown ids are recorded or logged and skipped;
/// only stream closure or a read error ends the loop. Process death is the
/// monitor's business, not this loop's.
fn stdout_loop(
    stdout: ChildStdout,
    registry: &TaskRegistry,
    invalid_lines: &Mutex<Vec<String>>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                debug!(target: TARGET, "worker stdout closed");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: TARGET, error = %err, "stdout read failed");
                break;
            }
        }
        // Worker output is not guaranteed to be valid UTF-8; decode lossily
        // so one mangled line cannot end the stream.
        let line = String::from_utf8_lossy(&buf);
        match decode_response(&line) {
            Ok(response) => {
                registry.get(response.task()).map_or_else(
                    || {
                        debug!(
                            target: TARGET,
                            task = response.task(),
                            "response for unknown task ignored"
                        );
                    },
                    |task| task.handle(&response),
                );
            }
            Err(err) => {
                debug!(target: TARGET, error = %err, line = line.trim_end(), "invalid stdout line");
                invalid_lines
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(line.trim_end().to_owned());
            }
        }
    }
}

/// Captures worker stderr verbatim for diagnostics. Never parsed as
/// protocol.
fn stderr_loop(stderr: ChildStderr, error_lines: &Mutex<Vec<String>>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                debug!(target: TARGET, "worker stderr closed");
                break;
            }
            Ok(_) => {
                error_lines
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(String::from_utf8_lossy(&buf).trim_end().to_owned());
            }
            Err(err) => {
                debug!(target: TARGET, error = %err, "stderr read failed");
                break;
            }
        }
    }
}

/// Polls process and reader-thread liveness; once everything has stopped,
/// resolves every still-pending task to CRASHED with an aggregate
/// diagnostic, exactly once per task.
fn monitor_loop(
    child: &Mutex<Child>,
    stdout_done: &AtomicBool,
    stderr_done: &AtomicBool,
    registry: &TaskRegistry,
    invalid_lines: &Mutex<Vec<String>>,
    error_lines: &Mutex<Vec<String>>,
) {
    let exit_code = loop {
        let polled = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait();
        match polled {
            Ok(Some(status))
                if stdout_done.load(Ordering::Acquire) && stderr_done.load(Ordering::Acquire) =>
            {
                break exit_code_of(status);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(target: TARGET, error = %err, "worker liveness poll failed");
                break -1;
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    debug!(target: TARGET, exit_code, "worker termination detected");

    let pending = registry.drain();
    if pending.is_empty() {
        return;
    }
    warn!(
        target: TARGET,
        exit_code,
        pending = pending.len(),
        "worker died with pending tasks"
    );
    let message = crash_message(
        exit_code,
        &invalid_lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner),
        &error_lines.lock().unwrap_or_else(PoisonError::into_inner),
    );
    for task in pending {
        task.crash(&message);
    }
}

/// Assembles the diagnostic delivered to every task crashed by worker death.
fn crash_message(exit_code: i32, invalid_lines: &[String], error_lines: &[String]) -> String {
    let join = |lines: &[String]| {
        if lines.is_empty() {
            "<none>".to_owned()
        } else {
            lines.join("\n")
        }
    };
    format!(
        "Worker crashed with exit code {exit_code}.\n\n[stdout]\n{}\n\n[stderr]\n{}\n",
        join(invalid_lines),
        join(error_lines),
    )
}

fn exit_code_of(status: ExitStatus) -> i32 {
    // A signal-terminated worker has no code; report -1 like a generic
    // abnormal exit.
    status.code().unwrap_or(-1)
}
