//! The request dispatch engine.
//!
//! A [`Worker`] owns one end of the pipe pair: it reads request lines from
//! the input stream on the calling thread and fans execution out. Tasks with
//! the `"main"` queue hint run one at a time, in arrival order, on a
//! dedicated serial thread; everything else gets a thread of its own. A
//! janitor thread sweeps finished task threads and reports a FAILURE for any
//! that died without sending a terminal response, so a panicking payload
//! still resolves its task on the caller side.
//!
//! End of input is the shutdown signal: the engine stops accepting work,
//! lets the main queue drain, waits for in-flight task threads, and returns.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use std::{env, fs, thread};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use taskpipe_protocol::{Request, RequestType, decode_request};

use crate::error::WorkerError;
use crate::runner::ScriptRunner;
use crate::task::{ResponseSink, THREAD_DEATH, WorkerTask};

/// Tracing target for dispatch engine operations.
const TARGET: &str = "taskpipe_worker::engine";

/// Environment variable naming a file whose contents run once, before any
/// requests are read, with a discarded response stream.
pub const INIT_SCRIPT_ENV: &str = "TASKPIPE_INIT_SCRIPT";

/// Queue hint routing a task onto the serial main queue.
const MAIN_QUEUE: &str = "main";

/// Janitor sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// One accepted EXECUTE request awaiting or undergoing execution.
struct Job {
    task: Arc<WorkerTask>,
    script: String,
    inputs: Map<String, Value>,
}

/// FIFO queue feeding the serial main-queue thread.
#[derive(Default)]
struct MainQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    closed: bool,
}

/// A per-task execution thread tracked by the janitor.
struct TaskThread {
    task: Arc<WorkerTask>,
    handle: thread::JoinHandle<()>,
}

type TaskMap = Arc<Mutex<HashMap<String, Arc<WorkerTask>>>>;
type Exports = Arc<Mutex<Map<String, Value>>>;

/// The worker-side dispatch engine.
///
/// Generic over the [`ScriptRunner`] that executes payloads; the engine
/// itself only routes requests, threads, and responses.
pub struct Worker<R: ScriptRunner> {
    runner: Arc<R>,
    sink: ResponseSink,
}

impl<R: ScriptRunner> Worker<R> {
    /// Creates an engine emitting responses on the given writer.
    #[must_use]
    pub fn new(runner: R, writer: Box<dyn Write + Send>) -> Self {
        Self {
            runner: Arc::new(runner),
            sink: ResponseSink::new(writer),
        }
    }

    /// Reads requests from `input` until end of stream, then drains all
    /// in-flight work and returns.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Thread`] if an engine thread cannot be
    /// spawned. Malformed request lines and payload failures are reported
    /// per task, never escalated here.
    pub fn run(self, mut input: impl BufRead) -> Result<(), WorkerError> {
        let exports: Exports = Arc::default();
        if let Ok(path) = env::var(INIT_SCRIPT_ENV) {
            self.run_init(&path, &exports);
        }

        let tasks: TaskMap = Arc::default();
        let threads: Arc<Mutex<Vec<TaskThread>>> = Arc::default();
        let drained = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(MainQueue::default());

        let main_handle = {
            let runner = Arc::clone(&self.runner);
            let main_exports = Arc::clone(&exports);
            let main_tasks = Arc::clone(&tasks);
            let main_queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("main-queue".into())
                .spawn(move || main_loop(&runner, &main_exports, &main_tasks, &main_queue))
                .map_err(|err| WorkerError::Thread {
                    name: "main-queue".into(),
                    source: Arc::new(err),
                })?
        };
        let janitor_handle = {
            let swept_threads = Arc::clone(&threads);
            let swept_tasks = Arc::clone(&tasks);
            let janitor_drained = Arc::clone(&drained);
            thread::Builder::new()
                .name("janitor".into())
                .spawn(move || janitor_loop(&swept_threads, &swept_tasks, &janitor_drained))
                .map_err(|err| WorkerError::Thread {
                    name: "janitor".into(),
                    source: Arc::new(err),
                })?
        };

        let mut buf = Vec::new();
        loop {
            buf.clear();
            match input.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(target: TARGET, error = %err, "request stream read failed");
                    break;
                }
            }
            // Request intake must outlive protocol noise: a line of raw
            // bytes is decoded lossily and then skipped like any other
            // malformed request.
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            let request = match decode_request(&line) {
                Ok(request) => request,
                Err(err) => {
                    warn!(target: TARGET, error = %err, "skipping malformed request line");
                    continue;
                }
            };
            match request.request_type() {
                RequestType::Execute => self.accept(request, &exports, &tasks, &threads, &queue),
                RequestType::Cancel => {
                    let found = tasks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(request.task())
                        .cloned();
                    found.map_or_else(
                        || {
                            debug!(
                                target: TARGET,
                                task = request.task(),
                                "cancel for unknown task, ignoring"
                            );
                        },
                        |task| task.request_cancel(),
                    );
                }
            }
        }

        // End of input: finish whatever is queued or running, then leave.
        {
            let mut state = queue.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
        }
        queue.available.notify_all();
        if main_handle.join().is_err() {
            warn!(target: TARGET, "main queue thread panicked");
        }
        drained.store(true, Ordering::Release);
        if janitor_handle.join().is_err() {
            warn!(target: TARGET, "janitor thread panicked");
        }
        Ok(())
    }

    fn accept(
        &self,
        request: Request,
        exports: &Exports,
        tasks: &TaskMap,
        threads: &Mutex<Vec<TaskThread>>,
        queue: &MainQueue,
    ) {
        let uuid = request.task().to_owned();
        let script = request.script().unwrap_or_default().to_owned();
        let inputs = request.inputs().cloned().unwrap_or_default();
        let task = Arc::new(WorkerTask::new(
            uuid.clone(),
            self.sink.clone(),
            Arc::clone(exports),
        ));
        tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uuid.clone(), Arc::clone(&task));
        let job = Job {
            task: Arc::clone(&task),
            script,
            inputs,
        };

        if request.queue() == Some(MAIN_QUEUE) {
            {
                let mut state = queue.state.lock().unwrap_or_else(PoisonError::into_inner);
                state.jobs.push_back(job);
            }
            queue.available.notify_one();
            return;
        }

        let spawned = {
            let runner = Arc::clone(&self.runner);
            let job_exports = Arc::clone(exports);
            let job_tasks = Arc::clone(tasks);
            thread::Builder::new()
                .name(format!("task-{uuid}"))
                .spawn(move || {
                    execute_job(runner.as_ref(), &job_exports, &job);
                    job_tasks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(job.task.uuid());
                })
        };
        match spawned {
            Ok(handle) => {
                threads
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(TaskThread { task, handle });
            }
            Err(err) => {
                tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&uuid);
                task.fail(&format!("failed to spawn task thread: {err}"));
            }
        }
    }

    fn run_init(&self, path: &str, exports: &Exports) {
        let script = match fs::read_to_string(path) {
            Ok(script) => script,
            Err(err) => {
                warn!(target: TARGET, path, error = %err, "failed to read init script");
                return;
            }
        };
        let task = WorkerTask::new("init", ResponseSink::null(), Arc::clone(exports));
        let bindings = exports.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Err(err) = self.runner.run(&task, &script, &bindings) {
            warn!(target: TARGET, error = %err, "init script failed");
        }
    }
}

/// Runs one job to a terminal response.
///
/// A task cancelled while still queued is acknowledged without launching.
/// The runner's return value is classified here: an object merges into the
/// outputs, any other non-null value becomes `outputs["result"]`. The
/// closing `complete` is a no-op when the payload already sent its own
/// terminal response, such as a cancellation acknowledgement.
fn execute_job<R: ScriptRunner>(runner: &R, exports: &Mutex<Map<String, Value>>, job: &Job) {
    if job.task.cancel_requested() {
        job.task.cancel();
        return;
    }
    job.task.launch();
    let mut bindings = exports.lock().unwrap_or_else(PoisonError::into_inner).clone();
    bindings.extend(job.inputs.clone());
    match runner.run(&job.task, &job.script, &bindings) {
        Ok(result) => {
            match result {
                Some(Value::Object(map)) => job.task.merge_outputs(map),
                Some(Value::Null) | None => {}
                Some(value) => job.task.output("result", value),
            }
            job.task.complete();
        }
        Err(err) => job.task.fail(err.message()),
    }
}

/// Serial executor for main-queue jobs, in arrival order.
///
/// A panicking payload must not take the queue down with it, so each job
/// runs under `catch_unwind` and a panic resolves that task as a failure.
fn main_loop<R: ScriptRunner>(
    runner: &Arc<R>,
    exports: &Exports,
    tasks: &TaskMap,
    queue: &MainQueue,
) {
    loop {
        let job = {
            let mut state = queue.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break Some(job);
                }
                if state.closed {
                    break None;
                }
                state = queue
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(job) = job else { break };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            execute_job(runner.as_ref(), exports, &job);
        }));
        if outcome.is_err() {
            job.task.fail(THREAD_DEATH);
        }
        tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job.task.uuid());
    }
}

/// Sweeps finished task threads.
///
/// A thread that finished without its task reaching a terminal state died
/// mid-flight, most likely to a panic; the sweep resolves such tasks with a
/// FAILURE so the caller is not left waiting forever. Runs until the engine
/// has stopped accepting work and every tracked thread has been reaped.
fn janitor_loop(threads: &Mutex<Vec<TaskThread>>, tasks: &TaskMap, drained: &AtomicBool) {
    loop {
        let (finished, empty) = {
            let mut held = threads.lock().unwrap_or_else(PoisonError::into_inner);
            let mut finished = Vec::new();
            let mut i = 0;
            while i < held.len() {
                if held[i].handle.is_finished() {
                    finished.push(held.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            (finished, held.is_empty())
        };
        for entry in finished {
            if !entry.task.is_terminal() {
                entry.task.fail(THREAD_DEATH);
            }
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(entry.task.uuid());
            if entry.handle.join().is_err() {
                debug!(target: TARGET, task = entry.task.uuid(), "task thread panicked");
            }
        }
        if empty && drained.load(Ordering::Acquire) {
            break;
        }
        thread::sleep(SWEEP_INTERVAL);
    }
}

#[cfg(test)]
mod tests;
