//! End-to-end tests driving the real worker binary through the caller-side
//! service over actual pipes.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Map, json};

use taskpipe::{Service, ServiceConfig, TaskError, TaskStatus};
use taskpipe_protocol::ResponseType;

fn worker_service() -> Service {
    Service::new(ServiceConfig::new(env!("CARGO_BIN_EXE_taskpipe-worker")))
}

#[test]
fn progress_reports_arrive_in_order_and_complete() {
    let service = worker_service();
    let task = service.task("progress 91").expect("create task");

    let events: Arc<Mutex<Vec<(ResponseType, Option<i64>)>>> = Arc::default();
    {
        let events = Arc::clone(&events);
        task.listen(Box::new(move |event| {
            events
                .lock()
                .expect("events lock")
                .push((event.response_type(), event.current()));
        }))
        .expect("attach listener");
    }
    task.wait_for().expect("task succeeds");

    let seen = events.lock().expect("events lock");
    assert_eq!(seen.len(), 93);
    assert_eq!(seen[0].0, ResponseType::Launch);
    assert_eq!(seen[92].0, ResponseType::Completion);
    for (i, event) in seen[1..92].iter().enumerate() {
        assert_eq!(event.0, ResponseType::Update);
        assert_eq!(event.1, Some(i64::try_from(i).expect("index")));
    }
    assert_eq!(task.result(), Some(json!(91)));
}

#[test]
fn inputs_are_bound_into_the_payload() {
    let service = worker_service();
    let mut inputs = Map::new();
    inputs.insert("greeting".to_owned(), json!("hello worker"));
    let task = service
        .task_with("bind greeting", inputs, None)
        .expect("create task");
    task.wait_for().expect("task succeeds");

    assert_eq!(task.result(), Some(json!("hello worker")));
    assert_eq!(task.status(), TaskStatus::Complete);
}

#[test]
fn payload_failure_surfaces_status_and_diagnostic() {
    let service = worker_service();
    let task = service.task("fail boom").expect("create task");

    let err = task.wait_for().expect_err("task fails");
    match err {
        TaskError::Unsuccessful { status, message } => {
            assert_eq!(status, TaskStatus::Failed);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(task.error(), Some("boom".to_owned()));
}

#[test]
fn cancellation_is_acknowledged() {
    let service = worker_service();
    let task = service.task("await-cancel").expect("create task");
    task.start().expect("start task");
    thread::sleep(Duration::from_millis(50));
    task.cancel().expect("request cancel");

    let err = task.wait_for().expect_err("task is canceled");
    match err {
        TaskError::Unsuccessful { status, .. } => assert_eq!(status, TaskStatus::Canceled),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn main_queue_tasks_run_one_at_a_time() {
    let service = worker_service();
    let first = service
        .task_with("sleep 30\nresult 1", Map::new(), Some("main"))
        .expect("create first task");
    let second = service
        .task_with("result 2", Map::new(), Some("main"))
        .expect("create second task");

    let order: Arc<Mutex<Vec<String>>> = Arc::default();
    for (label, task) in [("first", &first), ("second", &second)] {
        let order = Arc::clone(&order);
        task.listen(Box::new(move |event| {
            order
                .lock()
                .expect("order lock")
                .push(format!("{label}:{:?}", event.response_type()));
        }))
        .expect("attach listener");
    }
    first.start().expect("start first");
    second.start().expect("start second");
    first.wait_for().expect("first succeeds");
    second.wait_for().expect("second succeeds");

    let seen = order.lock().expect("order lock");
    let first_done = seen
        .iter()
        .position(|entry| entry == "first:Completion")
        .expect("first completes");
    let second_launch = seen
        .iter()
        .position(|entry| entry == "second:Launch")
        .expect("second launches");
    assert!(
        first_done < second_launch,
        "main queue interleaved: {seen:?}"
    );
}

#[test]
fn panicking_payload_resolves_as_thread_death() {
    let service = worker_service();
    let task = service.task("panic boom").expect("create task");

    let err = task.wait_for().expect_err("task fails");
    match err {
        TaskError::Unsuccessful { status, message } => {
            assert_eq!(status, TaskStatus::Failed);
            assert_eq!(message, "thread death");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn worker_death_crashes_every_pending_task() {
    let service = worker_service();
    let bystander = service.task("await-cancel").expect("create bystander");
    bystander.start().expect("start bystander");
    let doomed = service.task("sleep 50\nexit 3").expect("create doomed task");

    let err = doomed.wait_for().expect_err("task crashes");
    match err {
        TaskError::Unsuccessful { status, message } => {
            assert_eq!(status, TaskStatus::Crashed);
            assert!(message.contains("exit code 3"), "message: {message}");
            assert!(message.contains("[stderr]"), "message: {message}");
        }
        other => panic!("unexpected error: {other}"),
    }

    // The unrelated in-flight task is crashed by the same sweep.
    let err = bystander.wait_for().expect_err("bystander crashes");
    match err {
        TaskError::Unsuccessful { status, .. } => assert_eq!(status, TaskStatus::Crashed),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!service.is_alive());
}

#[test]
fn init_script_exports_are_visible_to_tasks() {
    let config =
        ServiceConfig::new(env!("CARGO_BIN_EXE_taskpipe-worker")).init_script("export base 99");
    let service = Service::new(config);
    let task = service.task("bind base").expect("create task");
    task.wait_for().expect("task succeeds");

    assert_eq!(task.result(), Some(json!(99)));
}

#[test]
fn close_drains_and_the_worker_exits_cleanly() {
    let service = worker_service();
    let task = service.task("result 1").expect("create task");
    task.wait_for().expect("task succeeds");

    service.close();
    let code = service.wait_for().expect("worker exits");
    assert_eq!(code, 0);
}
