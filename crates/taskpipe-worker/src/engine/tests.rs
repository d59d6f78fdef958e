//! Unit tests for the dispatch engine, driven end to end over in-memory
//! streams.

use std::io::Cursor;

use rstest::rstest;
use serde_json::json;

use taskpipe_protocol::{Response, ResponseType, encode_request};

use super::*;
use crate::directive::DirectiveRunner;
use crate::testing::SharedBuf;

fn run_worker(requests: &[Request]) -> Vec<Response> {
    let buffer = SharedBuf::default();
    let worker = Worker::new(DirectiveRunner::new(), Box::new(buffer.clone()));
    let mut input = String::new();
    for request in requests {
        input.push_str(&encode_request(request).expect("encodable request"));
        input.push('\n');
    }
    worker.run(Cursor::new(input)).expect("worker run");
    buffer.lines()
}

fn run_script(task: &str, script: &str, queue: Option<&str>) -> Vec<Response> {
    run_worker(&[Request::execute(
        task,
        script,
        Map::new(),
        queue.map(str::to_owned),
    )])
}

fn of_type(responses: &[Response], ty: ResponseType) -> Vec<Response> {
    responses
        .iter()
        .filter(|r| r.response_type() == ty)
        .cloned()
        .collect()
}

#[test]
fn execute_reports_launch_then_completion() {
    let responses = run_script("t1", "result 5", None);

    assert_eq!(responses[0].response_type(), ResponseType::Launch);
    let done = of_type(&responses, ResponseType::Completion);
    assert_eq!(done.len(), 1);
    let outputs = done[0].outputs().expect("outputs");
    assert_eq!(outputs["result"], json!(5));
}

#[rstest]
#[case::scalar_result("result 42", json!({"result": 42}))]
#[case::object_merges("result {\"a\": 1, \"b\": 2}", json!({"a": 1, "b": 2}))]
#[case::no_result("sleep 1", json!({}))]
fn completion_outputs_classify_the_result(#[case] script: &str, #[case] expected: Value) {
    let responses = run_script("t1", script, None);

    let done = of_type(&responses, ResponseType::Completion);
    let outputs = done[0].outputs().expect("outputs");
    assert_eq!(Value::Object(outputs.clone()), expected);
}

#[test]
fn inputs_are_bound_into_the_script() {
    let mut inputs = Map::new();
    inputs.insert("name".to_owned(), json!("taskpipe"));
    let responses = run_worker(&[Request::execute("t1", "bind name", inputs, None)]);

    let done = of_type(&responses, ResponseType::Completion);
    let outputs = done[0].outputs().expect("outputs");
    assert_eq!(outputs["result"], json!("taskpipe"));
}

#[test]
fn failing_script_reports_failure() {
    let responses = run_script("t1", "fail no good", None);

    let failed = of_type(&responses, ResponseType::Failure);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error(), Some("no good"));
    assert!(of_type(&responses, ResponseType::Completion).is_empty());
}

#[test]
fn main_queue_runs_tasks_serially_in_order() {
    let responses = run_worker(&[
        Request::execute("a", "sleep 20\nresult 1", Map::new(), Some("main".to_owned())),
        Request::execute("b", "result 2", Map::new(), Some("main".to_owned())),
    ]);

    let a_done = responses
        .iter()
        .position(|r| r.task() == "a" && r.response_type() == ResponseType::Completion)
        .expect("a completes");
    let b_launch = responses
        .iter()
        .position(|r| r.task() == "b" && r.response_type() == ResponseType::Launch)
        .expect("b launches");
    assert!(a_done < b_launch, "main queue interleaved its tasks");
}

#[test]
fn exports_are_visible_to_later_tasks() {
    let responses = run_worker(&[
        Request::execute("a", "export base 10", Map::new(), Some("main".to_owned())),
        Request::execute("b", "bind base", Map::new(), Some("main".to_owned())),
    ]);

    let done = of_type(&responses, ResponseType::Completion);
    let b = done.iter().find(|r| r.task() == "b").expect("b completes");
    let outputs = b.outputs().expect("outputs");
    assert_eq!(outputs["result"], json!(10));
}

#[test]
fn cancel_resolves_the_task_with_cancelation() {
    let responses = run_worker(&[
        Request::execute("t1", "await-cancel", Map::new(), None),
        Request::cancel("t1"),
    ]);

    let canceled = of_type(&responses, ResponseType::Cancelation);
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].task(), "t1");
    assert!(of_type(&responses, ResponseType::Completion).is_empty());
}

#[test]
fn cancel_for_unknown_task_is_ignored() {
    let responses = run_worker(&[Request::cancel("ghost")]);
    assert!(responses.is_empty());
}

#[test]
fn panicking_script_is_reported_as_thread_death() {
    let responses = run_script("t1", "panic boom", None);

    let failed = of_type(&responses, ResponseType::Failure);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error(), Some(THREAD_DEATH));
}

#[test]
fn panicking_main_queue_script_does_not_kill_the_queue() {
    let responses = run_worker(&[
        Request::execute("a", "panic boom", Map::new(), Some("main".to_owned())),
        Request::execute("b", "result 2", Map::new(), Some("main".to_owned())),
    ]);

    let failed = of_type(&responses, ResponseType::Failure);
    assert_eq!(failed[0].task(), "a");
    assert_eq!(failed[0].error(), Some(THREAD_DEATH));
    let done = of_type(&responses, ResponseType::Completion);
    assert_eq!(done[0].task(), "b");
}

#[test]
fn malformed_request_lines_are_skipped() {
    let buffer = SharedBuf::default();
    let worker = Worker::new(DirectiveRunner::new(), Box::new(buffer.clone()));
    let execute = encode_request(&Request::execute("t1", "result 1", Map::new(), None))
        .expect("encodable request");
    let input = format!("not json at all\n{{\"partial\": true}}\n{execute}\n");
    worker.run(Cursor::new(input)).expect("worker run");

    let responses = buffer.lines();
    let done = of_type(&responses, ResponseType::Completion);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].task(), "t1");
}

#[test]
fn invalid_utf8_request_line_does_not_stop_intake() {
    let buffer = SharedBuf::default();
    let worker = Worker::new(DirectiveRunner::new(), Box::new(buffer.clone()));
    let execute = encode_request(&Request::execute("t1", "result 1", Map::new(), None))
        .expect("encodable request");
    let mut input: Vec<u8> = vec![0xFF, 0xFE, b'f', b'f', b'\n'];
    input.extend_from_slice(execute.as_bytes());
    input.push(b'\n');
    worker.run(Cursor::new(input)).expect("worker run");

    let responses = buffer.lines();
    let done = of_type(&responses, ResponseType::Completion);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].task(), "t1");
}

#[test]
fn cancel_while_queued_skips_launch_entirely() {
    // The blocker keeps the main queue busy long enough for the receiver to
    // process the CANCEL before the victim ever starts executing.
    let responses = run_worker(&[
        Request::execute("blocker", "sleep 100", Map::new(), Some("main".to_owned())),
        Request::execute("victim", "result 1", Map::new(), Some("main".to_owned())),
        Request::cancel("victim"),
    ]);

    let victim: Vec<_> = responses.iter().filter(|r| r.task() == "victim").collect();
    assert_eq!(victim.len(), 1, "victim responses: {victim:?}");
    assert_eq!(victim[0].response_type(), ResponseType::Cancelation);
}

#[test]
fn shutdown_waits_for_in_flight_tasks() {
    let responses = run_script("t1", "sleep 80\nresult 1", None);

    // run() only returns once the drain completes, so the terminal response
    // must already be in the buffer.
    let done = of_type(&responses, ResponseType::Completion);
    assert_eq!(done.len(), 1);
}
