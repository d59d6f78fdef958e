//! Unit tests for the line codec.

use rstest::rstest;
use serde_json::{Map, Value, json};

use super::*;
use crate::message::ResponseType;

fn map_of(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Request round trips
// ---------------------------------------------------------------------------

#[test]
fn execute_request_round_trip() {
    let request = Request::execute(
        "t1",
        "result 42",
        map_of(&[("x", json!(1)), ("y", json!("two"))]),
        None,
    );
    let line = encode_request(&request).expect("encode");
    let back = decode_request(&line).expect("decode");
    assert_eq!(back, request);
}

#[test]
fn cancel_request_round_trip() {
    let request = Request::cancel("t1");
    let line = encode_request(&request).expect("encode");
    assert_eq!(decode_request(&line).expect("decode"), request);
}

// ---------------------------------------------------------------------------
// Response round trips, one per response type
// ---------------------------------------------------------------------------

#[rstest]
#[case::launch(Response::launch("t1"))]
#[case::update(Response::update("t1", Some("step".to_owned()), Some(3), Some(10)))]
#[case::completion(Response::completion("t1", map_of(&[("result", json!(91))])))]
#[case::cancelation(Response::cancelation("t1"))]
#[case::failure(Response::failure("t1", "NameError: boom"))]
#[case::crash(Response::crash("t1", "worker crashed with exit code 9"))]
fn response_round_trip(#[case] response: Response) {
    let line = encode_response(&response).expect("encode");
    let back = decode_response(&line).expect("decode");
    assert_eq!(back, response);
}

#[test]
fn response_with_info_round_trip() {
    let response =
        Response::update("t1", None, None, None).with_info(map_of(&[("stage", json!("ingest"))]));
    let line = encode_response(&response).expect("encode");
    let back = decode_response(&line).expect("decode");
    assert_eq!(back.info(), response.info());
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[rstest]
#[case::not_json("this is not json")]
#[case::wrong_shape(r#"{"task":42}"#)]
#[case::unknown_type(r#"{"task":"t1","responseType":"EXPLODE"}"#)]
#[case::empty("")]
fn decode_response_rejects_malformed_lines(#[case] line: &str) {
    assert!(matches!(
        decode_response(line),
        Err(ProtocolError::Decode(_))
    ));
}

#[test]
fn decode_trims_surrounding_whitespace() {
    let line = "  {\"task\":\"t1\",\"responseType\":\"LAUNCH\"}\n";
    let response = decode_response(line).expect("decode");
    assert_eq!(response.response_type(), ResponseType::Launch);
}
