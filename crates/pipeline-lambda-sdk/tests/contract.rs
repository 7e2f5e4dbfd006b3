//! The contract as seen from the platform shim: frames in, replies out.

use pipeline_lambda_sdk::ipc::{read_frame, write_frame, InvocationFrame};
use pipeline_lambda_sdk::prelude::*;
use std::io::Cursor;

#[test]
fn test_proxy_event_through_frames() {
    let event = json!({
        "body": "{\"pipeline\": \"ndvi\", \"params\": {\"time\": \"2018-06-01\"}}",
        "queryStringParameters": {"format": "png"}
    });

    let mut wire = Vec::new();
    write_frame(
        &mut wire,
        &json!({"event": event, "context": {"awsRequestId": "abc-123", "deadlineMs": 1}}),
    )
    .unwrap();

    let frame: InvocationFrame = read_frame(&mut Cursor::new(wire)).unwrap().unwrap();
    assert_eq!(frame.context.request_id.as_str(), "abc-123");

    let request = PipelineRequest::from_event(&frame.event).unwrap();
    assert_eq!(request.target, PipelineTarget::Named("ndvi".into()));
    assert_eq!(request.output_format, OutputFormat::Png);
    assert_eq!(request.params["time"], json!("2018-06-01"));
}

#[test]
fn test_replies_keep_failures_apart_from_envelopes() {
    let envelope = InvocationReply::from(Ok::<_, InvocationError>(
        InvocationError::execution("engine exited").to_response(),
    ));
    let failure = InvocationReply::from(Err::<Response, _>(InvocationError::cold_start(
        "layer-1 missing",
    )));

    let mut wire = Vec::new();
    write_frame(&mut wire, &envelope).unwrap();
    write_frame(&mut wire, &failure).unwrap();

    let mut reader = Cursor::new(wire);
    let first: JsonValue = read_frame(&mut reader).unwrap().unwrap();
    let second: JsonValue = read_frame(&mut reader).unwrap().unwrap();
    assert!(read_frame::<_, JsonValue>(&mut reader).unwrap().is_none());

    assert_eq!(first["statusCode"], json!(500));
    assert_eq!(first["headers"]["X-Error-Kind"], json!("ExecutionError"));
    assert_eq!(second, json!({"errorType": "ColdStartError", "errorMessage": "layer-1 missing"}));
}
