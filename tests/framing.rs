//! Wire protocol tests: framing and envelope encoding over the in-process
//! pipe transport, no tracee required.

use godbg::service::proto::{Request, Response, RpcError, CODE_BAD_REQUEST};
use godbg::service::transport::{PipeListener, PipeTransport, Transport};
use serde_json::json;
use std::thread;

#[test]
fn test_request_response_roundtrip_across_threads() {
    let (mut server_side, mut client_side) = PipeTransport::pair().unwrap();

    let server = thread::spawn(move || {
        // echo server: respond with the request id and method as result
        for _ in 0..3 {
            let message = server_side.read_message().unwrap();
            let request: Request = serde_json::from_value(message).unwrap();
            let response = Response::result(
                request.id,
                json!({ "method": request.method, "params": request.params }),
            );
            server_side
                .write_message(&serde_json::to_value(&response).unwrap())
                .unwrap();
        }
    });

    for (id, method) in [(1, "state"), (2, "list_breakpoints"), (3, "continue")] {
        let request = Request {
            id,
            method: method.to_string(),
            params: json!({ "n": id }),
        };
        client_side
            .write_message(&serde_json::to_value(&request).unwrap())
            .unwrap();

        let raw = client_side.read_message().unwrap();
        let response: Response = serde_json::from_value(raw).unwrap();
        assert_eq!(response.id, id);
        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["method"], method);
        assert_eq!(result["params"]["n"], json!(id));
    }

    server.join().unwrap();
}

#[test]
fn test_pipe_listener_yields_preconnected_stream() {
    let (mut listener, mut client_side) = PipeListener::bind().unwrap();

    let client = thread::spawn(move || {
        client_side
            .write_message(&json!({"id": 1, "method": "process_pid", "params": {}}))
            .unwrap();
        let response = client_side.read_message().unwrap();
        assert_eq!(response["id"], json!(1));
    });

    let mut stream = listener.accept().unwrap();
    let request = stream.read_message().unwrap();
    assert_eq!(request["method"], json!("process_pid"));
    stream
        .write_message(&json!({"id": 1, "result": {"pid": 42}}))
        .unwrap();

    client.join().unwrap();
}

#[test]
fn test_error_envelope() {
    let (mut server_side, mut client_side) = PipeTransport::pair().unwrap();

    let response = Response::error(
        7,
        RpcError {
            code: CODE_BAD_REQUEST,
            message: "unknown method: frobnicate".to_string(),
            data: None,
        },
    );
    server_side
        .write_message(&serde_json::to_value(&response).unwrap())
        .unwrap();

    let raw = client_side.read_message().unwrap();
    let decoded: Response = serde_json::from_value(raw).unwrap();
    assert_eq!(decoded.id, 7);
    assert!(decoded.result.is_none());
    let error = decoded.error.unwrap();
    assert_eq!(error.code, CODE_BAD_REQUEST);
    assert!(error.message.contains("frobnicate"));
}

#[test]
fn test_large_payload_framing() {
    let (mut server_side, mut client_side) = PipeTransport::pair().unwrap();

    // a payload spanning many pipe buffer pages must arrive intact
    let blob: String = "x".repeat(1024 * 256);
    let request = json!({"id": 9, "method": "eval", "params": {"expression": blob}});

    let expected = request.clone();
    let writer = thread::spawn(move || {
        client_side.write_message(&request).unwrap();
    });

    let received = server_side.read_message().unwrap();
    assert_eq!(received, expected);
    writer.join().unwrap();
}
