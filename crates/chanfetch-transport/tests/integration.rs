//! End-to-end tests: servers and clients talking over one in-process channel.

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chanfetch_transport::{
    Channel, EmulatedRequest, EmulatedResponse, Envelope, FetchOptions, Method, RequestEnvelope,
    Result, ServerState, TransportConfig, TransportError,
};
use common::{echo_json, users_api, TestLink};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct User {
    id: u64,
    name: String,
}

#[tokio::test]
async fn test_json_body_round_trip() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(echo_json);
    server.listen().unwrap();
    let client = link.client("A");

    let payload = json!({"name": "Alice", "tags": ["x", "y"], "nested": {"n": 1.5}});
    let res = client.post("/echo", payload.clone()).await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.header("content-type"), Some("application/json"));
    assert_eq!(res.json::<Value>().unwrap(), payload);
}

async fn json_text(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    res.end_with(r#"{"a":1}"#);
    Ok(())
}

async fn plain_text(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    res.end_with("plain text");
    Ok(())
}

#[tokio::test]
async fn test_end_reinterprets_text() {
    let link = TestLink::new();
    let json_server = link.server("json");
    json_server.on_request(json_text);
    json_server.listen().unwrap();
    let text_server = link.server("text");
    text_server.on_request(plain_text);
    text_server.listen().unwrap();

    let res = link.client("json").get("/").await.unwrap();
    assert_eq!(res.body_value(), Some(&json!({"a": 1})));
    assert_eq!(res.json::<Value>().unwrap()["a"], 1);

    let res = link.client("text").get("/").await.unwrap();
    assert_eq!(res.body_value(), Some(&json!("plain text")));
    assert_eq!(res.text().unwrap(), "plain text");
}

async fn answer_a(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    res.end_with("from A");
    Ok(())
}

async fn answer_b(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    res.json(&json!(999));
    Ok(())
}

#[tokio::test]
async fn test_instances_share_one_channel() {
    let link = TestLink::new();
    let server_a = link.server("A");
    server_a.on_request(answer_a);
    server_a.listen().unwrap();
    let server_b = link.server("B");
    server_b.on_request(answer_b);
    server_b.listen().unwrap();

    let client_a = link.client("A");
    let client_b = link.client("B");

    let res = client_a.get("/x").await.unwrap();
    assert_eq!(res.text().unwrap(), "from A");
    assert_eq!(client_b.pending_count(), 0);
    assert_eq!(client_b.correlation_stats().tracked, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server_a.stats().dispatched, 1);
    assert_eq!(server_b.stats().dispatched, 0);
    assert_eq!(server_b.stats().ignored, 1);
    // only server A answered
    assert_eq!(link.server_end.sent_count(), 1);

    let res = client_b.get("/x").await.unwrap();
    assert_eq!(res.json::<u32>().unwrap(), 999);
}

#[tokio::test]
async fn test_create_user() {
    let link = TestLink::new();
    let server = link.server("api");
    server.on_request(users_api);
    server.listen().unwrap();
    let client = link.client("api");

    let res = client
        .post("/api/users", json!({"name": "Alice"}))
        .await
        .unwrap();
    assert_eq!(res.status(), 201);
    assert!(res.ok());
    let user: User = res.json().unwrap();
    assert_eq!(user.id, 1);
    assert_eq!(user.name, "Alice");

    let res = client.get("/api/nothing").await.unwrap();
    assert_eq!(res.status(), 404);
    assert!(!res.ok());
    assert_eq!(res.text().unwrap(), "not found");
}

async fn flaky(req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    if req.path() == "/boom" {
        return Err(TransportError::HandlerError {
            message: "exploded while handling".to_string(),
        });
    }
    res.end_with("still here");
    Ok(())
}

#[tokio::test]
async fn test_failing_handler_reports_500_and_keeps_serving() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(flaky);
    server.listen().unwrap();
    let client = link.client("A");

    let err = client.get("/boom").await.unwrap_err();
    assert_eq!(err.status(), 500);
    let remote = err.remote().unwrap();
    assert!(remote.message.contains("exploded while handling"));
    assert_eq!(remote.response.status(), 500);

    assert_eq!(server.state(), ServerState::Listening);
    let res = client.get("/fine").await.unwrap();
    assert_eq!(res.text().unwrap(), "still here");
}

async fn ends_repeatedly(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    assert!(res.end_with("first"));
    assert!(!res.end_with("second"));
    assert!(!res.end());
    assert!(!res.json(&json!({"third": true})));
    Ok(())
}

#[tokio::test]
async fn test_repeated_end_sends_once() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(ends_repeatedly);
    server.listen().unwrap();
    let client = link.client("A");

    let res = client.get("/").await.unwrap();
    assert_eq!(res.text().unwrap(), "first");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(link.server_end.sent_count(), 1);
    assert_eq!(server.stats().errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out() {
    let link = TestLink::new();
    let client = link.client_with(
        TransportConfig::new()
            .with_instance_id("nobody-home")
            .with_timeout(Duration::from_millis(500)),
    );
    let err = client.get("/void").await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.status(), 408);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.correlation_stats().timed_out, 1);
}

async fn never_answers(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    res.finished().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_disposes_inflight_responses() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(never_answers);
    server.listen().unwrap();
    let client = Arc::new(link.client_with(
        TransportConfig::new()
            .with_instance_id("A")
            .with_timeout(Duration::from_secs(2)),
    ));

    let waiting = client.clone();
    let call = tokio::spawn(async move { waiting.get("/hang").await });
    while server.inflight_count() == 0 {
        tokio::task::yield_now().await;
    }

    server.close();
    assert_eq!(server.state(), ServerState::Closed);
    assert_eq!(server.inflight_count(), 0);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout { .. }));
    assert_eq!(link.server_end.sent_count(), 0);
}

#[tokio::test]
async fn test_dispose_rejects_pending_calls() {
    let link = TestLink::new();
    let client = Arc::new(link.client("A"));
    let waiting = client.clone();
    let call = tokio::spawn(async move { waiting.get("/pending").await });
    while client.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    client.dispose();
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_closed());
    assert_eq!(err.status(), 503);
    assert!(matches!(
        client.get("/after").await,
        Err(TransportError::Disposed)
    ));
}

async fn delayed(req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    let ms: u64 = req
        .query()
        .get("ms")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    res.end_with(ms.to_string());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_complete_out_of_order() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(delayed);
    server.listen().unwrap();
    let client = Arc::new(link.client("A"));

    let finished = Arc::new(Mutex::new(Vec::new()));
    let mut calls = Vec::new();
    for ms in [300u64, 100, 200] {
        let client = client.clone();
        let finished = finished.clone();
        calls.push(tokio::spawn(async move {
            let res = client.get(&format!("/wait?ms={}", ms)).await.unwrap();
            let text = res.text().unwrap();
            finished.lock().unwrap().push(text.clone());
            text
        }));
    }
    let mut answers = Vec::new();
    for call in calls {
        answers.push(call.await.unwrap());
    }
    assert_eq!(answers, vec!["300", "100", "200"]);
    assert_eq!(*finished.lock().unwrap(), vec!["100", "200", "300"]);
}

async fn echo_header(req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    let trace = req.header("x-trace-id").unwrap_or("missing").to_string();
    res.set_header("X-Trace-Id", trace);
    res.end();
    Ok(())
}

#[tokio::test]
async fn test_headers_flow_both_ways() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(echo_header);
    server.listen().unwrap();
    let client = link.client("A");

    let res = client
        .fetch(
            "/trace",
            FetchOptions::new(Method::Get).header("X-Trace-Id", "abc123"),
        )
        .await
        .unwrap();
    assert_eq!(res.header("x-trace-id"), Some("abc123"));
    assert!(res.body_value().is_none());
}

async fn binary(_req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    res.write([0u8, 159]);
    res.end_with([255u8]);
    Ok(())
}

#[tokio::test]
async fn test_binary_body_survives() {
    let link = TestLink::new();
    let server = link.server("A");
    server.on_request(binary);
    server.listen().unwrap();
    let client = link.client("A");

    let res = client.get("/blob").await.unwrap();
    assert_eq!(res.bytes().unwrap().as_ref(), &[0u8, 159, 255]);
}

#[tokio::test]
async fn test_untagged_request_in_compat_mode() {
    let link = TestLink::new();
    let server = link.server_with(
        TransportConfig::new()
            .with_instance_id("A")
            .with_accept_untagged(true),
    );
    server.on_request(echo_json);
    server.listen().unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = link.client_end.subscribe(Arc::new(move |m| {
        let _ = tx.send(m);
    }));
    let raw = RequestEnvelope::new("legacy-1", Method::Post, "/")
        .with_body(Some(json!({"v": 1})));
    link.client_end
        .send(Envelope::from(raw).to_value().unwrap())
        .unwrap();

    let answer = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let answer = Envelope::from_value(answer).unwrap();
    assert_eq!(answer.id(), "legacy-1");
    assert_eq!(answer.instance_id(), None);
}

#[tokio::test]
async fn test_peer_gone_fails_fast() {
    let link = TestLink::new();
    let client = link.client("A");
    link.server_end.disconnect();
    let err = client.get("/x").await.unwrap_err();
    assert!(matches!(err, TransportError::ChannelClosed));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_pair_built_from_config_file() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
instanceId = "shared"
timeout = 1000
maxMessageSize = 4096
logging = "none"
"#
    )
    .unwrap();
    let config = TransportConfig::from_file(file.path()).unwrap();
    assert!(!config.init_logging());

    let link = TestLink::new();
    let server = link.server_with(config.clone());
    server.on_request(users_api);
    server.listen().unwrap();
    let client = link.client_with(config);
    assert_eq!(client.instance_id(), server.instance_id());

    let res = client
        .post("/api/users", json!({"name": "Bob"}))
        .await
        .unwrap();
    assert_eq!(res.json::<User>().unwrap().name, "Bob");

    let err = client
        .post("/api/users", json!({"name": "x".repeat(8192)}))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::MessageTooLarge { .. }));
}
