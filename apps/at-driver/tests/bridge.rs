#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use at_driver::applescript::{Script, ScriptError, ScriptRunner};
use at_driver::config::Config;
use at_driver::modules::MacOsModule;
use at_driver::platform::Platform;
use at_driver::voice::{VoiceEndpoint, VoiceOptions};
use at_driver::Driver;
use at_driver_proto::{CommandRequest, Method, Response, ServerMessage, SUB_PROTOCOL};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Default)]
struct RecordingRunner {
    scripts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ScriptRunner for RecordingRunner {
    async fn exec(&self, script: &Script) -> Result<Option<String>, ScriptError> {
        self.scripts.lock().unwrap().push(script.source().to_string());
        Ok(None)
    }
}

struct Harness {
    driver: Driver,
    socket: PathBuf,
    scripts: Arc<Mutex<Vec<String>>>,
    _dir: TempDir,
}

async fn start() -> Harness {
    start_with(None).await
}

async fn start_with(metrics: Option<PrometheusHandle>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("at_driver_generic").join("driver.socket");
    let runner = RecordingRunner::default();
    let scripts = Arc::clone(&runner.scripts);
    let module = MacOsModule::new(runner).with_version_command(["echo", "14.4"]);
    let config = Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        platform: Platform::MacOs,
        voice_endpoint: VoiceEndpoint::UnixSocket(socket.clone()),
        voice: VoiceOptions::default(),
    };
    let driver = Driver::start(module, &config, metrics).await.unwrap();
    Harness {
        driver,
        socket,
        scripts,
        _dir: dir,
    }
}

async fn connect(harness: &Harness) -> Client {
    let mut request = format!("ws://{}/", harness.driver.local_addr())
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUB_PROTOCOL),
    );
    let (client, _) = connect_async(request).await.unwrap();
    client
}

async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string())).await.unwrap();
}

async fn recv_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn command(client: &mut Client, request: Value) -> Value {
    send_text(client, &request.to_string()).await;
    recv_json(client).await
}

async fn request(client: &mut Client, request: &CommandRequest) -> Response {
    send_text(client, &serde_json::to_string(request).unwrap()).await;
    match serde_json::from_value(recv_json(client).await).unwrap() {
        ServerMessage::Response(response) => response,
        ServerMessage::Event(event) => panic!("expected a response, got {event:?}"),
    }
}

async fn http_get(harness: &Harness, path: &str) -> String {
    let mut stream = TcpStream::connect(harness.driver.local_addr()).await.unwrap();
    let head = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn speak(socket: &Path, packet: &str) {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream.write_all(packet.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn session_keys_and_captured_speech() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let session = command(
        &mut client,
        json!({"id": 1, "method": "session.new", "params": {"capabilities": {}}}),
    )
    .await;
    assert_eq!(session["id"], 1);
    assert!(!session["result"]["sessionId"].as_str().unwrap().is_empty());
    assert_eq!(
        session["result"]["capabilities"],
        json!({"atName": "Voiceover", "atVersion": "14.4", "platformName": "macos"})
    );

    let pressed = command(
        &mut client,
        json!({"id": 2, "method": "interaction.pressKeys", "params": {"keys": [" "]}}),
    )
    .await;
    assert_eq!(pressed, json!({"id": 2, "result": {}}));
    {
        let scripts = harness.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("key down 49"), "{}", scripts[0]);
    }

    speak(&harness.socket, "speech:done").await;
    assert_eq!(
        recv_json(&mut client).await,
        json!({"method": "interaction.capturedOutput", "params": {"data": "done"}})
    );

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn repeated_session_new_keeps_the_session() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let first = request(&mut client, &CommandRequest::new(1, Method::SessionNew, json!({}))).await;
    let second = request(&mut client, &CommandRequest::new(2, Method::SessionNew, json!({}))).await;
    assert!(first.is_success() && second.is_success());
    assert_eq!(second.id().and_then(|id| id.as_u64()), Some(2));
    match (first, second) {
        (Response::Success { result: a, .. }, Response::Success { result: b, .. }) => {
            assert_eq!(a["sessionId"], b["sessionId"]);
        }
        other => panic!("expected two sessions, got {other:?}"),
    }

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn binary_frames_are_answered_like_text() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let command = CommandRequest::new(3, Method::InteractionPressKeys, json!({"keys": ["a"]}));
    client
        .send(Message::Binary(serde_json::to_vec(&command).unwrap()))
        .await
        .unwrap();
    let reply: ServerMessage = serde_json::from_value(recv_json(&mut client).await).unwrap();

    assert_eq!(
        reply,
        ServerMessage::Response(Response::success(3.into(), json!({})))
    );
    assert_eq!(harness.scripts.lock().unwrap().len(), 1);

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn handshake_without_sub_protocol_is_rejected() {
    let harness = start().await;

    let result = connect_async(format!("ws://{}/", harness.driver.local_addr())).await;
    match result {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 422),
        other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
    }

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn only_sessioned_clients_hear_speech() {
    let harness = start().await;
    let mut listener = connect(&harness).await;
    let mut bystander = connect(&harness).await;

    command(&mut listener, json!({"id": 1, "method": "session.new"})).await;
    // A round trip guarantees the bystander is registered before speech arrives.
    let reply = command(&mut bystander, json!({"id": 1, "method": "session.open"})).await;
    assert_eq!(reply["error"], "unknown command");

    speak(&harness.socket, "lifecycle:ready").await;
    speak(&harness.socket, "speech:hello").await;

    assert_eq!(
        recv_json(&mut listener).await,
        json!({"method": "interaction.capturedOutput", "params": {"data": "hello"}})
    );
    let quiet = tokio::time::timeout(Duration::from_millis(300), bystander.next()).await;
    assert!(quiet.is_err(), "bystander received {quiet:?}");

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn every_failure_class_is_reported_on_an_open_connection() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let cases = [
        (
            "not JSON".to_string(),
            json!({"id": null, "error": "unable to parse message", "message": "Unable to parse message: \"not JSON\"."}),
        ),
        (
            "[]".to_string(),
            json!({"id": null, "error": "malformed message", "message": "Malformed message: \"[]\"."}),
        ),
        (
            r#"{"id": 1, "type": "foobar"}"#.to_string(),
            json!({"id": 1, "error": "unrecognized message type", "message": "Unrecognized message type: \"{\"id\": 1, \"type\": \"foobar\"}\"."}),
        ),
        (
            r#"{"method": "session.new"}"#.to_string(),
            json!({"id": null, "error": "missing id", "message": "Command missing required \"id\": \"{\"method\": \"session.new\"}\"."}),
        ),
        (
            r#"{"id": 5, "method": "interaction.scroll"}"#.to_string(),
            json!({"id": 5, "error": "unknown command", "message": "Unrecognized command name: \"interaction.scroll\"."}),
        ),
        (
            r#"{"id": 6, "method": "interaction.pressKeys", "params": {"keys": ["df daf% ?"]}}"#
                .to_string(),
            json!({"id": 6, "error": "unknown error", "message": "Invalid key code specified."}),
        ),
        (
            r#"{"id": 7, "method": "interaction.pressKeys", "params": {"keys": ["\ue001"]}}"#
                .to_string(),
            json!({"id": 7, "error": "unknown error", "message": "unknown key (\\ue001)"}),
        ),
    ];

    for (raw, expected) in cases {
        send_text(&mut client, &raw).await;
        assert_eq!(recv_json(&mut client).await, expected, "for {raw}");
    }
    assert!(harness.scripts.lock().unwrap().is_empty());

    // Still usable afterwards.
    let session = command(&mut client, json!({"id": 8, "method": "session.new"})).await;
    assert_eq!(session["id"], 8);

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn health_endpoint_answers_plain_http() {
    let harness = start().await;

    let response = http_get(&harness, "/healthz").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with(r#"{"status":"ok"}"#), "{response}");

    // No recorder was handed over, so there is nothing to scrape.
    let metrics = http_get(&harness, "/metrics").await;
    assert!(metrics.starts_with("HTTP/1.1 404"), "{metrics}");

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn metrics_endpoint_renders_prometheus_text() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let harness = start_with(Some(recorder.handle())).await;

    let response = http_get(&harness, "/metrics").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(
        response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"),
        "{response}"
    );

    harness.driver.shutdown().await.unwrap();
}

#[test_timeout::timeout]
async fn shutdown_removes_the_voice_socket() {
    let harness = start().await;
    let socket = harness.socket.clone();
    assert!(socket.exists());

    harness.driver.shutdown().await.unwrap();
    assert!(!socket.exists());
}
