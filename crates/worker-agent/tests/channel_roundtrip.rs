//! Execution channel tests against a scripted in-process kernel.
//!
//! The fake kernel speaks just enough of the message protocol to drive the
//! client through its real code paths: REST kernel creation, the WebSocket
//! channel, result assembly, timeouts and stale-reply filtering.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{any, delete, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use worker_agent::reducer::ExecutionOutcome;
use worker_agent::{KernelClient, KernelConfig};

/// REST-side bookkeeping of the fake Jupyter server, so tests can assert
/// the kernel lifecycle calls the client makes.
#[derive(Default)]
struct KernelRegistry {
    created: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

async fn spawn_fake_kernel() -> (String, Arc<KernelRegistry>) {
    let registry = Arc::new(KernelRegistry::default());

    let create_registry = registry.clone();
    let delete_registry = registry.clone();
    let app = Router::new()
        .route(
            "/api/kernels",
            post(move || {
                let registry = create_registry.clone();
                async move {
                    let n = registry.created.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({ "id": format!("fake-kernel-{n}") }))
                }
            }),
        )
        .route(
            "/api/kernels/{id}",
            delete(move |Path(id): Path<String>| {
                let registry = delete_registry.clone();
                async move {
                    registry.deleted.lock().unwrap().push(id);
                    StatusCode::NO_CONTENT
                }
            }),
        )
        .route("/api/kernels/{id}/channels", any(ws_upgrade));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), registry)
}

async fn ws_upgrade(Path(_id): Path<String>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(run_kernel)
}

/// One connected kernel session with a tiny variable store, so state
/// observably persists across executes on the same channel.
async fn run_kernel(mut socket: WebSocket) {
    let mut vars: HashMap<String, i64> = HashMap::new();

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: Value = serde_json::from_str(text.as_str()).unwrap();
        let msg_id = request["header"]["msg_id"].as_str().unwrap().to_string();
        let code = request["content"]["code"].as_str().unwrap().trim().to_string();

        let mut replies: Vec<Value> = Vec::new();

        if let Some(assignment) = code.strip_prefix("set ") {
            let mut parts = assignment.split_whitespace();
            let name = parts.next().unwrap().to_string();
            let value: i64 = parts.next().unwrap().parse().unwrap();
            vars.insert(name, value);
            replies.push(reply(&msg_id, "status", json!({ "execution_state": "idle" })));
        } else if let Some(name) = code.strip_prefix("print ") {
            let value = vars.get(name).copied().unwrap_or_default();
            replies.push(reply(
                &msg_id,
                "stream",
                json!({ "name": "stdout", "text": format!("{value}\n") }),
            ));
            replies.push(reply(&msg_id, "status", json!({ "execution_state": "idle" })));
        } else if code == "plot" {
            replies.push(reply(
                &msg_id,
                "stream",
                json!({ "name": "stdout", "text": "rendering\n" }),
            ));
            replies.push(reply(
                &msg_id,
                "display_data",
                json!({ "data": { "image/png": "iVBORw0KGgoAAAANSUhEUg==" } }),
            ));
            replies.push(reply(&msg_id, "status", json!({ "execution_state": "idle" })));
        } else if code == "boom" {
            replies.push(reply(
                &msg_id,
                "error",
                json!({ "ename": "SyntaxError", "evalue": "invalid syntax" }),
            ));
        } else if code == "hang" {
            // Busy forever: never send the terminal idle.
            replies.push(reply(&msg_id, "status", json!({ "execution_state": "busy" })));
        } else {
            // Anything else (including the client's init snippet) succeeds
            // with no output.
            replies.push(reply(&msg_id, "status", json!({ "execution_state": "idle" })));
        }

        for value in replies {
            if socket
                .send(Message::Text(value.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

fn reply(msg_id: &str, msg_type: &str, content: Value) -> Value {
    json!({
        "msg_type": msg_type,
        "parent_header": { "msg_id": msg_id },
        "content": content,
    })
}

fn client_for(host: &str) -> KernelClient {
    KernelClient::new(KernelConfig {
        http_url: format!("http://{host}"),
        ws_url: format!("ws://{host}"),
        execution_timeout: Duration::from_millis(500),
    })
}

async fn connected_client() -> KernelClient {
    let (host, _registry) = spawn_fake_kernel().await;
    let client = client_for(&host);
    client.start().await.unwrap();
    client
}

#[tokio::test]
async fn state_persists_across_executes_on_one_channel() {
    let client = connected_client().await;

    let first = client.execute("set x 100").await;
    assert_eq!(first, ExecutionOutcome::Text(String::new()));

    let second = client.execute("print x").await;
    assert_eq!(second, ExecutionOutcome::Text("100\n".into()));
}

#[tokio::test]
async fn an_image_reply_beats_its_accompanying_text() {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let client = connected_client().await;

    let outcome = client.execute("plot").await;
    let ExecutionOutcome::Image(payload) = outcome else {
        panic!("expected an image outcome, got {outcome:?}");
    };

    // The payload is valid base64 and decodes to a PNG header.
    let bytes = BASE64.decode(payload).unwrap();
    assert_eq!(&bytes[..4], &[0x89, 0x50, 0x4E, 0x47]);
}

#[tokio::test]
async fn a_user_error_carries_the_exception_detail() {
    let client = connected_client().await;

    let outcome = client.execute("boom").await;
    match outcome {
        ExecutionOutcome::UserError(detail) => assert!(detail.contains("SyntaxError")),
        other => panic!("expected a user error, got {other:?}"),
    }
}

#[tokio::test]
async fn a_hung_execution_times_out() {
    let client = connected_client().await;

    let outcome = client.execute("hang").await;
    assert_eq!(outcome, ExecutionOutcome::TimedOut);
}

#[tokio::test]
async fn stale_replies_from_a_timed_out_execution_are_ignored() {
    let client = connected_client().await;

    client.execute("set x 7").await;
    assert_eq!(client.execute("hang").await, ExecutionOutcome::TimedOut);

    // The next request must see only its own replies, not leftovers
    // addressed to the timed-out message id.
    let outcome = client.execute("print x").await;
    assert_eq!(outcome, ExecutionOutcome::Text("7\n".into()));
}

#[tokio::test]
async fn the_channel_reports_healthy_only_once_connected() {
    let (host, _registry) = spawn_fake_kernel().await;
    let client = client_for(&host);
    assert!(!client.is_healthy().await);

    client.start().await.unwrap();
    assert!(client.is_healthy().await);
}

#[tokio::test]
async fn reset_replaces_the_kernel_and_drops_its_state() {
    let (host, registry) = spawn_fake_kernel().await;
    let client = client_for(&host);
    client.start().await.unwrap();

    client.execute("set x 41").await;
    assert_eq!(client.execute("print x").await, ExecutionOutcome::Text("41\n".into()));

    assert!(client.reset().await);

    // The old kernel was deleted over REST and a fresh one created.
    assert_eq!(registry.created.load(Ordering::SeqCst), 2);
    assert_eq!(
        *registry.deleted.lock().unwrap(),
        vec!["fake-kernel-1".to_string()]
    );

    // The replacement channel works and holds none of the old state.
    assert!(client.is_healthy().await);
    assert_eq!(client.execute("print x").await, ExecutionOutcome::Text("0\n".into()));
}
