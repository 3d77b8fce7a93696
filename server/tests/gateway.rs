//! End-to-end tests: the real router on an ephemeral port, a WebSocket device
//! client, and a local webhook receiver.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use hookgate::delivery::webhook::WebhookClient;
use hookgate::delivery::{QueueSettings, RetryPolicy};
use hookgate::models::{Account, ForwardingRule, HttpMethod, LogStatus, TriggerKind};
use hookgate::session::SessionSettings;
use hookgate::store::memory::MemoryStore;
use hookgate::store::Stores;
use hookgate::{routes, AppState, Config, DeliveryQueue};

type DeviceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY: &str = "key-1";

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Records every webhook call it receives.
#[derive(Clone, Default)]
struct Hooks {
    calls: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

impl Hooks {
    fn calls(&self) -> Vec<(Option<String>, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

async fn receive_hook(
    State(hooks): State<Hooks>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let secret = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    hooks.calls.lock().unwrap().push((secret, body));
    StatusCode::OK
}

async fn start_webhook_receiver() -> (String, Hooks) {
    let hooks = Hooks::default();
    let app = Router::new()
        .route("/hook", post(receive_hook))
        .with_state(hooks.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}/hook"), hooks)
}

struct Gateway {
    addr: SocketAddr,
    state: AppState,
    store: Arc<MemoryStore>,
    _dir: tempfile::TempDir,
}

fn fast_session() -> SessionSettings {
    SessionSettings {
        auth_timeout: Duration::from_secs(5),
        ping_interval: Duration::from_secs(5),
        read_timeout: Duration::from_secs(10),
        write_timeout: Duration::from_secs(2),
        max_message_size: 8192,
    }
}

async fn start_gateway(session: SessionSettings, webhook_url: Option<&str>) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    store
        .add_account(Account {
            id: user_id,
            api_key: API_KEY.into(),
        })
        .await;
    if let Some(url) = webhook_url {
        store
            .add_rule(ForwardingRule {
                id: 0,
                user_id,
                device_id: None,
                trigger: TriggerKind::Sms,
                sender_filter: None,
                content_filter: None,
                webhook_url: url.into(),
                method: HttpMethod::Post,
                secret_header: Some("s3cret".into()),
                is_active: true,
            })
            .await;
    }

    let stores = Stores::from_memory(store.clone());
    let queue = DeliveryQueue::start(
        QueueSettings {
            dir: dir.path().to_path_buf(),
            workers: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                attempt_timeout: Duration::from_secs(2),
                backoff_base: Duration::from_millis(20),
                backoff_max: Duration::from_millis(100),
            },
            compact_threshold: 100,
        },
        Arc::new(WebhookClient::new(Duration::from_secs(2)).unwrap()),
        stores.logs.clone(),
    )
    .await
    .unwrap();

    let mut state = AppState::new(Config::default(), stores, queue);
    state.session = session;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::router(state.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    Gateway {
        addr,
        state,
        store,
        _dir: dir,
    }
}

async fn connect(gw: &Gateway) -> DeviceSocket {
    let url = format!("ws://{}/api/device/ws", gw.addr);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut DeviceSocket, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn next_json(ws: &mut DeviceSocket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket ended")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait until the server closes the socket.
async fn expect_closed(ws: &mut DeviceSocket) {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("socket was not closed");
        match next {
            None | Some(Err(_) | Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(other)) => panic!("unexpected frame before close: {other:?}"),
        }
    }
}

/// Authenticate as `device_uid`; returns the assigned device id.
async fn authenticate(ws: &mut DeviceSocket, device_uid: &str) -> Uuid {
    send_json(
        ws,
        json!({"type": "AUTH", "data": {"api_key": API_KEY, "device_uid": device_uid}}),
    )
    .await;
    let reply = next_json(ws).await;
    assert_eq!(reply["type"], "AUTH_OK", "unexpected reply: {reply}");
    reply["data"]["device_id"].as_str().unwrap().parse().unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Inbound events → webhooks
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sms_is_delivered_to_matching_webhook() {
    let (url, hooks) = start_webhook_receiver().await;
    let gw = start_gateway(fast_session(), Some(&url)).await;
    let mut ws = connect(&gw).await;
    let device_id = authenticate(&mut ws, "phone-1").await;

    send_json(
        &mut ws,
        json!({"type": "SMS_RECEIVED", "data": {
            "sender": "+84901234567",
            "content": "Your code is 1234",
            "sim_slot": 1,
            "timestamp": 1_714_557_600_000_i64
        }}),
    )
    .await;

    wait_until(|| async { !hooks.calls().is_empty() }).await;
    let (secret, body) = hooks.calls().remove(0);
    assert_eq!(secret.as_deref(), Some("s3cret"));
    assert_eq!(body["type"], "sms");
    assert_eq!(body["device_id"], device_id.to_string());
    assert_eq!(body["sender"], "+84901234567");
    assert_eq!(body["content"], "Your code is 1234");

    let store = gw.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .logs()
                .await
                .first()
                .is_some_and(|(_, r)| r.status == LogStatus::Delivered)
        }
    })
    .await;
    let (_, record) = gw.store.logs().await.remove(0);
    assert_eq!(record.history, vec![LogStatus::Pending, LogStatus::Delivered]);

    // Exactly one call for one event and one rule.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hooks.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_gets_pong_and_bad_frames_are_dropped() {
    let gw = start_gateway(fast_session(), None).await;
    let mut ws = connect(&gw).await;
    let device_id = authenticate(&mut ws, "phone-1").await;

    // Oversized, malformed and unknown frames leave the session up.
    for size in [10_000, 200_000] {
        let huge = "x".repeat(size);
        send_json(&mut ws, json!({"type": "SMS_RECEIVED", "data": {"sender": "a", "content": huge}})).await;
    }
    ws.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut ws, json!({"type": "SELFIE", "data": {}})).await;

    send_json(&mut ws, json!({"type": "PING", "data": {"battery": 55, "signal": 4}})).await;
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "PONG");
    assert!(pong["data"]["timestamp"].is_string());

    let store = gw.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.device(device_id).await.is_some_and(|d| d.battery == 55) }
    })
    .await;
    assert!(gw.state.registry.is_online(device_id).await);
    assert!(gw.store.logs().await.is_empty());
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_auth_times_out_without_registering() {
    let mut session = fast_session();
    session.auth_timeout = Duration::from_millis(200);
    let gw = start_gateway(session, None).await;
    let mut ws = connect(&gw).await;

    let notice = next_json(&mut ws).await;
    assert_eq!(notice["type"], "AUTH_FAIL");
    assert_eq!(notice["data"]["error"], "authentication timeout");
    expect_closed(&mut ws).await;
    assert!(gw.state.registry.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_rejections() {
    let gw = start_gateway(fast_session(), None).await;

    let mut ws = connect(&gw).await;
    send_json(
        &mut ws,
        json!({"type": "AUTH", "data": {"api_key": "wrong", "device_uid": "phone-1"}}),
    )
    .await;
    let notice = next_json(&mut ws).await;
    assert_eq!(notice["type"], "AUTH_FAIL");
    assert_eq!(notice["data"]["error"], "invalid api key");
    expect_closed(&mut ws).await;

    let mut ws = connect(&gw).await;
    send_json(&mut ws, json!({"type": "PING", "data": {"battery": 1}})).await;
    let notice = next_json(&mut ws).await;
    assert_eq!(notice["data"]["error"], "expected AUTH message");
    expect_closed(&mut ws).await;

    assert!(gw.state.registry.is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_auth_replaces_first_session() {
    let gw = start_gateway(fast_session(), None).await;

    let mut first = connect(&gw).await;
    let device_id = authenticate(&mut first, "phone-1").await;
    let first_session = gw.state.registry.lookup(device_id).await.unwrap().session_id;

    let mut second = connect(&gw).await;
    assert_eq!(authenticate(&mut second, "phone-1").await, device_id);

    expect_closed(&mut first).await;
    let info = gw.state.registry.lookup(device_id).await.unwrap();
    assert_ne!(info.session_id, first_session);
    assert_eq!(gw.state.registry.len().await, 1);

    // The replaced session's teardown must not mark its successor offline.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(gw.store.device(device_id).await.unwrap().online);

    send_json(&mut second, json!({"type": "PING", "data": {}})).await;
    assert_eq!(next_json(&mut second).await["type"], "PONG");

    // Closing the survivor unregisters it and marks the device offline.
    second.close(None).await.unwrap();
    let registry = gw.state.registry.clone();
    wait_until(|| {
        let registry = registry.clone();
        async move { registry.is_empty().await }
    })
    .await;
    let store = gw.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.device(device_id).await.is_some_and(|d| !d.online) }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_eviction_marks_device_offline() {
    let gw = start_gateway(fast_session(), None).await;
    let mut ws = connect(&gw).await;
    let device_id = authenticate(&mut ws, "phone-1").await;
    assert!(gw.store.device(device_id).await.unwrap().online);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let evicted = gw.state.registry.sweep_idle(Duration::from_millis(1)).await;
    assert_eq!(evicted, vec![device_id]);
    expect_closed(&mut ws).await;

    let store = gw.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.device(device_id).await.is_some_and(|d| !d.online) }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_device_hits_read_deadline() {
    let mut session = fast_session();
    session.read_timeout = Duration::from_millis(300);
    let gw = start_gateway(session, None).await;
    let mut ws = connect(&gw).await;
    let device_id = authenticate(&mut ws, "phone-1").await;

    // Never read: the client cannot answer pings, so nothing arrives inbound.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(!gw.state.registry.is_online(device_id).await);
    expect_closed(&mut ws).await;
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_sms_round_trip() {
    let gw = start_gateway(fast_session(), None).await;
    let mut ws = connect(&gw).await;
    let device_id = authenticate(&mut ws, "phone-1").await;
    let http = reqwest::Client::new();
    let send_url = format!("http://{}/api/sms/send", gw.addr);

    let resp = http
        .post(&send_url)
        .json(&json!({"phone": "+84901234567", "content": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .post(&send_url)
        .bearer_auth(API_KEY)
        .json(&json!({"phone": "+84901234567", "content": "hello", "sim_slot": 2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["status"], "queued");
    assert_eq!(receipt["device_id"], device_id.to_string());
    let request_id = receipt["request_id"].as_str().unwrap().to_string();

    let command = next_json(&mut ws).await;
    assert_eq!(command["type"], "SEND_SMS");
    assert_eq!(command["data"]["request_id"], request_id);
    assert_eq!(command["data"]["phone"], "+84901234567");
    assert_eq!(command["data"]["sim_slot"], 2);

    send_json(&mut ws, json!({"type": "SMS_SENT", "data": {"request_id": request_id}})).await;
    let log_id: u64 = request_id.parse().unwrap();
    let store = gw.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move { store.log(log_id).await.is_some_and(|r| r.status == LogStatus::Sent) }
    })
    .await;

    let online: Value = http
        .get(format!("http://{}/api/devices/online", gw.addr))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(online["devices"][0]["device_id"], device_id.to_string());

    let resp = http
        .post(&send_url)
        .bearer_auth(API_KEY)
        .json(&json!({"phone": "abc", "content": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_reports_online_devices() {
    let gw = start_gateway(fast_session(), None).await;
    let mut ws = connect(&gw).await;
    authenticate(&mut ws, "phone-1").await;

    let body: Value = reqwest::get(format!("http://{}/api/health", gw.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["devices_online"], 1);
}
