//! Shared helpers: start a real server on 127.0.0.1:0 and drive it over HTTP
//! and WebSocket.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_server::db::memory::MemoryStore;
use relay_server::db::sqlite::SqliteStore;
use relay_server::db::SharedStore;
use relay_server::hub::{Hub, HubBuilder, HubSettings};
use relay_server::lifecycle::LifecycleTracker;
use relay_server::routes;
use relay_server::state::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on every wait for a server reaction.
pub const WAIT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub hub: Hub,
    pub tracker: Arc<LifecycleTracker>,
    pub http: reqwest::Client,
    _data_dir: Option<tempfile::TempDir>,
}

/// Settings fast enough for tests: cheap KDF, no rate limiting.
pub fn test_settings() -> HubSettings {
    HubSettings {
        kdf_iterations: 1_000,
        auth_rate_burst: 0,
        ..HubSettings::default()
    }
}

pub async fn start_test_server() -> TestServer {
    start_with(test_settings()).await
}

pub async fn start_with(settings: HubSettings) -> TestServer {
    start_on_store(settings, Arc::new(MemoryStore::new()), None).await
}

pub async fn start_sqlite_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();
    let store = SqliteStore::open(&data_dir).expect("Failed to open SQLite store");
    start_on_store(test_settings(), Arc::new(store), Some(tmp_dir)).await
}

async fn start_on_store(
    settings: HubSettings,
    store: SharedStore,
    data_dir: Option<tempfile::TempDir>,
) -> TestServer {
    let tracker = LifecycleTracker::new("test");
    let hub = HubBuilder::new(settings, store, tracker.clone())
        .with_default_handlers()
        .start()
        .expect("Failed to start hub");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = AppState::new(hub.clone());
    tokio::spawn(async move {
        routes::serve(listener, state).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        hub,
        tracker,
        http: reqwest::Client::new(),
        _data_dir: data_dir,
    }
}

impl TestServer {
    pub async fn post_credentials(
        &self,
        path: &str,
        username: &str,
        password: &str,
    ) -> reqwest::Response {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .unwrap()
    }

    /// Register and return (userID, ticket).
    pub async fn register(&self, username: &str, password: &str) -> (String, String) {
        let resp = self.post_credentials("/register", username, password).await;
        assert_eq!(resp.status(), 200, "Registration failed for {}", username);
        grant(resp).await
    }

    /// Log in and return (userID, ticket).
    pub async fn login(&self, username: &str, password: &str) -> (String, String) {
        let resp = self.post_credentials("/login", username, password).await;
        assert_eq!(resp.status(), 200, "Login failed for {}", username);
        grant(resp).await
    }

    pub fn upgrade_url(&self, user_id: &str, ticket: &str) -> String {
        format!("ws://{}/upgrade?id={}&t={}", self.addr, user_id, ticket)
    }

    pub async fn connect(&self, user_id: &str, ticket: &str) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(self.upgrade_url(user_id, ticket))
            .await
            .expect("WebSocket upgrade should succeed");
        ws
    }

    /// HTTP status of a refused upgrade.
    pub async fn upgrade_status(&self, url: &str) -> u16 {
        match tokio_tungstenite::connect_async(url).await {
            Ok(_) => panic!("upgrade unexpectedly succeeded"),
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => resp.status().as_u16(),
            Err(e) => panic!("unexpected upgrade error: {}", e),
        }
    }

    /// Register a fresh user and open its connection. Returns (ws, userID).
    pub async fn join(&self, username: &str) -> (Ws, String) {
        let (user_id, ticket) = self.register(username, "pass").await;
        let ws = self.connect(&user_id, &ticket).await;
        (ws, user_id)
    }

    /// Poll until no connection tasks remain on the tracker.
    pub async fn wait_for_connection_tasks_to_drain(&self) {
        tokio::time::timeout(WAIT, async {
            loop {
                let busy = self
                    .tracker
                    .tracked_names()
                    .iter()
                    .any(|name| name.starts_with("connection_") || name.starts_with("dispatch::"));
                if !busy {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection tasks leaked: {:?}", self.tracker.tracked_names()));
    }

    /// Shut down and wait for every tracked task.
    pub async fn shutdown_and_drain(&self) {
        self.hub.shutdown();
        tokio::time::timeout(WAIT, self.tracker.wait())
            .await
            .unwrap_or_else(|_| panic!("tasks leaked: {:?}", self.tracker.tracked_names()));
        assert_eq!(self.tracker.count(), 0);
        assert!(self.tracker.tracked_names().is_empty());
    }
}

/// Serve `app` on a fresh port with no graceful shutdown hook, so it keeps
/// accepting after the hub stops.
pub async fn serve_detached(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    addr
}

async fn grant(resp: reqwest::Response) -> (String, String) {
    let body: Value = resp.json().await.unwrap();
    (
        body["userID"].as_str().unwrap().to_string(),
        body["ticket"].as_str().unwrap().to_string(),
    )
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON envelope, skipping control frames.
pub async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("receive error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

/// Read until the server closes; returns the close frame if one was sent.
pub async fn expect_close(ws: &mut Ws) -> Option<CloseFrame> {
    loop {
        match tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(Message::Text(text))) => panic!("unexpected message before close: {}", text),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Assert no envelope arrives within `window`.
pub async fn expect_silence(ws: &mut Ws, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected message: {}", text),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("connection ended unexpectedly: {:?}", other),
        }
    }
}

pub async fn whoami(ws: &mut Ws, nonce: &str) -> Value {
    send_json(ws, json!({ "type": "whoami", "n": nonce })).await;
    recv_json(ws).await
}
