#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tidepool::config::Config;
use tidepool::routes::build_router;
use tidepool::state::AppState;
use tidepool::terminal::mock::{MockProcess, MockSpawner};
use tidepool::terminal::shell::{Platform, ShellResolver};
use tidepool::terminal::{Session, SessionOptions};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub spawner: MockSpawner,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        let spawner = MockSpawner::new();
        let shells = ShellResolver::new(Platform::Unix, None).with_probe(|_| false);
        let state = AppState::with_shells(config, Arc::new(spawner.clone()), shells);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            spawner,
            handle,
        }
    }

    pub fn create_session(&self) -> (Arc<Session>, MockProcess) {
        let session = self
            .state
            .registry
            .create(SessionOptions::default())
            .unwrap();
        (session, self.spawner.last().unwrap())
    }

    pub fn url(&self, query: &str) -> String {
        format!("ws://{}/api/terminal/ws?{}", self.addr, query)
    }

    pub async fn connect(&self, query: &str) -> Socket {
        let (socket, _) = connect_async(self.url(query)).await.unwrap();
        socket
    }
}

/// Next JSON frame, skipping transport-level pings.
pub async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .expect("socket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

/// Reads until the server closes and returns the close code.
pub async fn close_code(socket: &mut Socket) -> u16 {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for close");
        match message {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) => panic!("close without a code"),
            Some(Ok(_)) => continue,
            Some(Err(err)) => panic!("socket error before close: {err}"),
            None => panic!("socket ended without a close frame"),
        }
    }
}

pub async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

/// Round-trips a ping so every frame sent before it has been handled.
pub async fn sync(socket: &mut Socket) {
    send_json(socket, json!({"type": "ping"})).await;
    assert_eq!(next_frame(socket).await, json!({"type": "pong"}));
}

pub async fn send_raw(socket: &mut Socket, text: &str) {
    socket.send(Message::Text(text.to_string())).await.unwrap();
}
