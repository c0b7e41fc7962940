//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parley_realtime::protocol::{ClientEvent, ServerEvent};
use parley_realtime::server::{ChatHub, ChatServer, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and its hub.
pub async fn start_test_server() -> (u16, Arc<ChatHub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = ChatServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    });
    let hub = server.hub();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, hub)
}

pub async fn connect(port: u16) -> Ws {
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _) = timeout(Duration::from_secs(2), tokio_tungstenite::connect_async(&url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

pub async fn send(ws: &mut Ws, event: ClientEvent) {
    ws.send(Message::Text(event.encode().unwrap().into())).await.unwrap();
}

/// Next server event, skipping control frames.
pub async fn recv(ws: &mut Ws) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return ServerEvent::decode(text.as_str()).unwrap();
        }
    }
}

/// Assert no event arrives within `ms`.
pub async fn assert_silent(ws: &mut Ws, ms: u64) {
    match timeout(Duration::from_millis(ms), ws.next()).await {
        Err(_) => {}
        Ok(other) => panic!("Expected silence, got {other:?}"),
    }
}

/// Poll `check` until it holds, for up to 3 seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition not met within 3s");
}
