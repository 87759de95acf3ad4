/*
[INPUT]:  Test configuration and mock venue requirements
[OUTPUT]: Shared test utilities, fixtures, and a local websocket venue
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for venue-stream tests

#![allow(dead_code)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use venue_stream::{DataEvent, StreamConfig};

pub const WAIT: Duration = Duration::from_secs(5);

/// Local websocket endpoint standing in for the venue
pub struct MockVenue {
    pub url: String,
    conns: mpsc::UnboundedReceiver<MockConn>,
}

/// Server side of one accepted socket
pub struct MockConn {
    received: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Option<String>>,
}

impl MockVenue {
    /// Bind on an ephemeral port and accept sockets in the background
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (conn_tx, conns) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else { continue };
                let (received_tx, received) = mpsc::unbounded_channel();
                let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Option<String>>();
                if conn_tx.send(MockConn { received, outbound }).is_err() {
                    break;
                }

                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            out = outbound_rx.recv() => match out {
                                Some(Some(text)) => {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                _ => {
                                    let _ = write.send(Message::Close(None)).await;
                                    break;
                                }
                            },
                            incoming = read.next() => match incoming {
                                Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                                    let _ = write.send(Message::Text("pong".into())).await;
                                }
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text.to_string());
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });
            }
        });

        Self { url, conns }
    }

    /// Wait for the next client socket
    pub async fn accept(&mut self) -> MockConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("no client connected in time")
            .expect("listener stopped")
    }
}

impl MockConn {
    /// Next text frame from the client, parsed as JSON
    pub async fn recv_json(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("no frame from client in time")
            .expect("client socket closed");
        serde_json::from_str(&text).expect("client sent invalid json")
    }

    /// Assert nothing arrives within `window`
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(text)) = tokio::time::timeout(window, self.received.recv()).await {
            panic!("unexpected frame from client: {text}");
        }
    }

    pub fn send_json(&self, value: Value) {
        self.outbound.send(Some(value.to_string())).unwrap();
    }

    pub fn send_raw(&self, text: &str) {
        self.outbound.send(Some(text.to_string())).unwrap();
    }

    /// Close the socket from the venue side
    pub fn close(&self) {
        let _ = self.outbound.send(None);
    }
}

/// Public-only config pointed at a mock venue with fast timers
pub fn test_config(url: &str) -> StreamConfig {
    let mut config = StreamConfig::public_only(url);
    config.request_timeout_secs = 2;
    config.sweep_interval_secs = 1;
    config.reconnect.base_delay_secs = 1;
    config.reconnect.max_delay_secs = 1;
    config.reconnect.max_attempts = 3;
    config
}

/// Receive sink events until `pick` returns a value
pub async fn wait_for_event<T>(
    rx: &mut mpsc::Receiver<DataEvent>,
    mut pick: impl FnMut(DataEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("sink closed");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    })
    .await
    .expect("expected event not published in time")
}

/// Load a JSON fixture from tests/fixtures
pub fn fixture(name: &str) -> Value {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    let text = std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {path}: {e}"));
    serde_json::from_str(&text).unwrap()
}

/// Build a venue order book push
pub fn book_push(channel: &str, inst_id: &str, action: &str, data: Value) -> Value {
    serde_json::json!({
        "arg": {"channel": channel, "instId": inst_id},
        "action": action,
        "data": [data],
    })
}
