/*
[INPUT]:  WebSocket URL, ping settings, shared inbound queue
[OUTPUT]: Raw inbound frames on the queue and a cloneable send handle
[POS]:    WebSocket layer - one transport per logical socket
[UPDATE]: When changing keepalive, framing or close handling
*/

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PingMode;
use crate::error::{Result, StreamError};
use crate::ratelimit::RateLimiter;
use crate::types::ConnectionKind;

const OUTBOUND_BUFFER: usize = 100;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const TEXT_PONG: &str = "pong";

/// What the read loop puts on the shared dispatcher queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Data { kind: ConnectionKind, payload: String },
    /// Last frame a connection ever emits
    Closed {
        kind: ConnectionKind,
        reason: Option<String>,
    },
}

/// Anything that can put a text frame on a logical socket
#[async_trait]
pub trait FrameSender: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    async fn send(&self, text: String) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub ping: PingMode,
    pub ping_interval: Duration,
}

/// Handle to a live websocket.
///
/// The writer task is the only writer and runs the keepalive timer; a
/// separate reader task forwards inbound frames, so a full dispatcher
/// queue never holds back sends or pings. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    kind: ConnectionKind,
    outbound_tx: mpsc::Sender<WsMessage>,
    rate_limiter: Arc<dyn RateLimiter>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Dial `url` and start the reader and writer tasks
    pub async fn connect(
        url: &str,
        kind: ConnectionKind,
        options: ConnectionOptions,
        inbound_tx: mpsc::Sender<InboundFrame>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Result<Self> {
        let (ws_stream, _response) = connect_async(url).await?;
        info!(%kind, url, "ws connected");

        let (mut write, read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(OUTBOUND_BUFFER);
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut reader = tokio::spawn(read_loop(read, kind, inbound_tx.clone()));
            let mut reader_done = false;
            let mut ping = tokio::time::interval_at(
                Instant::now() + options.ping_interval,
                options.ping_interval,
            );
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let reason = loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break "closed locally".to_string(),
                    outbound = outbound_rx.recv() => {
                        let Some(message) = outbound else {
                            break "all senders dropped".to_string();
                        };
                        if let Err(err) = write.send(message).await {
                            break format!("write failed: {err}");
                        }
                    }
                    _ = ping.tick() => {
                        let frame = match &options.ping {
                            PingMode::Control => WsMessage::Ping(Vec::new().into()),
                            PingMode::Text(text) => WsMessage::Text(text.clone().into()),
                        };
                        if let Err(err) = write.send(frame).await {
                            break format!("ping failed: {err}");
                        }
                    }
                    ended = &mut reader => {
                        reader_done = true;
                        break ended.unwrap_or_else(|err| format!("reader task failed: {err}"));
                    }
                }
            };

            let _ = tokio::time::timeout(CLOSE_TIMEOUT, write.close()).await;
            if !reader_done {
                reader.abort();
                let _ = reader.await;
            }
            warn!(%kind, reason = %reason, "ws connection closed");
            outbound_rx.close();
            let _ = inbound_tx
                .send(InboundFrame::Closed {
                    kind,
                    reason: Some(reason),
                })
                .await;
        });

        Ok(Self {
            kind,
            outbound_tx,
            rate_limiter,
            shutdown,
        })
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// True once the writer task has exited
    pub fn is_closed(&self) -> bool {
        self.outbound_tx.is_closed()
    }

    /// Send a text frame; safe to call from many tasks at once
    pub async fn send_text(&self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::NotConnected);
        }
        self.rate_limiter.acquire(self.kind).await?;
        self.outbound_tx
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|_| StreamError::NotConnected)
    }

    /// Close the socket; the writer task emits `InboundFrame::Closed`
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Forward inbound frames until the socket ends; returns the close reason
async fn read_loop<S>(mut read: S, kind: ConnectionKind, inbound_tx: mpsc::Sender<InboundFrame>) -> String
where
    S: Stream<Item = std::result::Result<WsMessage, WsError>> + Unpin,
{
    while let Some(incoming) = read.next().await {
        let payload = match incoming {
            Ok(WsMessage::Text(text)) if text.as_str() == TEXT_PONG => continue,
            Ok(WsMessage::Text(text)) => text.to_string(),
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(payload) => payload,
                Err(err) => {
                    debug!(%kind, error = %err, "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(WsMessage::Close(frame)) => {
                return frame.map_or_else(
                    || "closed by peer".to_string(),
                    |frame| format!("closed by peer: {} {}", frame.code, frame.reason.as_str()),
                );
            }
            Ok(_) => continue,
            Err(err) => return err.to_string(),
        };
        if inbound_tx.send(InboundFrame::Data { kind, payload }).await.is_err() {
            return "dispatcher queue closed".to_string();
        }
    }
    "stream ended".to_string()
}

#[async_trait]
impl FrameSender for Connection {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    async fn send(&self, text: String) -> Result<()> {
        self.send_text(text).await
    }
}

/// Sockets available to subscription and request code
#[derive(Clone, Default)]
pub struct Links {
    public: Option<Arc<dyn FrameSender>>,
    authenticated: Option<Arc<dyn FrameSender>>,
    auth_ready: bool,
}

impl Links {
    pub fn new(public: Option<Arc<dyn FrameSender>>) -> Self {
        Self {
            public,
            authenticated: None,
            auth_ready: false,
        }
    }

    /// Attach the authenticated socket; `ready` reflects the login result
    pub fn with_authenticated(mut self, sender: Arc<dyn FrameSender>, ready: bool) -> Self {
        self.authenticated = Some(sender);
        self.auth_ready = ready;
        self
    }

    pub fn auth_ready(&self) -> bool {
        self.auth_ready && self.authenticated.is_some()
    }

    /// Sender for `kind`, or `None` if unusable (authenticated requires login)
    pub fn get(&self, kind: ConnectionKind) -> Option<&Arc<dyn FrameSender>> {
        match kind {
            ConnectionKind::Public => self.public.as_ref(),
            ConnectionKind::Authenticated if self.auth_ready => self.authenticated.as_ref(),
            ConnectionKind::Authenticated => None,
        }
    }
}
