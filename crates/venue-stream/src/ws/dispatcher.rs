/*
[INPUT]:  Shared inbound frame queue from every connection
[OUTPUT]: Replies to the multiplexer, pushes to channel handlers, sink events
[POS]:    WebSocket layer - single routing loop
[UPDATE]: When changing routing rules or unhandled-message policy
*/

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::InboundFrame;
use super::handlers::{HandlerContext, HandlerRegistry};
use super::message::Envelope;
use super::multiplexer::Multiplexer;
use crate::error::StreamError;
use crate::types::{ConnectionKind, DataEvent};

const UNHANDLED_LOG_LIMIT: usize = 3;
const DECODE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static UNHANDLED_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);
static DECODE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Consumes the shared queue in arrival order
pub struct Dispatcher {
    inbound_rx: mpsc::Receiver<InboundFrame>,
    mux: Multiplexer,
    handlers: HandlerRegistry,
    ctx: HandlerContext,
    closed_tx: Option<mpsc::UnboundedSender<(ConnectionKind, Option<String>)>>,
}

impl Dispatcher {
    pub fn new(
        inbound_rx: mpsc::Receiver<InboundFrame>,
        mux: Multiplexer,
        handlers: HandlerRegistry,
        ctx: HandlerContext,
    ) -> Self {
        Self {
            inbound_rx,
            mux,
            handlers,
            ctx,
            closed_tx: None,
        }
    }

    /// Also report socket closures to a supervisor
    pub fn notify_closed(mut self, closed_tx: mpsc::UnboundedSender<(ConnectionKind, Option<String>)>) -> Self {
        self.closed_tx = Some(closed_tx);
        self
    }

    /// Run until shutdown or until every connection has dropped its sender.
    ///
    /// Frames still queued at shutdown are dropped, never handled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                frame = self.inbound_rx.recv() => frame,
            };
            let Some(frame) = frame else {
                debug!("inbound queue closed, dispatcher exiting");
                break;
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.handle_frame(frame) => {}
            }
        }
    }

    async fn handle_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Data { kind, payload } => self.route(kind, payload).await,
            InboundFrame::Closed { kind, reason } => {
                self.mux.connection_closed(kind);
                if let Some(closed_tx) = &self.closed_tx {
                    let _ = closed_tx.send((kind, reason.clone()));
                }
                self.ctx
                    .sink
                    .publish(DataEvent::Connection {
                        kind,
                        connected: false,
                        reason,
                    })
                    .await;
            }
        }
    }

    async fn route(&self, kind: ConnectionKind, payload: String) {
        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                log_decode_fail_once(&err, &payload);
                self.ctx.sink.publish_error(err).await;
                return;
            }
        };

        if envelope.is_admin() {
            let Some(envelope) = self.mux.dispatch(kind, envelope).await else {
                return;
            };
            if envelope.is_error() {
                self.ctx.sink.publish_error(envelope.api_error()).await;
            } else {
                debug!(
                    %kind,
                    event = envelope.event_name().unwrap_or(""),
                    channel = envelope.channel().unwrap_or(""),
                    "unsolicited reply"
                );
            }
            return;
        }

        let handler = envelope.channel().and_then(|channel| self.handlers.get(channel));
        let Some(handler) = handler else {
            log_unhandled_once(&envelope.raw);
            self.ctx
                .sink
                .publish(DataEvent::Unhandled { raw: envelope.raw })
                .await;
            return;
        };

        if let Err(err) = handler.handle(&self.ctx, kind, envelope).await {
            debug!(%kind, error = %err, "channel handler failed");
            self.ctx.sink.publish_error(err).await;
        }
    }
}

fn log_unhandled_once(raw: &str) {
    let count = UNHANDLED_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < UNHANDLED_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = UNHANDLED_LOG_LIMIT,
            bytes = raw.len(),
            "ws message channel unrecognized"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = UNHANDLED_LOG_LIMIT,
            bytes = raw.len(),
            message = %preview,
            "ws message channel unrecognized"
        );
    }
}

fn log_decode_fail_once(err: &StreamError, raw: &str) {
    let count = DECODE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < DECODE_FAIL_LOG_LIMIT {
        info!(
            sample_index = count + 1,
            sample_limit = DECODE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            "ws message parse failed"
        );
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = DECODE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            message = %preview,
            "ws message parse failed"
        );
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}
