/*
[INPUT]:  Outbound requests needing a reply, inbound administrative frames
[OUTPUT]: Exactly one matched reply per request, or Timeout/ConnectionClosed
[POS]:    WebSocket layer - request/response correlation over shared sockets
[UPDATE]: When changing matching rules or pending-request lifecycle
*/

use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::FrameSender;
use super::message::{Envelope, OutboundRequest};
use crate::error::{Result, StreamError};
use crate::types::ConnectionKind;

/// Fields a reply must carry to satisfy a request that the venue
/// answers without echoing the client id.
///
/// Every populated field must match (case-insensitive). Criteria with no
/// populated field never match, so such a request is reachable by id only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCriteria {
    /// Acceptable `event`/`op` names
    pub events: Vec<String>,
    pub channel: Option<String>,
    pub inst_type: Option<String>,
    pub inst_id: Option<String>,
}

impl RequestCriteria {
    /// Id-only correlation
    pub fn none() -> Self {
        Self::default()
    }

    pub fn event(event: impl Into<String>) -> Self {
        Self {
            events: vec![event.into().to_ascii_lowercase()],
            ..Self::default()
        }
    }

    pub fn or_event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into().to_ascii_lowercase());
        self
    }

    /// Channel tags are matched exactly (`candle1M` is not `candle1m`)
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn inst_type(mut self, inst_type: impl Into<String>) -> Self {
        self.inst_type = Some(inst_type.into().to_ascii_lowercase());
        self
    }

    pub fn inst_id(mut self, inst_id: impl Into<String>) -> Self {
        self.inst_id = Some(inst_id.into().to_ascii_lowercase());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.channel.is_none()
            && self.inst_type.is_none()
            && self.inst_id.is_none()
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if self.is_empty() {
            return false;
        }
        if !self.events.is_empty() {
            let Some(event) = envelope.event_name() else {
                return false;
            };
            if !self.events.iter().any(|e| e.eq_ignore_ascii_case(event)) {
                return false;
            }
        }
        self.channel.as_deref().is_none_or(|wanted| envelope.channel() == Some(wanted))
            && field_matches(self.inst_type.as_deref(), envelope.inst_type())
            && field_matches(self.inst_id.as_deref(), envelope.inst_id())
    }

    /// Same criteria, ignoring case
    fn same_as(&self, other: &RequestCriteria) -> bool {
        let norm = |c: &RequestCriteria| {
            let mut events: Vec<String> =
                c.events.iter().map(|e| e.to_ascii_lowercase()).collect();
            events.sort();
            events.dedup();
            (
                events,
                c.channel.clone(),
                c.inst_type.as_deref().map(str::to_ascii_lowercase),
                c.inst_id.as_deref().map(str::to_ascii_lowercase),
            )
        };
        norm(self) == norm(other)
    }

    fn describe(&self) -> String {
        self.events
            .first()
            .cloned()
            .unwrap_or_else(|| "reply".to_string())
    }
}

fn field_matches(wanted: Option<&str>, actual: Option<&str>) -> bool {
    match (wanted, actual) {
        (None, _) => true,
        (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
        (Some(_), None) => false,
    }
}

/// 32-character alphanumeric correlation id
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub criteria: RequestCriteria,
    pub kind: ConnectionKind,
    pub created_at: Instant,
    reply: oneshot::Sender<Envelope>,
}

#[derive(Debug)]
enum MuxCommand {
    Register {
        request: PendingRequest,
        ack: oneshot::Sender<Result<()>>,
    },
    Unregister {
        id: String,
    },
    Dispatch {
        kind: ConnectionKind,
        envelope: Envelope,
        unmatched: oneshot::Sender<Option<Envelope>>,
    },
    ConnectionClosed {
        kind: ConnectionKind,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the multiplexer control loop.
///
/// The pending-request table is owned by a single task; every operation
/// is a message to it, so the table is never touched concurrently.
#[derive(Debug, Clone)]
pub struct Multiplexer {
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
}

impl Multiplexer {
    /// Start the control loop; it stops when `shutdown` fires or every
    /// handle is dropped, failing all waiters with `ConnectionClosed`.
    pub fn spawn(sweep_interval: Duration, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = MultiplexerWorker {
            pending: IndexMap::new(),
            cmd_rx,
            sweep_interval,
            shutdown,
        };
        let handle = tokio::spawn(worker.run());
        (Self { cmd_tx }, handle)
    }

    pub async fn register(&self, request: PendingRequest) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::Register { request, ack })
            .map_err(|_| StreamError::ConnectionClosed)?;
        ack_rx.await.map_err(|_| StreamError::ConnectionClosed)?
    }

    pub fn unregister(&self, id: &str) {
        let _ = self.cmd_tx.send(MuxCommand::Unregister { id: id.to_string() });
    }

    /// Route an administrative frame; returns it back when nobody waits for it
    pub async fn dispatch(&self, kind: ConnectionKind, envelope: Envelope) -> Option<Envelope> {
        let (unmatched, unmatched_rx) = oneshot::channel();
        match self.cmd_tx.send(MuxCommand::Dispatch {
            kind,
            envelope,
            unmatched,
        }) {
            Ok(()) => unmatched_rx.await.unwrap_or(None),
            Err(mpsc::error::SendError(MuxCommand::Dispatch { envelope, .. })) => Some(envelope),
            Err(_) => None,
        }
    }

    /// Fail every request waiting on `kind`
    pub fn connection_closed(&self, kind: ConnectionKind) {
        let _ = self.cmd_tx.send(MuxCommand::ConnectionClosed { kind });
    }

    pub async fn pending_count(&self) -> usize {
        let (reply, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(MuxCommand::PendingCount { reply }).is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    /// Send `payload` on `link` and wait for the matching reply.
    ///
    /// The request is registered before the frame leaves, so a fast reply
    /// cannot be missed. A generated id is used when `id` is `None`.
    pub async fn request(
        &self,
        link: &dyn FrameSender,
        id: Option<String>,
        criteria: RequestCriteria,
        payload: String,
        timeout: Duration,
    ) -> Result<Envelope> {
        let id = id.unwrap_or_else(new_request_id);
        let operation = criteria.describe();
        let (reply, reply_rx) = oneshot::channel();
        self.register(PendingRequest {
            id: id.clone(),
            criteria,
            kind: link.kind(),
            created_at: Instant::now(),
            reply,
        })
        .await?;

        if let Err(err) = link.send(payload).await {
            self.unregister(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(StreamError::ConnectionClosed),
            Err(_) => {
                self.unregister(&id);
                debug!(%id, operation, "request timed out");
                Err(StreamError::timeout(operation, timeout))
            }
        }
    }

    /// Id-correlated operation (`{"id","op","args"}`); a non-"0" code is an error
    pub async fn send_request<A: Serialize + Send>(
        &self,
        link: &dyn FrameSender,
        op: &str,
        args: A,
        timeout: Duration,
    ) -> Result<Envelope> {
        let id = new_request_id();
        let payload = OutboundRequest::new(op, args).with_id(&id).to_text()?;
        let envelope = self
            .request(link, Some(id.clone()), RequestCriteria::none(), payload, timeout)
            .await?;
        if envelope.is_error() {
            return Err(envelope.api_error());
        }
        Ok(envelope)
    }
}

struct MultiplexerWorker {
    pending: IndexMap<String, PendingRequest>,
    cmd_rx: mpsc::UnboundedReceiver<MuxCommand>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl MultiplexerWorker {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval_at(
            Instant::now() + self.sweep_interval,
            self.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => self.sweep(),
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle(cmd);
                }
            }
        }

        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "multiplexer stopped with pending requests");
        }
    }

    fn handle(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::Register { request, ack } => {
                let _ = ack.send(self.register(request));
            }
            MuxCommand::Unregister { id } => {
                self.pending.shift_remove(&id);
            }
            MuxCommand::Dispatch {
                kind,
                envelope,
                unmatched,
            } => {
                let _ = unmatched.send(self.dispatch(kind, envelope));
            }
            MuxCommand::ConnectionClosed { kind } => {
                let before = self.pending.len();
                self.pending.retain(|_, request| request.kind != kind);
                let failed = before - self.pending.len();
                if failed > 0 {
                    warn!(%kind, failed, "connection closed with requests in flight");
                }
            }
            MuxCommand::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn register(&mut self, request: PendingRequest) -> Result<()> {
        if self.pending.contains_key(&request.id) {
            return Err(StreamError::DuplicateRequest(format!("id {}", request.id)));
        }
        if !request.criteria.is_empty()
            && self.pending.values().any(|other| {
                other.kind == request.kind && other.criteria.same_as(&request.criteria)
            })
        {
            return Err(StreamError::DuplicateRequest(format!(
                "criteria {:?}",
                request.criteria
            )));
        }
        self.pending.insert(request.id.clone(), request);
        Ok(())
    }

    fn dispatch(&mut self, kind: ConnectionKind, envelope: Envelope) -> Option<Envelope> {
        let by_id = envelope
            .id
            .as_deref()
            .filter(|id| self.pending.get(*id).is_some_and(|r| r.kind == kind))
            .map(str::to_string);
        let id = by_id.or_else(|| {
            self.pending
                .iter()
                .find(|(_, r)| r.kind == kind && r.criteria.matches(&envelope))
                .map(|(id, _)| id.clone())
        });

        let Some(id) = id else {
            return Some(envelope);
        };
        let request = self.pending.shift_remove(&id)?;
        if request.reply.send(envelope).is_err() {
            debug!(%id, "reply arrived after the caller went away");
        }
        None
    }

    fn sweep(&mut self) {
        let before = self.pending.len();
        self.pending.retain(|_, request| !request.reply.is_closed());
        let removed = before - self.pending.len();
        if removed > 0 {
            debug!(removed, "swept abandoned requests");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    /// Sender that records frames instead of writing to a socket
    struct Recorder {
        kind: ConnectionKind,
        sent: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl FrameSender for Recorder {
        fn kind(&self) -> ConnectionKind {
            self.kind
        }

        async fn send(&self, text: String) -> Result<()> {
            self.sent.send(text).map_err(|_| StreamError::NotConnected)
        }
    }

    fn recorder(kind: ConnectionKind) -> (Arc<Recorder>, mpsc::UnboundedReceiver<String>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { kind, sent }), rx)
    }

    fn envelope(raw: &str) -> Envelope {
        Envelope::decode(raw).unwrap()
    }

    #[test]
    fn test_criteria_matching() {
        let criteria = RequestCriteria::event("subscribe")
            .channel("books")
            .inst_id("BTC-USDT");
        assert!(criteria.matches(&envelope(
            r#"{"event":"subscribe","arg":{"channel":"books","instId":"btc-usdt"}}"#
        )));
        assert!(!criteria.matches(&envelope(
            r#"{"event":"subscribe","arg":{"channel":"books","instId":"ETH-USDT"}}"#
        )));
        assert!(!criteria.matches(&envelope(r#"{"event":"subscribe"}"#)));
        assert!(!RequestCriteria::none().matches(&envelope(r#"{"event":"login"}"#)));

        let month = RequestCriteria::event("subscribe").channel("candle1M");
        assert!(!month.matches(&envelope(r#"{"event":"subscribe","arg":{"channel":"candle1m"}}"#)));
        assert!(month.matches(&envelope(r#"{"event":"subscribe","arg":{"channel":"candle1M"}}"#)));
    }

    #[test]
    fn test_request_id_shape() {
        let id = new_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_reply_by_criteria() {
        let (mux, _handle) = Multiplexer::spawn(Duration::from_secs(30), CancellationToken::new());
        let (link, mut sent) = recorder(ConnectionKind::Authenticated);

        let waiter = {
            let mux = mux.clone();
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                mux.request(
                    link.as_ref(),
                    None,
                    RequestCriteria::event("login").or_event("error"),
                    r#"{"op":"login"}"#.to_string(),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        assert_eq!(sent.recv().await.as_deref(), Some(r#"{"op":"login"}"#));
        let leftover = mux
            .dispatch(ConnectionKind::Authenticated, envelope(r#"{"event":"login","code":"0"}"#))
            .await;
        assert!(leftover.is_none());

        let reply = assert_ok!(waiter.await.unwrap());
        assert_eq!(reply.event_name(), Some("login"));
        assert_eq!(mux.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_frame_returned() {
        let (mux, _handle) = Multiplexer::spawn(Duration::from_secs(30), CancellationToken::new());
        let leftover = mux
            .dispatch(ConnectionKind::Public, envelope(r#"{"event":"subscribe"}"#))
            .await;
        assert!(leftover.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_unregisters() {
        let (mux, _handle) = Multiplexer::spawn(Duration::from_secs(30), CancellationToken::new());
        let (link, _sent) = recorder(ConnectionKind::Public);

        let err = mux
            .request(
                link.as_ref(),
                None,
                RequestCriteria::event("subscribe"),
                "{}".to_string(),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Timeout { .. }));
        assert_eq!(mux.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_criteria_rejected() {
        let (mux, _handle) = Multiplexer::spawn(Duration::from_secs(30), CancellationToken::new());
        let (reply, _rx) = oneshot::channel();
        assert_ok!(
            mux.register(PendingRequest {
                id: "a".into(),
                criteria: RequestCriteria::event("login"),
                kind: ConnectionKind::Authenticated,
                created_at: Instant::now(),
                reply,
            })
            .await
        );

        let (reply, _rx2) = oneshot::channel();
        let err = mux
            .register(PendingRequest {
                id: "b".into(),
                criteria: RequestCriteria::event("LOGIN"),
                kind: ConnectionKind::Authenticated,
                created_at: Instant::now(),
                reply,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::DuplicateRequest(_)));

        let (reply, _rx3) = oneshot::channel();
        let err = mux
            .register(PendingRequest {
                id: "a".into(),
                criteria: RequestCriteria::none(),
                kind: ConnectionKind::Public,
                created_at: Instant::now(),
                reply,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn test_connection_closed_fails_only_its_waiters() {
        let (mux, _handle) = Multiplexer::spawn(Duration::from_secs(30), CancellationToken::new());
        let (public, _p) = recorder(ConnectionKind::Public);
        let (private, mut private_sent) = recorder(ConnectionKind::Authenticated);

        let public_waiter = {
            let mux = mux.clone();
            tokio::spawn(async move {
                mux.request(
                    public.as_ref(),
                    None,
                    RequestCriteria::event("subscribe"),
                    "{}".into(),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        let private_waiter = {
            let mux = mux.clone();
            tokio::spawn(async move {
                mux.request(
                    private.as_ref(),
                    None,
                    RequestCriteria::event("login"),
                    "{}".into(),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        private_sent.recv().await;
        while mux.pending_count().await < 2 {
            tokio::task::yield_now().await;
        }
        mux.connection_closed(ConnectionKind::Authenticated);

        let err = private_waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::ConnectionClosed));

        mux.dispatch(ConnectionKind::Public, envelope(r#"{"event":"subscribe"}"#))
            .await;
        assert_ok!(public_waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_send_request_maps_error_code() {
        let (mux, _handle) = Multiplexer::spawn(Duration::from_secs(30), CancellationToken::new());
        let (link, mut sent) = recorder(ConnectionKind::Authenticated);

        let waiter = {
            let mux = mux.clone();
            tokio::spawn(async move {
                mux.send_request(
                    link.as_ref(),
                    "order",
                    vec![serde_json::json!({"instId": "BTC-USDT"})],
                    Duration::from_secs(5),
                )
                .await
            })
        };

        let frame = sent.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        let id = value["id"].as_str().unwrap().to_string();
        assert_eq!(value["op"], "order");

        let reply = format!(r#"{{"id":"{id}","op":"order","code":"1","msg":"Operation failed."}}"#);
        assert!(
            mux.dispatch(ConnectionKind::Authenticated, envelope(&reply))
                .await
                .is_none()
        );
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Api { code, .. } if code == "1"));
    }
}
