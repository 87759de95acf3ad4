/*
[INPUT]:  StreamConfig, handler table, credentials, desired subscriptions
[OUTPUT]: Supervised sockets, synchronized books, events on the data sink
[POS]:    Supervisor layer - connect/auth/resubscribe/reconnect lifecycle
[UPDATE]: When changing reconnection backoff or session wiring
*/

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, CredentialsProvider};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::orderbook::{OrderBookTable, OrderBookView};
use crate::ratelimit::{RateLimiter, Unlimited};
use crate::sink::DataSink;
use crate::subscription::{
    DefaultChannels, Subscription, SubscriptionManager, generate_default_subscriptions,
};
use crate::types::{AssetClass, BookKey, ConnectionKind, DataEvent, Instrument, Level, SubscriptionState};
use crate::ws::{
    Connection, ConnectionOptions, Dispatcher, Envelope, HandlerContext, HandlerRegistry, InboundFrame,
    Links, Multiplexer, ResyncRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected { retry_count: u32 },
    Reconnecting,
}

/// Live sockets and tasks of one connect cycle
struct Session {
    public: Connection,
    closed_rx: mpsc::UnboundedReceiver<(ConnectionKind, Option<String>)>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    Disconnected,
    Shutdown,
}

/// Streaming core for one venue.
///
/// Owns the order book table and desired subscription set across
/// reconnects; sockets, multiplexer and dispatcher live per session.
pub struct StreamConnector {
    config: StreamConfig,
    registry: HandlerRegistry,
    books: Arc<OrderBookTable>,
    subscriptions: Arc<SubscriptionManager>,
    authenticator: Option<Arc<Authenticator>>,
    rate_limiter: Arc<dyn RateLimiter>,
    sink: DataSink,
    links: Arc<RwLock<Links>>,
    mux: RwLock<Option<Multiplexer>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl StreamConnector {
    /// Create a connector with the default channel handlers
    pub fn new(config: StreamConfig, sink: DataSink) -> Result<Self> {
        Self::with_handlers(config, sink, HandlerRegistry::with_default_channels())
    }

    pub fn with_handlers(config: StreamConfig, sink: DataSink, registry: HandlerRegistry) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected { retry_count: 0 });
        Ok(Self {
            books: Arc::new(OrderBookTable::new(config.checksum)),
            subscriptions: Arc::new(SubscriptionManager::new(
                registry.authenticated_channels(),
                config.max_message_bytes,
                config.max_subscriptions,
            )),
            authenticator: None,
            rate_limiter: Arc::new(Unlimited),
            sink,
            links: Arc::new(RwLock::new(Links::default())),
            mux: RwLock::new(None),
            state_tx,
            registry,
            config,
        })
    }

    /// Enable the authenticated socket with these credentials
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.authenticator = Some(Arc::new(Authenticator::new(provider, self.config.auth.clone())));
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticator
            .as_ref()
            .is_some_and(|auth| auth.is_authenticated())
    }

    pub fn books(&self) -> Arc<OrderBookTable> {
        Arc::clone(&self.books)
    }

    pub fn order_book(&self, key: &BookKey) -> Option<OrderBookView> {
        self.books.view(key)
    }

    pub fn top_of_book(&self, key: &BookKey) -> Option<(Option<Level>, Option<Level>)> {
        self.books.top_of_book(key)
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Default channel set for the enabled instruments
    pub fn default_subscriptions(&self, instruments: &[Instrument], assets: &[AssetClass]) -> Vec<Subscription> {
        generate_default_subscriptions(
            instruments,
            assets,
            self.authenticator.is_some() && self.config.private_url.is_some(),
            &DefaultChannels::default(),
            self.config.max_subscriptions,
        )
    }

    /// Track and (when connected) send subscriptions
    pub async fn subscribe(&self, subs: Vec<Subscription>) -> Result<()> {
        let links = self.links.read().clone();
        let result = self.subscriptions.subscribe(&links, subs).await;
        self.refresh_book_routes();
        result
    }

    pub async fn unsubscribe(&self, subs: Vec<Subscription>) -> Result<()> {
        let links = self.links.read().clone();
        let result = self.subscriptions.unsubscribe(&links, subs).await;
        self.refresh_book_routes();
        result
    }

    /// Point book streams at the asset classes they were subscribed for
    fn refresh_book_routes(&self) {
        let routes = self
            .subscriptions
            .subscriptions()
            .into_iter()
            .filter(|(_, state)| *state != SubscriptionState::Removing)
            .filter_map(|(sub, _)| {
                let channel = sub.wire_channel();
                let feeds_books = self
                    .registry
                    .get(&channel)
                    .is_some_and(|handler| handler.maintains_books());
                if !feeds_books {
                    return None;
                }
                Some((channel, sub.symbol?, sub.asset?))
            });
        self.books.set_routes(routes);
    }

    /// Id-correlated operation on the authenticated socket
    pub async fn send_request<A: Serialize + Send>(&self, op: &str, args: A) -> Result<Envelope> {
        let links = self.links.read().clone();
        let mux = self.mux.read().clone().ok_or(StreamError::NotConnected)?;
        let link = links
            .get(ConnectionKind::Authenticated)
            .ok_or(StreamError::NotAuthenticated)?;
        mux.send_request(link.as_ref(), op, args, self.config.request_timeout())
            .await
    }

    fn set_state(&self, state: ConnectionState) {
        // Stored even while nobody is watching
        self.state_tx.send_replace(state);
    }

    /// Supervise connections until `shutdown` fires or reconnects are exhausted
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut retry_count: u32 = 0;

        'run: loop {
            if shutdown.is_cancelled() {
                self.set_state(ConnectionState::Disconnected { retry_count });
                break 'run;
            }
            self.set_state(ConnectionState::Reconnecting);

            match self.connect_once(&shutdown).await {
                Ok(mut session) => {
                    retry_count = 0;
                    self.set_state(ConnectionState::Connected);
                    info!("stream connector connected");

                    let exit = self.stream_until_closed(&mut session, &shutdown).await;
                    self.teardown(session).await;

                    match exit {
                        StreamExit::Shutdown => {
                            self.set_state(ConnectionState::Disconnected { retry_count });
                            break 'run;
                        }
                        StreamExit::Disconnected => {
                            self.set_state(ConnectionState::Disconnected { retry_count: 1 });
                            let backoff = self.config.reconnect.backoff(1);
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    self.set_state(ConnectionState::Disconnected { retry_count });
                                    break 'run;
                                }
                                _ = tokio::time::sleep(backoff) => {}
                            }
                        }
                    }
                }
                Err(err) => {
                    retry_count = retry_count.saturating_add(1);
                    self.set_state(ConnectionState::Disconnected { retry_count });

                    let max_attempts = self.config.reconnect.max_attempts;
                    if retry_count >= max_attempts {
                        warn!(retry_count, max_attempts, error = %err, "stream connector gave up reconnecting");
                        return Err(err);
                    }

                    let backoff = self.config.reconnect.backoff(retry_count);
                    warn!(retry_count, ?backoff, error = %err, "stream connect failed; retrying with backoff");
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            self.set_state(ConnectionState::Disconnected { retry_count });
                            break 'run;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
        Ok(())
    }

    async fn connect_once(&self, shutdown: &CancellationToken) -> Result<Session> {
        let token = shutdown.child_token();
        let options = ConnectionOptions {
            ping: self.config.ping.clone(),
            ping_interval: self.config.ping_interval(),
        };
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_queue_capacity);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();

        let public = match Connection::connect(
            &self.config.public_url,
            ConnectionKind::Public,
            options.clone(),
            inbound_tx.clone(),
            Arc::clone(&self.rate_limiter),
        )
        .await
        {
            Ok(public) => public,
            Err(err) => {
                token.cancel();
                return Err(err);
            }
        };

        let (mux, _mux_handle) = Multiplexer::spawn(self.config.sweep_interval(), token.clone());
        let ctx = HandlerContext {
            sink: self.sink.clone(),
            books: Arc::clone(&self.books),
            resync_tx,
        };
        let dispatcher = Dispatcher::new(inbound_rx, mux.clone(), self.registry.clone(), ctx)
            .notify_closed(closed_tx);
        let mut session = Session {
            public: public.clone(),
            closed_rx,
            token: token.clone(),
            tasks: vec![tokio::spawn(dispatcher.run(token.clone()))],
        };
        self.sink
            .publish(DataEvent::Connection {
                kind: ConnectionKind::Public,
                connected: true,
                reason: None,
            })
            .await;

        let links = Links::new(Some(Arc::new(public)));
        *self.links.write() = links.clone();
        *self.mux.write() = Some(mux.clone());

        // Public entries go out now; authenticated ones wait for login
        if let Err(err) = self.subscriptions.flush(&links).await {
            self.teardown(session).await;
            return Err(err);
        }

        session.tasks.push(tokio::spawn(resync_worker(
            resync_rx,
            Arc::clone(&self.subscriptions),
            mux.clone(),
            Arc::clone(&self.links),
            self.sink.clone(),
            self.config.request_timeout(),
            token.clone(),
        )));

        if let (Some(url), Some(auth)) = (&self.config.private_url, &self.authenticator) {
            let private = PrivateSession {
                url: url.clone(),
                options,
                inbound_tx,
                rate_limiter: Arc::clone(&self.rate_limiter),
                authenticator: Arc::clone(auth),
                mux,
                links: Arc::clone(&self.links),
                subscriptions: Arc::clone(&self.subscriptions),
                sink: self.sink.clone(),
            };
            session.tasks.push(tokio::spawn(private.run(token)));
        }
        Ok(session)
    }

    async fn stream_until_closed(&self, session: &mut Session, shutdown: &CancellationToken) -> StreamExit {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("stream connector shutdown requested");
                StreamExit::Shutdown
            }
            closed = session.closed_rx.recv() => {
                match closed {
                    Some((kind, reason)) => {
                        warn!(%kind, reason = reason.as_deref().unwrap_or(""), "socket lost; reconnecting");
                    }
                    None => warn!("dispatcher stopped; reconnecting"),
                }
                StreamExit::Disconnected
            }
        }
    }

    /// Stop session tasks and discard everything tied to the old sockets.
    ///
    /// Books are cleared only after the dispatcher has stopped, so no frame
    /// from the old sockets can repopulate them.
    async fn teardown(&self, session: Session) {
        session.token.cancel();
        session.public.close();
        for task in session.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "session task ended abnormally");
            }
        }
        *self.links.write() = Links::default();
        *self.mux.write() = None;
        if let Some(auth) = &self.authenticator {
            auth.reset();
        }
        self.subscriptions.mark_all_pending();
        self.books.clear();
    }
}

/// Authenticated socket of one connect cycle.
///
/// Runs beside public streaming: a slow or failed login never delays
/// public subscriptions.
struct PrivateSession {
    url: String,
    options: ConnectionOptions,
    inbound_tx: mpsc::Sender<InboundFrame>,
    rate_limiter: Arc<dyn RateLimiter>,
    authenticator: Arc<Authenticator>,
    mux: Multiplexer,
    links: Arc<RwLock<Links>>,
    subscriptions: Arc<SubscriptionManager>,
    sink: DataSink,
}

impl PrivateSession {
    async fn run(self, token: CancellationToken) {
        let mut socket: Option<Connection> = None;
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = self.establish(&mut socket) => token.cancelled().await,
        }
        if let Some(conn) = socket {
            conn.close();
        }
    }

    async fn establish(&self, socket: &mut Option<Connection>) {
        let conn = match Connection::connect(
            &self.url,
            ConnectionKind::Authenticated,
            self.options.clone(),
            self.inbound_tx.clone(),
            Arc::clone(&self.rate_limiter),
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "authenticated socket unavailable");
                self.sink.publish_error(err).await;
                return;
            }
        };
        *socket = Some(conn.clone());

        // Auth failure disables private features only
        let authenticated = match self.authenticator.login(&self.mux, &conn).await {
            Ok(_) => true,
            Err(err) => {
                self.sink.publish_error(err).await;
                false
            }
        };
        let links = {
            let mut links = self.links.write();
            *links = links.clone().with_authenticated(Arc::new(conn), authenticated);
            links.clone()
        };
        self.sink
            .publish(DataEvent::Authentication { authenticated })
            .await;

        if authenticated && let Err(err) = self.subscriptions.flush(&links).await {
            warn!(error = %err, "authenticated subscribe failed");
            self.sink.publish_error(err).await;
        }
    }
}

/// Services desync resubscribes off the dispatcher task
async fn resync_worker(
    mut resync_rx: mpsc::UnboundedReceiver<ResyncRequest>,
    subscriptions: Arc<SubscriptionManager>,
    mux: Multiplexer,
    links: Arc<RwLock<Links>>,
    sink: DataSink,
    timeout: std::time::Duration,
    token: CancellationToken,
) {
    let mut inflight = JoinSet::new();
    loop {
        let request = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(_) = inflight.join_next(), if !inflight.is_empty() => continue,
            request = resync_rx.recv() => request,
        };
        let Some(request) = request else { break };

        let subscriptions = Arc::clone(&subscriptions);
        let mux = mux.clone();
        let current = links.read().clone();
        let sink = sink.clone();
        inflight.spawn(async move {
            if let Err(err) = subscriptions
                .resubscribe_one(&mux, &current, &request.channel, &request.instrument, timeout)
                .await
            {
                warn!(channel = %request.channel, symbol = %request.instrument.symbol, error = %err, "resubscribe failed");
                sink.publish_error(err).await;
            }
        });
    }
    // A late ack must not mark entries Active after teardown
    inflight.shutdown().await;
}
