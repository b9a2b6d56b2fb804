use crate::auth;
use crate::config::WebsocketConfig;
use crate::error::{OkexError, Result};
use crate::websocket::book::{
    is_depth_table, ChecksumVerifier, Crc32Checksum, DepthUpdate, OrderBookEngine,
    OrderBookSnapshot,
};
use crate::websocket::codec::{
    self, ChannelEvent, ErrorEvent, EventKind, Frame, SubscriptionTopic, TableAction, TableFrame,
    PING,
};
use crate::websocket::router::{
    DepthAction, DepthFrame, SubscriptionRouter, TableCallback, TableMessage,
};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::*;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

// The exchange needs a moment to register a login before private subscribes.
const LOGIN_SETTLE_DELAY: Duration = Duration::from_millis(100);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
// Frames decoded but not yet handled. A full queue pauses the reader.
const ROUTED_QUEUE_DEPTH: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

pub type ErrorCallback = Arc<dyn Fn(ErrorEvent) + Send + Sync + 'static>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync + 'static>;
/// Runs after every successful (re)connect, once login and resubscription are sent.
/// It runs on the receive task, so it must not wait for acknowledgements.
pub type ConnectHook =
    Arc<dyn Fn(WebsocketClient) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static>;

/// Optional callbacks and collaborators for a session.
#[derive(Clone, Default)]
pub struct WebsocketHandlers {
    /// Every `error` event the exchange sends.
    pub on_error: Option<ErrorCallback>,
    /// Called each time the transport is lost.
    pub on_close: Option<CloseCallback>,
    pub post_connect: Option<ConnectHook>,
    /// Replaces the default CRC-32 book verification.
    pub checksum: Option<Arc<dyn ChecksumVerifier>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Transport lost, reconnect pending.
    Degraded,
    /// Stopped, or reconnect rounds exhausted. Terminal.
    Closed,
}

enum Disconnect {
    Closed,
    StreamEnded,
    ReadError(String),
    Silent,
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Closed => write!(f, "close frame received"),
            Disconnect::StreamEnded => write!(f, "stream ended"),
            Disconnect::ReadError(e) => write!(f, "read error: {}", e),
            Disconnect::Silent => write!(f, "no traffic within the liveness window"),
        }
    }
}

/// Work handed from the receive task to the work task, in arrival order.
enum Routed {
    Error(ErrorEvent),
    Event(ChannelEvent),
    Table(TableMessage),
}

struct Session {
    config: WebsocketConfig,
    handlers: WebsocketHandlers,
    url: String,
    /// The only path to the transport. Held for the duration of each write.
    writer: Mutex<Option<WsSink>>,
    /// Serializes subscribe, unsubscribe, login and post-connect restore.
    control: Mutex<()>,
    router: SubscriptionRouter,
    book: OrderBookEngine,
    last_seen: StdMutex<Instant>,
    state: watch::Sender<ConnectionState>,
    /// Bumped for every installed transport so a stale liveness reset is ignored.
    epoch: AtomicU64,
    reset: watch::Sender<u64>,
    authenticated: AtomicBool,
    /// A login frame was sent on this connection and not yet answered.
    login_pending: AtomicBool,
    logged_in: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// A persistent, self-healing session with the exchange's websocket API.
///
/// Cloning is cheap; every clone drives the same session.
#[derive(Clone)]
pub struct WebsocketClient {
    session: Arc<Session>,
}

impl WebsocketClient {
    /// Dials the exchange and starts the session tasks.
    ///
    /// Fails with [`OkexError::ConnectError`] when every attempt of the first dial
    /// round fails. Later losses are healed in the background.
    pub async fn connect(config: WebsocketConfig, handlers: WebsocketHandlers) -> Result<Self> {
        let url = config.connect_url()?.to_string();
        let verifier: Arc<dyn ChecksumVerifier> = match handlers.checksum.clone() {
            Some(verifier) => verifier,
            None => Arc::new(Crc32Checksum::default()),
        };
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (reset, _) = watch::channel(0);

        let session = Arc::new(Session {
            config,
            handlers,
            url,
            writer: Mutex::new(None),
            control: Mutex::new(()),
            router: SubscriptionRouter::new(),
            book: OrderBookEngine::with_verifier(verifier),
            last_seen: StdMutex::new(Instant::now()),
            state,
            epoch: AtomicU64::new(0),
            reset,
            authenticated: AtomicBool::new(false),
            login_pending: AtomicBool::new(false),
            logged_in: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        session.set_state(ConnectionState::Connecting);
        let stream = match dial(&session).await {
            Ok(stream) => stream,
            Err(e) => {
                session.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let source = session.install(stream).await;

        let (routed_tx, routed_rx) = mpsc::channel(ROUTED_QUEUE_DEPTH);
        let work = tokio::spawn(run_work_loop(Arc::clone(&session), routed_rx));
        let receive = tokio::spawn(run_receive_loop(Arc::clone(&session), source, routed_tx));
        session.lock_tasks().extend([work, receive]);

        let client = WebsocketClient { session };
        if let Err(e) = client.restore().await {
            warn!("Post-connect hook failed: {}", e);
        }
        Ok(client)
    }

    /// Subscribes `channel:filter` and binds `callback` to the channel.
    pub async fn subscribe(
        &self,
        channel: &str,
        filter: &str,
        callback: TableCallback,
    ) -> Result<()> {
        self.subscribe_topics(&[SubscriptionTopic::new(channel, filter)], callback)
            .await
    }

    /// Subscribes several filters of one channel in a single request.
    pub async fn subscribe_many(
        &self,
        channel: &str,
        filters: &[&str],
        callback: TableCallback,
    ) -> Result<()> {
        let topics: Vec<SubscriptionTopic> = if filters.is_empty() {
            vec![SubscriptionTopic::channel_only(channel)]
        } else {
            filters
                .iter()
                .map(|filter| SubscriptionTopic::new(channel, *filter))
                .collect()
        };
        self.subscribe_topics(&topics, callback).await
    }

    /// Binds before sending, so frames arriving right after the acknowledgement
    /// are never lost. While disconnected the request is deferred to the next
    /// resubscription and `Ok` is returned. A failed write returns the error and
    /// keeps the binding for the reconnect to retry.
    pub async fn subscribe_topics(
        &self,
        topics: &[SubscriptionTopic],
        callback: TableCallback,
    ) -> Result<()> {
        let frame = codec::encode_subscribe(topics)?;
        let _control = self.session.control.lock().await;
        self.session.router.bind(topics, callback);
        info!("Subscribing to {}", join_args(topics));
        self.session.send_or_defer(frame).await
    }

    /// Unsubscribes `channel:filter`. The callback stops immediately; frames still
    /// in flight for the channel are dropped.
    pub async fn unsubscribe(&self, channel: &str, filter: &str) -> Result<()> {
        let topic = SubscriptionTopic::new(channel, filter);
        let frame = codec::encode_unsubscribe(std::slice::from_ref(&topic))?;
        let _control = self.session.control.lock().await;
        self.session.router.unbind(&topic);
        info!("Unsubscribing from {}", topic);
        self.session.send_or_defer(frame).await
    }

    /// Authenticates with the configured credentials. Once called, every
    /// reconnect logs in again before resubscribing, until the exchange
    /// rejects the login.
    pub async fn login(&self) -> Result<()> {
        let _control = self.session.control.lock().await;
        // Set first so a rejection that arrives right after the write can clear it.
        self.session.authenticated.store(true, Ordering::SeqCst);
        let sent = self.session.send_login().await;
        if sent.is_err() {
            self.session.authenticated.store(false, Ordering::SeqCst);
        }
        sent
    }

    /// Copy of one instrument's book in a depth table such as `spot/depth`.
    pub fn get_order_book(&self, table: &str, instrument_id: &str) -> Option<OrderBookSnapshot> {
        self.session.book.read(table, instrument_id)
    }

    /// Instruments with a live book in `table`.
    pub fn book_instruments(&self, table: &str) -> Vec<String> {
        self.session.book.instruments(table)
    }

    /// Whether the exchange acknowledged the channel on the current connection.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.session.router.is_confirmed(channel)
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.logged_in.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.session.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.session.state.subscribe()
    }

    pub async fn subscribe_spot_depth(&self, instrument_id: &str, callback: TableCallback) -> Result<()> {
        self.subscribe("spot/depth", instrument_id, callback).await
    }

    pub async fn subscribe_spot_ticker(&self, instrument_id: &str, callback: TableCallback) -> Result<()> {
        self.subscribe("spot/ticker", instrument_id, callback).await
    }

    /// Stops the session tasks and closes the transport. The client is unusable
    /// afterwards.
    pub async fn stop(&self) {
        info!("Stopping WebSocket client...");
        let tasks = std::mem::take(&mut *self.session.lock_tasks());
        for task in tasks {
            task.abort();
        }
        self.session.drop_transport().await;
        self.session.set_state(ConnectionState::Closed);
        info!("Stop signal sent.");
    }

    /// Post-connect sequence: login if authenticated, resubscribe, then the user hook.
    async fn restore(&self) -> Result<()> {
        {
            let _control = self.session.control.lock().await;
            if self.session.authenticated.load(Ordering::SeqCst) {
                self.session.send_login().await?;
                sleep(LOGIN_SETTLE_DELAY).await;
            }
            let topics = self.session.router.active_topics();
            if !topics.is_empty() {
                info!("Resubscribing to {} topics...", topics.len());
                let frame = codec::encode_subscribe(&topics)?;
                self.session.send_text(frame).await?;
            }
        }
        if let Some(hook) = self.session.handlers.post_connect.clone() {
            hook(self.clone()).await?;
        }
        Ok(())
    }
}

impl Session {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn silence(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Makes `stream` the live transport and returns its read half.
    async fn install(&self, stream: WsStream) -> WsSource {
        let (sink, source) = stream.split();
        let previous = self.writer.lock().await.replace(sink);
        if let Some(old) = previous {
            close_sink(old).await;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.touch();
        self.set_state(ConnectionState::Connected);
        source
    }

    async fn drop_transport(&self) {
        let sink = self.writer.lock().await.take();
        if let Some(sink) = sink {
            close_sink(sink).await;
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        trace!("Sending WS message: {}", text);
        self.write(text).await
    }

    /// Writes without logging the payload.
    async fn write(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(OkexError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| OkexError::WebsocketError(format!("Failed to send message: {}", e)))
    }

    async fn send_or_defer(&self, frame: String) -> Result<()> {
        match self.send_text(frame).await {
            Err(OkexError::NotConnected) => {
                info!("Not connected; request deferred until the session is restored");
                Ok(())
            }
            other => other,
        }
    }

    async fn send_login(&self) -> Result<()> {
        let creds = self.config.credentials.as_ref().ok_or_else(|| {
            OkexError::AuthenticationError("no API credentials configured".to_string())
        })?;
        let timestamp = auth::get_epoch_time();
        let signature = auth::login_signature(&creds.secret_key, &timestamp)?;
        let frame = codec::encode_login(&creds.api_key, &creds.passphrase, &timestamp, &signature)?;
        info!("Sending login for api key {}", creds.api_key);
        self.login_pending.store(true, Ordering::SeqCst);
        // The frame carries the passphrase and signature.
        let written = self.write(frame).await;
        if written.is_err() {
            self.login_pending.store(false, Ordering::SeqCst);
        }
        written
    }

    fn table_message(&self, action: TableAction, frame: TableFrame) -> Option<TableMessage> {
        if !is_depth_table(&frame.table) {
            return Some(TableMessage::Data(frame));
        }
        let updates = match frame
            .data
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<DepthUpdate>, _>>()
        {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Dropping malformed {} frame: {}", frame.table, e);
                return None;
            }
        };

        let corrupted: Vec<String> = self
            .book
            .apply_frame(&frame.table, action, &updates)
            .into_iter()
            .map(|e| {
                warn!("{}; waiting for a fresh snapshot", e);
                e.instrument_id().to_string()
            })
            .collect();
        let action = match action {
            _ if !corrupted.is_empty() => DepthAction::Corrupt,
            TableAction::Partial => DepthAction::Partial,
            TableAction::Update => DepthAction::Update,
        };
        Some(TableMessage::Depth(DepthFrame {
            table: frame.table,
            action,
            data: updates,
            corrupted,
        }))
    }

    fn route(&self, routed: Routed) {
        match routed {
            Routed::Error(error) => {
                warn!(
                    "Exchange error {:?}: {} (channel {:?})",
                    error.error_code, error.message, error.channel
                );
                // OKEx answers a rejected login with a bare error event.
                if error.channel.is_none() && self.login_pending.swap(false, Ordering::SeqCst) {
                    warn!("Login rejected; it will not be repeated on reconnect");
                    self.authenticated.store(false, Ordering::SeqCst);
                }
                self.router.handle_error(&error);
                if let Some(on_error) = &self.handlers.on_error {
                    on_error(error);
                }
            }
            Routed::Event(event) => {
                if event.event == EventKind::Login {
                    let success = event.success.unwrap_or(false);
                    self.login_pending.store(false, Ordering::SeqCst);
                    self.logged_in.store(success, Ordering::SeqCst);
                    if !success {
                        self.authenticated.store(false, Ordering::SeqCst);
                    }
                    info!("Login acknowledged: success={}", success);
                } else {
                    debug!("{:?} acknowledged for {:?}", event.event, event.channel);
                }
                self.router.handle_event(&event);
            }
            Routed::Table(message) => {
                self.router.dispatch(message);
            }
        }
    }

    /// Probes the transport, or forces a reconnect after too long a silence.
    async fn keepalive(&self) {
        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            return;
        }
        let silence = self.silence();
        if silence > self.config.liveness.pong_timeout {
            warn!("No traffic for {:?}, resetting the connection", silence);
            self.touch();
            self.reset.send_replace(self.epoch.load(Ordering::SeqCst));
            return;
        }
        if let Err(e) = self.send_text(PING.to_string()).await {
            debug!("Ping not sent: {}", e);
        }
    }
}

async fn close_sink(mut sink: WsSink) {
    match timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing WebSocket sink failed: {}", e),
        Err(_) => debug!("Closing WebSocket sink timed out"),
    }
}

fn join_args(topics: &[SubscriptionTopic]) -> String {
    topics
        .iter()
        .map(SubscriptionTopic::arg)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One dial round: up to `max_attempts` handshakes with the policy's delays between them.
async fn dial(session: &Session) -> Result<WsStream> {
    let policy = &session.config.reconnect;
    let attempts = policy.max_attempts.max(1);
    let mut reason = String::new();
    for attempt in 0..attempts {
        info!(
            "Connecting to {} (attempt {}/{})",
            session.url,
            attempt + 1,
            attempts
        );
        match timeout(
            session.config.handshake_timeout,
            connect_async(session.url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, response))) => {
                info!(
                    "WebSocket connected successfully. Response: {:?}",
                    response.status()
                );
                return Ok(stream);
            }
            Ok(Err(e)) => reason = e.to_string(),
            Err(_) => {
                reason = format!(
                    "handshake timed out after {:?}",
                    session.config.handshake_timeout
                )
            }
        }
        warn!("Dial attempt {} failed: {}", attempt + 1, reason);
        if attempt + 1 < attempts {
            sleep(policy.delay_for(attempt)).await;
        }
    }
    Err(OkexError::ConnectError {
        url: session.url.clone(),
        attempts,
        reason,
    })
}

/// Redials until a connection is restored. `None` once the policy gives up.
async fn reconnect(session: &Arc<Session>) -> Option<WsSource> {
    let policy = &session.config.reconnect;
    let mut rounds = 0u32;
    loop {
        session.set_state(ConnectionState::Connecting);
        match dial(session).await {
            Ok(stream) => {
                let source = session.install(stream).await;
                let client = WebsocketClient {
                    session: Arc::clone(session),
                };
                match client.restore().await {
                    Ok(()) => return Some(source),
                    Err(e) => {
                        warn!(
                            "Restoring the session failed: {}. Redialing in {:?}",
                            e, session.config.restore_retry_delay
                        );
                        session.drop_transport().await;
                        session.set_state(ConnectionState::Degraded);
                        sleep(session.config.restore_retry_delay).await;
                    }
                }
            }
            Err(e) => {
                rounds += 1;
                if policy.rounds_exhausted(rounds) {
                    error!("Giving up after {} reconnect rounds: {}", rounds, e);
                    return None;
                }
                error!("{}. Next round in {:?}", e, policy.base_delay);
                session.set_state(ConnectionState::Degraded);
                sleep(policy.base_delay).await;
            }
        }
    }
}

/// Reads one transport until it fails or the liveness check resets it.
async fn pump(
    session: &Session,
    source: &mut WsSource,
    routed: &mpsc::Sender<Routed>,
) -> Disconnect {
    let epoch = session.epoch.load(Ordering::SeqCst);
    let mut reset = session.reset.subscribe();
    loop {
        tokio::select! {
            next = source.next() => {
                let decoded = match next {
                    Some(Ok(Message::Text(text))) => codec::decode_text(&text),
                    Some(Ok(Message::Binary(bytes))) => codec::decode_binary(&bytes),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // tungstenite answers pings on its own.
                        session.touch();
                        continue;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        warn!("Received WS Close frame: {:?}", frame);
                        return Disconnect::Closed;
                    }
                    Some(Err(e)) => return Disconnect::ReadError(e.to_string()),
                    None => return Disconnect::StreamEnded,
                };
                session.touch();
                let routed_item = match decoded {
                    Ok(Frame::Pong) => None,
                    Ok(Frame::Error(error)) => Some(Routed::Error(error)),
                    Ok(Frame::Event(event)) => Some(Routed::Event(event)),
                    Ok(Frame::Snapshot(frame)) => session
                        .table_message(TableAction::Partial, frame)
                        .map(Routed::Table),
                    Ok(Frame::Incremental(frame)) => session
                        .table_message(TableAction::Update, frame)
                        .map(Routed::Table),
                    Ok(Frame::Unrecognized(raw)) => {
                        warn!("Dropping unrecognized frame: {}", raw);
                        None
                    }
                    Err(e) => {
                        warn!("Dropping undecodable frame: {}", e);
                        None
                    }
                };
                if let Some(item) = routed_item {
                    if routed.send(item).await.is_err() {
                        error!("WebSocket work task is gone, dropping frame");
                    }
                }
            }
            changed = reset.changed() => {
                if changed.is_err() {
                    return Disconnect::StreamEnded;
                }
                let target = *reset.borrow_and_update();
                if target == epoch {
                    return Disconnect::Silent;
                }
            }
        }
    }
}

async fn run_receive_loop(
    session: Arc<Session>,
    mut source: WsSource,
    routed: mpsc::Sender<Routed>,
) {
    loop {
        let reason = pump(&session, &mut source, &routed).await;
        warn!("WebSocket connection lost: {}", reason);
        session.set_state(ConnectionState::Degraded);
        session.drop_transport().await;
        session.book.clear();
        session.router.reset_confirmations();
        session.logged_in.store(false, Ordering::SeqCst);
        session.login_pending.store(false, Ordering::SeqCst);
        if let Some(on_close) = &session.handlers.on_close {
            on_close();
        }

        match reconnect(&session).await {
            Some(next) => source = next,
            None => {
                session.set_state(ConnectionState::Closed);
                break;
            }
        }
    }
    info!("WebSocket receive task finished.");
}

/// Sends liveness probes and runs event bookkeeping and callbacks, in arrival order.
async fn run_work_loop(session: Arc<Session>, mut routed: mpsc::Receiver<Routed>) {
    let mut ticker = interval(session.config.liveness.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => session.keepalive().await,
            next = routed.recv() => match next {
                Some(item) => {
                    let handled = panic::catch_unwind(AssertUnwindSafe(|| session.route(item)));
                    if let Err(payload) = handled {
                        error!("Callback panicked: {}", panic_message(payload.as_ref()));
                    }
                }
                None => break,
            },
        }
    }
    info!("WebSocket work task finished.");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
