//! # Push Channel (WebSocket)
//!
//! Persistent server-initiated delivery of device state changes, with
//! automatic reconnection and a capped attempt budget.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Push Connection States                               │
//! │                                                                         │
//! │  ┌────────────┐    spawn()      ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │ ◄──────────────┐        │
//! │  └────────────┘                 └─────┬──────┘                │        │
//! │        ▲                    success   │   failure             │        │
//! │        │                        ┌─────┴─────┐                 │        │
//! │        │                        ▼           ▼                 │        │
//! │        │              ┌────────────┐  ┌────────────┐  timer   │        │
//! │        │   shutdown   │ Connected  │  │  Backoff   │ ─────────┘        │
//! │        └───────────── └─────┬──────┘  └─────┬──────┘                   │
//! │                             │ drop          │ budget used up           │
//! │                             ▼               ▼                           │
//! │                        (Backoff)      ┌────────────┐  reconnect()      │
//! │                                       │ Exhausted  │ ─────► Connecting │
//! │                                       └────────────┘                   │
//! │                                                                         │
//! │  EVENTS                                                                │
//! │  ──────                                                                │
//! │  Connected                  every successful handshake                 │
//! │  Disconnected{reason, n}    every drop and every failed attempt,       │
//! │                             n = attempts left before Exhausted         │
//! │  Heartbeat                  pings, pongs, acks                         │
//! │  Update(StateReport)        StateUpdate frames                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The subscribed serial set survives reconnects; it is re-sent after every
//! handshake.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use hvac_core::{DeviceSerial, StateReport};

use crate::config::{ApiSettings, PushSettings};
use crate::error::{SyncError, SyncResult};
use crate::protocol::PushMessage;
use crate::session::TokenSession;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Events
// =============================================================================

/// Why the push connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We closed it on purpose.
    LocalShutdown,
    /// The server closed it.
    Remote(String),
    /// Connect failure, protocol error, missed pong, or a requested restart.
    Error(String),
}

impl DisconnectReason {
    pub fn is_deliberate(&self) -> bool {
        matches!(self, DisconnectReason::LocalShutdown)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LocalShutdown => write!(f, "local shutdown"),
            DisconnectReason::Remote(reason) => write!(f, "closed by server: {}", reason),
            DisconnectReason::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Signals emitted by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
        /// Attempts left before the channel parks. `u32::MAX` when the
        /// budget is unlimited.
        attempts_remaining: u32,
    },
    /// Any sign of life that carries no state.
    Heartbeat,
    Update(StateReport),
}

// =============================================================================
// Control Surface
// =============================================================================

/// Commands the controller can give the push channel.
#[async_trait]
pub trait PushControl: Send + Sync {
    /// Adds serials to the subscription set. Already subscribed serials are
    /// ignored.
    async fn subscribe(&self, serials: Vec<DeviceSerial>) -> SyncResult<()>;

    /// Drops the current connection (if any) and starts a fresh attempt
    /// cycle with a full budget.
    async fn reconnect(&self) -> SyncResult<()>;

    /// Deliberate local disconnect. The channel does not come back.
    async fn shutdown(&self) -> SyncResult<()>;
}

/// Connection state for the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before the next attempt.
    Backoff,
    /// Attempt budget used up; waiting for `reconnect()`.
    Exhausted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Exhausted => write!(f, "exhausted"),
        }
    }
}

// =============================================================================
// Push Configuration
// =============================================================================

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// WebSocket URL to connect to.
    pub url: String,

    pub connect_timeout: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Consecutive failed attempts before the channel parks (0 = unlimited).
    pub max_reconnect_attempts: u32,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,

    /// Disconnect if a ping stays unanswered this long.
    pub pong_timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        PushConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl PushConfig {
    pub fn from_settings(api: &ApiSettings, push: &PushSettings) -> Self {
        PushConfig {
            url: api.push_url.clone(),
            connect_timeout: Duration::from_secs(push.connect_timeout_secs),
            initial_backoff: Duration::from_millis(push.initial_backoff_ms),
            max_backoff: Duration::from_secs(push.max_backoff_secs),
            max_reconnect_attempts: push.max_reconnect_attempts,
            ping_interval: Duration::from_secs(push.ping_interval_secs),
            pong_timeout: Duration::from_secs(push.pong_timeout_secs),
        }
    }

    fn attempts_remaining(&self, failures: u32) -> u32 {
        if self.max_reconnect_attempts == 0 {
            u32::MAX
        } else {
            self.max_reconnect_attempts.saturating_sub(failures)
        }
    }
}

// =============================================================================
// Push Handle
// =============================================================================

#[derive(Debug)]
enum Control {
    Subscribe(Vec<DeviceSerial>),
    Reconnect,
    Shutdown,
}

/// Handle for controlling a spawned [`PushChannel`].
#[derive(Clone)]
pub struct PushHandle {
    control_tx: mpsc::Sender<Control>,
    state: Arc<RwLock<ConnectionState>>,
}

impl PushHandle {
    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    async fn send(&self, control: Control) -> SyncResult<()> {
        self.control_tx
            .send(control)
            .await
            .map_err(|_| SyncError::ChannelError("Push channel task has stopped".into()))
    }
}

#[async_trait]
impl PushControl for PushHandle {
    async fn subscribe(&self, serials: Vec<DeviceSerial>) -> SyncResult<()> {
        self.send(Control::Subscribe(serials)).await
    }

    async fn reconnect(&self) -> SyncResult<()> {
        self.send(Control::Reconnect).await
    }

    async fn shutdown(&self) -> SyncResult<()> {
        // Already stopped counts as shut down.
        let _ = self.control_tx.send(Control::Shutdown).await;
        Ok(())
    }
}

// =============================================================================
// Push Channel
// =============================================================================

/// What ended a backoff wait.
enum Wake {
    Elapsed,
    Reconnect,
    Shutdown,
}

/// WebSocket push client with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let config = PushConfig::from_settings(&cfg.api, &cfg.push);
/// let (handle, events) = PushChannel::spawn(config, Some(session));
/// handle.subscribe(vec![serial]).await?;
/// controller.start(events).await;
/// ```
pub struct PushChannel {
    config: PushConfig,
    session: Option<TokenSession>,
    state: Arc<RwLock<ConnectionState>>,
    control_rx: mpsc::Receiver<Control>,
    events_tx: mpsc::Sender<PushEvent>,
    subscribed: BTreeSet<DeviceSerial>,
}

impl PushChannel {
    /// Creates the channel and spawns its background task.
    pub fn spawn(
        config: PushConfig,
        session: Option<TokenSession>,
    ) -> (PushHandle, mpsc::Receiver<PushEvent>) {
        let (control_tx, control_rx) = mpsc::channel::<Control>(32);
        let (events_tx, events_rx) = mpsc::channel::<PushEvent>(256);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let channel = PushChannel {
            config,
            session,
            state: state.clone(),
            control_rx,
            events_tx,
            subscribed: BTreeSet::new(),
        };

        tokio::spawn(channel.run());

        (PushHandle { control_tx, state }, events_rx)
    }

    /// Main reconnect loop.
    async fn run(mut self) {
        info!(url = %self.config.url, "Push channel starting");

        let mut backoff = self.create_backoff();
        let mut failures = 0u32;

        loop {
            self.set_state(ConnectionState::Connecting).await;

            let reason = match self.connect().await {
                Ok(ws) => {
                    info!("Push channel connected");
                    backoff.reset();
                    failures = 0;
                    self.set_state(ConnectionState::Connected).await;
                    if !self.emit(PushEvent::Connected).await {
                        break;
                    }
                    self.connection_loop(ws).await
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Push connect failed");
                    DisconnectReason::Error(e.to_string())
                }
            };

            let attempts_remaining = self.config.attempts_remaining(failures);
            if reason.is_deliberate() {
                self.emit(PushEvent::Disconnected {
                    reason,
                    attempts_remaining,
                })
                .await;
                break;
            }

            info!(reason = %reason, attempts_remaining, "Push channel disconnected");
            if !self
                .emit(PushEvent::Disconnected {
                    reason,
                    attempts_remaining,
                })
                .await
            {
                break;
            }

            if attempts_remaining == 0 {
                let exhausted = SyncError::PushExhausted { attempts: failures };
                error!(error = %exhausted, "Waiting for reconnect request");
                self.set_state(ConnectionState::Exhausted).await;
                if !self.park().await {
                    break;
                }
                info!("Reconnect requested, starting a fresh attempt cycle");
                failures = 0;
                backoff.reset();
                continue;
            }

            self.set_state(ConnectionState::Backoff).await;
            let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
            debug!(?delay, attempt = failures, "Waiting before reconnect");
            match self.wait(delay).await {
                Wake::Elapsed => {}
                Wake::Reconnect => {
                    failures = 0;
                    backoff.reset();
                }
                Wake::Shutdown => break,
            }
        }

        self.set_state(ConnectionState::Disconnected).await;
        info!("Push channel stopped");
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Returns false once nobody listens any more.
    async fn emit(&self, event: PushEvent) -> bool {
        if self.events_tx.send(event).await.is_err() {
            warn!("Push event receiver dropped");
            return false;
        }
        true
    }

    /// Connects with timeout, carrying the bearer token if a session is set.
    async fn connect(&self) -> SyncResult<WsStream> {
        let mut request = self.config.url.as_str().into_client_request()?;

        if let Some(session) = &self.session {
            if !session.ensure_valid().await {
                return Err(SyncError::AuthFailed(
                    "no usable access token for push channel".into(),
                ));
            }
            if let Some(token) = session.access_token().await {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| SyncError::AuthFailed("Invalid token format".into()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        match timeout(self.config.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    /// Runs one live connection until it ends.
    async fn connection_loop(&mut self, ws: WsStream) -> DisconnectReason {
        let (mut write, mut read) = ws.split();

        if !self.subscribed.is_empty() {
            let msg = PushMessage::subscribe(self.subscribed.iter());
            if let Err(reason) = send_message(&mut write, &msg).await {
                return reason;
            }
            debug!(count = self.subscribed.len(), "Re-sent subscriptions");
        }

        let mut ping_interval = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending_ping: Option<Instant> = None;

        loop {
            tokio::select! {
                control = self.control_rx.recv() => {
                    match control {
                        Some(Control::Subscribe(serials)) => {
                            let fresh: Vec<DeviceSerial> = serials
                                .into_iter()
                                .filter(|s| self.subscribed.insert(s.clone()))
                                .collect();
                            if fresh.is_empty() {
                                continue;
                            }
                            let msg = PushMessage::subscribe(fresh.iter());
                            if let Err(reason) = send_message(&mut write, &msg).await {
                                return reason;
                            }
                        }
                        Some(Control::Reconnect) => {
                            info!("Reconnect requested, dropping live connection");
                            let _ = write.send(WsMessage::Close(None)).await;
                            return DisconnectReason::Error("reconnect requested".into());
                        }
                        Some(Control::Shutdown) | None => {
                            info!("Shutdown signal received, closing connection");
                            let _ = write.send(WsMessage::Close(None)).await;
                            return DisconnectReason::LocalShutdown;
                        }
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            match PushMessage::from_json(&text) {
                                Ok(msg) => {
                                    debug!(msg_type = %msg.type_name(), bytes = text.len(), "Received message");
                                    match handle_message(msg, &mut write).await {
                                        Ok(Some(event)) => {
                                            if !self.emit(event).await {
                                                return DisconnectReason::LocalShutdown;
                                            }
                                        }
                                        Ok(None) => {}
                                        Err(reason) => return reason,
                                    }
                                }
                                Err(e) => warn!(error = %e, "Failed to parse push message"),
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if let Err(e) = write.send(WsMessage::Pong(data)).await {
                                return DisconnectReason::Error(e.to_string());
                            }
                            if !self.emit(PushEvent::Heartbeat).await {
                                return DisconnectReason::LocalShutdown;
                            }
                        }
                        Some(Ok(WsMessage::Pong(_))) => {
                            debug!("Received pong");
                            pending_ping = None;
                            if !self.emit(PushEvent::Heartbeat).await {
                                return DisconnectReason::LocalShutdown;
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "Received close frame");
                            let reason = frame
                                .map(|f| String::from(&*f.reason))
                                .unwrap_or_else(|| "no reason".into());
                            return DisconnectReason::Remote(reason);
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            warn!("Received unexpected binary message");
                        }
                        Some(Ok(WsMessage::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            return DisconnectReason::Error(SyncError::from(e).to_string());
                        }
                        None => return DisconnectReason::Remote("stream ended".into()),
                    }
                }

                _ = ping_interval.tick() => {
                    if let Some(sent) = pending_ping {
                        if sent.elapsed() >= self.config.pong_timeout {
                            warn!("Ping unanswered, treating connection as dead");
                            return DisconnectReason::Error("pong timeout".into());
                        }
                        continue;
                    }
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new().into())).await {
                        return DisconnectReason::Error(e.to_string());
                    }
                    pending_ping = Some(Instant::now());
                    debug!("Sent ping");
                }
            }
        }
    }

    /// Parks after the attempt budget is used up. Returns false on shutdown.
    async fn park(&mut self) -> bool {
        loop {
            match self.control_rx.recv().await {
                Some(Control::Reconnect) => return true,
                Some(Control::Subscribe(serials)) => self.subscribed.extend(serials),
                Some(Control::Shutdown) | None => return false,
            }
        }
    }

    /// Sleeps through a backoff delay while still honoring control messages.
    async fn wait(&mut self, delay: Duration) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Wake::Elapsed,
                control = self.control_rx.recv() => match control {
                    Some(Control::Subscribe(serials)) => self.subscribed.extend(serials),
                    Some(Control::Reconnect) => return Wake::Reconnect,
                    Some(Control::Shutdown) | None => {
                        info!("Shutdown during backoff");
                        return Wake::Shutdown;
                    }
                },
            }
        }
    }

    /// Creates the exponential backoff configuration.
    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Maps an application message to an event, answering pings. A failed pong
/// write ends the connection.
async fn handle_message<S>(
    msg: PushMessage,
    write: &mut S,
) -> Result<Option<PushEvent>, DisconnectReason>
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let event = match msg {
        PushMessage::StateUpdate(wire) => match wire.into_report() {
            Ok(report) => Some(PushEvent::Update(report)),
            Err(e) => {
                warn!(error = %e, "Dropping push update");
                Some(PushEvent::Heartbeat)
            }
        },
        PushMessage::Ping { timestamp } => {
            send_message(write, &PushMessage::pong(&timestamp)).await?;
            Some(PushEvent::Heartbeat)
        }
        PushMessage::Pong { .. } => Some(PushEvent::Heartbeat),
        PushMessage::Subscribed { request_id, serials } => {
            debug!(request_id = %request_id, count = serials.len(), "Subscription acknowledged");
            Some(PushEvent::Heartbeat)
        }
        PushMessage::Error { code, message } => {
            warn!(code = %code, message = %message, "Push service reported an error");
            None
        }
        PushMessage::Subscribe { .. } => None,
    };
    Ok(event)
}

async fn send_message<S>(write: &mut S, msg: &PushMessage) -> Result<(), DisconnectReason>
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    let json = msg
        .to_json()
        .map_err(|e| DisconnectReason::Error(e.to_string()))?;
    debug!(msg_type = %msg.type_name(), "Sending message");
    write
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|_| DisconnectReason::Error("failed to write to socket".into()))
}
