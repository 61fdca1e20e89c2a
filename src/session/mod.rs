//! One user's long-lived connection to a chat server.
//!
//! ```text
//! Disconnected ─connect()─▶ Connecting ─▶ Authenticating ─▶ Active
//!                              ▲                               │ error / close / ping failure
//!                              └──── backoff ◀── Reconnecting ◀┘
//!                                                  │ attempts exhausted, disconnect()
//!                                                  ▼
//!                                            Disconnected (final)
//! ```
//!
//! The socket is owned by a background task. [`SessionHandle::send`] and
//! [`SessionHandle::disconnect`] only talk to that task through channels,
//! so nothing else ever writes to the connection.

pub mod messages;
pub mod transport;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::SessionError;
use crate::now_unix_secs;
use crate::presence::{NoopPresence, PresenceUpdater};

use self::messages::{classify, AuthRequest, Inbound, HEARTBEAT_PING, HEARTBEAT_PONG};
use self::transport::{BoxTransport, Connector, TungsteniteConnector};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(25);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const OBSERVER_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Active,
    Reconnecting,
}

/// Why a session reached its final `Disconnected` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `disconnect()` was called.
    Stopped,
    /// `max_reconnect_attempts` consecutive failures.
    Exhausted,
    /// The server answered the auth frame with a non-success status.
    AuthRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub reconnect_attempts: u32,
    /// Unix seconds of the last frame received.
    pub last_activity: Option<u64>,
    /// Set only once the session is over.
    pub close: Option<CloseReason>,
}

impl SessionStatus {
    fn initial() -> Self {
        Self {
            state: SessionState::Disconnected,
            reconnect_attempts: 0,
            last_activity: None,
            close: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.close.is_some()
    }
}

/// Serializable view of a session for callers that persist tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub user_id: u64,
    pub server: String,
    pub token: String,
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub last_activity: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub user_id: u64,
    pub token: String,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Silence longer than this triggers a heartbeat ping.
    pub read_timeout: Duration,
    pub auth_timeout: Duration,
    pub connect_timeout: Duration,
    /// Wait for `auth_response` before going `Active`.
    pub require_auth_ack: bool,
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16, user_id: u64, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user_id,
            token: token.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            read_timeout: DEFAULT_READ_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            require_auth_ack: true,
        }
    }

    pub fn for_server(addr: SocketAddr, user_id: u64, token: impl Into<String>) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), user_id, token)
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn server(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn ws_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("ws://{}/ws/{}", self.server(), self.user_id))
    }
}

/// Delay before reconnect attempt `attempt` (1-based): linear, capped.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt).min(cap)
}

/// Receivers for everything the session reports back.
pub struct SessionObservers {
    pub status: watch::Receiver<SessionStatus>,
    /// `user_status_update` events.
    pub status_updates: mpsc::Receiver<Value>,
    /// Every other application message.
    pub messages: mpsc::Receiver<Value>,
}

/// Builds and starts a session.
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    presence: Arc<dyn PresenceUpdater>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: Arc::new(TungsteniteConnector),
            presence: Arc::new(NoopPresence),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_presence(mut self, presence: Arc<dyn PresenceUpdater>) -> Self {
        self.presence = presence;
        self
    }

    /// Spawns the connection task. Must be called inside a tokio runtime.
    pub fn connect(self) -> Result<(SessionHandle, SessionObservers), SessionError> {
        let url = self.config.ws_url()?;

        let (status_tx, status_rx) = watch::channel(SessionStatus::initial());
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (status_updates_tx, status_updates_rx) = mpsc::channel(OBSERVER_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(OBSERVER_CAPACITY);
        let cancel = CancellationToken::new();

        let task = SessionTask {
            config: self.config.clone(),
            url,
            connector: self.connector,
            presence: self.presence,
            status: status_tx,
            outbound: outbound_rx,
            status_updates: status_updates_tx,
            messages: messages_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        let session = SessionHandle {
            config: self.config,
            status: status_rx.clone(),
            outbound: outbound_tx,
            cancel,
            task: Mutex::new(Some(handle)),
        };
        let observers = SessionObservers {
            status: status_rx,
            status_updates: status_updates_rx,
            messages: messages_rx,
        };
        Ok((session, observers))
    }
}

/// Caller side of a running session.
pub struct SessionHandle {
    config: SessionConfig,
    status: watch::Receiver<SessionStatus>,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn user_id(&self) -> u64 {
        self.config.user_id
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status.borrow();
        SessionSnapshot {
            user_id: self.config.user_id,
            server: self.config.server(),
            token: self.config.token.clone(),
            state: status.state,
            reconnect_attempts: status.reconnect_attempts,
            last_activity: status.last_activity,
        }
    }

    /// Queues one JSON message for the connection task.
    ///
    /// Fails with [`SessionError::NotConnected`] unless the session is
    /// `Active`. Messages still queued when the link drops are discarded.
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), SessionError> {
        {
            let status = self.status.borrow();
            if status.is_final() {
                return Err(SessionError::Closed);
            }
            if status.state != SessionState::Active {
                return Err(SessionError::NotConnected);
            }
        }
        let text = serde_json::to_string(message)?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Stops the session from any state. No reconnect happens afterwards.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match timeout(DISCONNECT_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Session task ended abnormally: {}", err),
                Err(_) => warn!(
                    "Session task for user {} did not stop within {:?}",
                    self.config.user_id, DISCONNECT_GRACE
                ),
            }
        }
    }

    /// Waits until the session has reached its final state.
    pub async fn closed(&self) -> SessionStatus {
        let mut rx = self.status.clone();
        if rx.wait_for(|s| s.is_final()).await.is_err() {
            warn!("Session task for user {} vanished", self.config.user_id);
        }
        let status = rx.borrow().clone();
        status
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ───────────────────────────── Task ─────────────────────────────

/// How one connection ended.
enum LinkEnd {
    Stopped,
    Rejected(String),
    Failed(String),
}

struct SessionTask {
    config: SessionConfig,
    url: Url,
    connector: Arc<dyn Connector>,
    presence: Arc<dyn PresenceUpdater>,
    status: watch::Sender<SessionStatus>,
    outbound: mpsc::Receiver<String>,
    status_updates: mpsc::Sender<Value>,
    messages: mpsc::Sender<Value>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(mut self) {
        info!("Session for user {} targeting {}", self.config.user_id, self.url);

        let mut attempts: u32 = 0;
        let mut reached_active = false;

        let reason = loop {
            self.set_state(SessionState::Connecting, attempts);

            let link = tokio::select! {
                _ = self.cancel.cancelled() => break CloseReason::Stopped,
                link = timeout(self.config.connect_timeout, self.connector.connect(&self.url)) => link,
            };

            let end = match link {
                Ok(Ok(ws)) => {
                    let end = self.drive(ws, &mut attempts, &mut reached_active).await;
                    self.discard_outbound();
                    end
                }
                Ok(Err(err)) => LinkEnd::Failed(format!("connect failed: {}", err)),
                Err(_) => LinkEnd::Failed(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                )),
            };

            match end {
                LinkEnd::Stopped => break CloseReason::Stopped,
                LinkEnd::Rejected(message) => {
                    error!("Authentication rejected: {}", message);
                    break CloseReason::AuthRejected(message);
                }
                LinkEnd::Failed(why) => warn!("Connection to {} lost: {}", self.url, why),
            }

            attempts += 1;
            if attempts >= self.config.max_reconnect_attempts {
                error!("Giving up on {} after {} attempts", self.url, attempts);
                break CloseReason::Exhausted;
            }

            let delay = backoff_delay(self.config.backoff_base, self.config.backoff_cap, attempts);
            self.set_state(SessionState::Reconnecting, attempts);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, attempts, self.config.max_reconnect_attempts
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break CloseReason::Stopped,
                _ = sleep(delay) => {}
            }
        };

        self.finish(reason, reached_active, attempts).await;
    }

    async fn drive(
        &mut self,
        mut ws: BoxTransport,
        attempts: &mut u32,
        reached_active: &mut bool,
    ) -> LinkEnd {
        self.set_state(SessionState::Authenticating, *attempts);
        if let Err(end) = self.authenticate(&mut ws).await {
            if matches!(end, LinkEnd::Stopped) {
                let _ = timeout(CLOSE_GRACE, ws.close()).await;
            }
            return end;
        }

        *attempts = 0;
        *reached_active = true;
        self.set_state(SessionState::Active, 0);
        info!("Session active for user {}", self.config.user_id);

        self.pump(ws).await
    }

    async fn authenticate(&mut self, ws: &mut BoxTransport) -> Result<(), LinkEnd> {
        let auth = AuthRequest::new(self.config.token.clone(), self.config.user_id);
        let text = serde_json::to_string(&auth)
            .map_err(|err| LinkEnd::Failed(format!("encode auth: {}", err)))?;
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|err| LinkEnd::Failed(format!("send auth: {}", err)))?;
        debug!("Auth request sent");

        if !self.config.require_auth_ack {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.auth_timeout;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(LinkEnd::Stopped),
                next = timeout_at(deadline, ws.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    return Err(LinkEnd::Failed(format!(
                        "no auth response within {:?}",
                        self.config.auth_timeout
                    )))
                }
                Ok(None) => return Err(LinkEnd::Failed("closed during auth".into())),
                Ok(Some(Err(err))) => return Err(LinkEnd::Failed(format!("read auth: {}", err))),
                Ok(Some(Ok(frame))) => frame,
            };
            self.touch();

            match frame {
                Message::Text(text) => match classify(text.as_str()) {
                    Some(Inbound::AuthResponse(resp)) if resp.is_success() => {
                        info!("认证成功: {}", resp.message.unwrap_or_default());
                        return Ok(());
                    }
                    Some(Inbound::AuthResponse(resp)) => {
                        return Err(LinkEnd::Rejected(
                            resp.message.unwrap_or_else(|| resp.status.clone()),
                        ))
                    }
                    Some(Inbound::Ping) => {
                        ws.send(Message::Text(HEARTBEAT_PONG.into()))
                            .await
                            .map_err(|err| LinkEnd::Failed(format!("send pong: {}", err)))?;
                    }
                    Some(Inbound::Pong) => {}
                    Some(other) => self.dispatch(other),
                    None => warn!("Ignoring non-JSON frame during auth: {}", text.as_str()),
                },
                Message::Close(frame) => {
                    return Err(LinkEnd::Failed(format!(
                        "closed by server during auth: {:?}",
                        frame
                    )))
                }
                _ => {}
            }
        }
    }

    async fn pump(&mut self, ws: BoxTransport) -> LinkEnd {
        let (mut write, mut read) = ws.split();
        // Only inbound frames and our own pings move the deadline.
        let idle = sleep(self.config.read_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Session cancelled, closing connection");
                    let _ = timeout(CLOSE_GRACE, write.close()).await;
                    return LinkEnd::Stopped;
                }
                Some(text) = self.outbound.recv() => {
                    if let Err(err) = write.send(Message::Text(text.into())).await {
                        return LinkEnd::Failed(format!("send failed: {}", err));
                    }
                }
                _ = &mut idle => {
                    debug!("No data for {:?}, sending ping", self.config.read_timeout);
                    if let Err(err) = write.send(Message::Text(HEARTBEAT_PING.into())).await {
                        return LinkEnd::Failed(format!("heartbeat ping failed: {}", err));
                    }
                    idle.as_mut().reset(Instant::now() + self.config.read_timeout);
                }
                incoming = read.next() => {
                    let frame = match incoming {
                        None => return LinkEnd::Failed("connection closed".into()),
                        Some(Err(err)) => return LinkEnd::Failed(format!("read failed: {}", err)),
                        Some(Ok(frame)) => frame,
                    };
                    idle.as_mut().reset(Instant::now() + self.config.read_timeout);
                    self.touch();

                    match frame {
                        Message::Text(text) => match classify(text.as_str()) {
                            Some(Inbound::Ping) => {
                                if let Err(err) = write.send(Message::Text(HEARTBEAT_PONG.into())).await {
                                    return LinkEnd::Failed(format!("send pong: {}", err));
                                }
                            }
                            Some(Inbound::Pong) => {}
                            Some(Inbound::AuthResponse(resp)) => {
                                debug!("Late auth response: {}", resp.status);
                            }
                            Some(other) => self.dispatch(other),
                            None => warn!("忽略非 JSON 消息: {}", text.as_str()),
                        },
                        Message::Close(frame) => {
                            return LinkEnd::Failed(format!("closed by server: {:?}", frame));
                        }
                        other => debug!("Ignoring non-text frame: {:?}", other),
                    }
                }
            }
        }
    }

    /// Never waits on observers: a full queue drops the frame.
    fn dispatch(&self, inbound: Inbound) {
        let (queue, value) = match inbound {
            Inbound::StatusUpdate(value) => (&self.status_updates, value),
            Inbound::Message(value) => (&self.messages, value),
            _ => return,
        };
        if let Err(TrySendError::Full(dropped)) = queue.try_send(value) {
            warn!(
                "Observer queue full, dropping {} frame",
                dropped["type"].as_str().unwrap_or("untyped")
            );
        }
    }

    /// Drops whatever the caller queued for a link that no longer exists.
    fn discard_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Discarded {} unsent message(s)", dropped);
        }
    }

    async fn finish(mut self, reason: CloseReason, reached_active: bool, attempts: u32) {
        self.discard_outbound();

        let notify = match reason {
            CloseReason::Exhausted => true,
            CloseReason::Stopped => reached_active,
            CloseReason::AuthRejected(_) => false,
        };
        if notify {
            match self.presence.mark_offline(self.config.user_id).await {
                Ok(()) => debug!("Marked user {} offline", self.config.user_id),
                Err(err) => warn!(
                    "Failed to mark user {} offline: {:#}",
                    self.config.user_id, err
                ),
            }
        }

        info!("Session for user {} closed: {:?}", self.config.user_id, reason);
        self.status.send_modify(|s| {
            s.state = SessionState::Disconnected;
            s.reconnect_attempts = attempts;
            s.close = Some(reason);
        });
    }

    fn set_state(&self, state: SessionState, attempts: u32) {
        self.status.send_if_modified(|s| {
            let changed = s.state != state || s.reconnect_attempts != attempts;
            s.state = state;
            s.reconnect_attempts = attempts;
            changed
        });
        debug!("Session state: {:?} (attempts {})", state, attempts);
    }

    fn touch(&self) {
        let now = now_unix_secs();
        self.status.send_if_modified(|s| {
            let changed = s.last_activity != Some(now);
            s.last_activity = Some(now);
            changed
        });
    }
}
