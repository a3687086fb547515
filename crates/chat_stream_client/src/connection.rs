//! Connection supervisor: owns the socket, runs the state machine and the
//! receive loop, and reconnects after abnormal closes.
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Idle
//!            |           |
//!            v           v
//!          ReconnectWait -> Connecting
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::dispatcher::{Dispatcher, Handlers};
use crate::error::{ClientError, ErrorEvent};
use crate::messages::{encode_cancel, encode_request, ChatRequest, Frame};
use crate::pending::{PendingRequest, PendingRequestTable};
use crate::policy::RetryPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    ReconnectWait,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::ReconnectWait => write!(f, "reconnect_wait"),
        }
    }
}

/// Supplies the bearer credential. Consulted on every connection attempt.
pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Supplies the WebSocket URL. Consulted on every connection attempt.
pub trait EndpointResolver: Send + Sync {
    fn endpoint(&self) -> String;
}

impl<F> EndpointResolver for F
where
    F: Fn() -> String + Send + Sync,
{
    fn endpoint(&self) -> String {
        self()
    }
}

/// Where the credential goes on the opening handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CredentialPlacement {
    /// `Authorization: Bearer <token>` header.
    #[default]
    Header,
    /// `?<param>=<token>` appended to the URL, for backends that cannot read headers.
    Query { param: String },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub retry: RetryPolicy,
    /// Evict exchanges with no terminal frame after this long. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub credential_placement: CredentialPlacement,
    /// How long `disconnect()` waits for the server to answer the close frame.
    pub close_timeout: Duration,
    /// Send a `cancel` frame to the backend when an exchange is cancelled.
    pub notify_backend_on_cancel: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: None,
            credential_placement: CredentialPlacement::Header,
            close_timeout: Duration::from_secs(1),
            notify_backend_on_cancel: true,
        }
    }
}

enum SessionEnd {
    Shutdown,
    ClosedNormally,
    Abnormal(String),
}

struct Shared {
    endpoint: Box<dyn EndpointResolver>,
    credentials: Box<dyn CredentialProvider>,
    options: ClientOptions,
    table: PendingRequestTable,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
    /// Writer queue of the live session; `None` whenever no transport is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    attempts: AtomicU32,
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the transport and the pending table; nothing else touches either.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: Box<dyn EndpointResolver>,
        credentials: Box<dyn CredentialProvider>,
        options: ClientOptions,
        handlers: Handlers,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                endpoint,
                credentials,
                options,
                table: PendingRequestTable::new(),
                dispatcher: Dispatcher::new(handlers),
                state,
                outbound: Mutex::new(None),
                attempts: AtomicU32::new(0),
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the state machine. No-op while a connection is already active.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut slot = self.supervisor.lock().await;
        if let Some(running) = slot.as_ref() {
            // A supervisor that already reported Idle is on its way out; wait for it below.
            if !running.handle.is_finished() && self.state() != ConnectionState::Idle {
                tracing::debug!(state = %self.state(), "connect ignored, connection already active");
                return Ok(());
            }
        }
        if let Some(finished) = slot.take() {
            let _ = finished.handle.await;
        }

        let Some(token) = self.shared.credentials.token() else {
            tracing::warn!("connect refused, no credential available");
            self.shared
                .dispatcher
                .emit_error(&ErrorEvent::connection(ClientError::Auth));
            return Err(ClientError::Auth);
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(self.shared.clone().supervise(token, shutdown_rx));
        *slot = Some(Supervisor { shutdown, handle });
        Ok(())
    }

    /// Close the connection, cancel any reconnect timer and fail every
    /// pending exchange with `ClientError::Disconnect`.
    pub async fn disconnect(&self) {
        let mut slot = self.supervisor.lock().await;
        let Some(running) = slot.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            tracing::warn!(error = %e, "connection task ended abnormally");
        }
    }

    /// Register and queue a request. Fails immediately unless the connection is open.
    pub fn send(&self, request: ChatRequest) -> Result<String, ClientError> {
        let outbound = self.shared.outbound();
        let tx = match outbound.as_ref() {
            Some(tx) if self.state() == ConnectionState::Open => tx,
            _ => {
                return Err(ClientError::Connection(format!(
                    "connection is {}",
                    self.state()
                )))
            }
        };
        if request.message.trim().is_empty() {
            return Err(ClientError::InvalidRequest("message is empty".into()));
        }

        let mut id = uuid::Uuid::new_v4().to_string();
        while self.shared.table.contains(&id) {
            id = uuid::Uuid::new_v4().to_string();
        }
        let text = encode_request(&id, &request)?;
        self.shared
            .table
            .register(PendingRequest::new(id.clone(), request))?;
        if tx.send(Message::Text(text)).is_err() {
            self.shared.table.resolve(&id);
            return Err(ClientError::Connection("transport writer closed".into()));
        }
        tracing::debug!(correlation_id = %id, "request queued");
        Ok(id)
    }

    /// Drop one exchange without touching the others. Returns false if it was not pending.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let outbound = self.shared.outbound();
        if self.shared.table.resolve(correlation_id).is_none() {
            return false;
        }
        tracing::debug!(correlation_id, "exchange cancelled");
        if self.shared.options.notify_backend_on_cancel {
            if let Some(tx) = outbound.as_ref() {
                match encode_cancel(correlation_id) {
                    Ok(text) => {
                        let _ = tx.send(Message::Text(text));
                    }
                    Err(e) => tracing::warn!(error = %e, "could not encode cancel frame"),
                }
            }
        }
        true
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == target).await;
    }

    /// Failed attempts since the transport was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        match self.state() {
            ConnectionState::ReconnectWait => true,
            ConnectionState::Connecting => self.reconnect_attempts() > 0,
            _ => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.shared.table.contains(correlation_id)
    }
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "connection state");
            self.dispatcher.emit_state(next);
        }
    }

    fn close_outbound(&self) {
        self.outbound().take();
    }

    fn fail_pending(&self, error: ClientError) {
        let drained = self.table.drain_all();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), error = %error, "failing pending exchanges");
        }
        self.dispatcher.fail_all(drained, &error);
    }

    /// Tear down for good: no transport, no pending exchanges, `Idle`.
    fn finish(&self) {
        self.close_outbound();
        self.fail_pending(ClientError::Disconnect);
        self.set_state(ConnectionState::Idle);
    }

    async fn supervise(self: Arc<Self>, first_token: String, mut shutdown: watch::Receiver<bool>) {
        let mut token = first_token;
        loop {
            let opened = match self.open_request(&token) {
                Ok(request) => tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        self.finish();
                        return;
                    }
                    result = tokio_tungstenite::connect_async(request) => result.map_err(ClientError::from),
                },
                Err(e) => Err(e),
            };

            match opened {
                Ok((ws, _)) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    match self.run_session(ws, &mut shutdown).await {
                        SessionEnd::Shutdown => {
                            tracing::info!("connection closed by caller");
                            self.finish();
                            return;
                        }
                        SessionEnd::ClosedNormally => {
                            tracing::info!("connection closed normally by server");
                            self.finish();
                            return;
                        }
                        SessionEnd::Abnormal(reason) => {
                            tracing::warn!(%reason, "connection lost");
                            self.fail_pending(ClientError::Disconnect);
                            self.dispatcher
                                .emit_error(&ErrorEvent::connection(ClientError::Connection(reason)));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection attempt failed");
                    self.dispatcher.emit_error(&ErrorEvent::connection(e));
                }
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            let Some(delay) = self.options.retry.next_delay(attempt) else {
                tracing::warn!(attempt, "reconnect attempts exhausted");
                self.finish();
                return;
            };
            self.set_state(ConnectionState::ReconnectWait);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.finish();
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.credentials.token() {
                Some(fresh) => token = fresh,
                None => {
                    tracing::warn!("reconnect abandoned, no credential available");
                    self.dispatcher
                        .emit_error(&ErrorEvent::connection(ClientError::Auth));
                    self.finish();
                    return;
                }
            }
            self.set_state(ConnectionState::Connecting);
        }
    }

    async fn run_session(&self, ws: WsStream, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound() = Some(tx);
        self.set_state(ConnectionState::Open);
        tracing::info!("connection open");

        let timeout = self.options.request_timeout;
        let mut sweep = tokio::time::interval(timeout.map(sweep_period).unwrap_or(Duration::from_secs(60)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Closing);
                    self.close_outbound();
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    }));
                    if sink.send(close).await.is_ok() {
                        let _ = tokio::time::timeout(self.options.close_timeout, async {
                            while let Some(Ok(msg)) = stream.next().await {
                                if matches!(msg, Message::Close(_)) {
                                    break;
                                }
                            }
                        })
                        .await;
                    }
                    break SessionEnd::Shutdown;
                }
                // Outbound before inbound; a long token stream must not delay requests or cancels.
                Some(msg) = rx.recv() => {
                    if let Err(e) = sink.send(msg).await {
                        break SessionEnd::Abnormal(e.to_string());
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) if f.code == CloseCode::Normal => SessionEnd::ClosedNormally,
                            Some(f) => SessionEnd::Abnormal(format!("closed with code {} {}", u16::from(f.code), f.reason)),
                            None => SessionEnd::Abnormal("closed without status code".into()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Abnormal(e.to_string()),
                    None => break SessionEnd::Abnormal("stream ended without close frame".into()),
                },
                _ = sweep.tick(), if timeout.is_some() => {
                    if let Some(max_age) = timeout {
                        self.expire_stale(max_age);
                    }
                }
            }
        };
        self.close_outbound();
        end
    }

    fn handle_text(&self, text: &str) {
        match Frame::decode(text) {
            Ok(frame) => {
                tracing::debug!(kind = frame.type_name(), correlation_id = ?frame.correlation_id(), "frame received");
                self.dispatcher.dispatch(frame, &self.table);
            }
            Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
        }
    }

    fn expire_stale(&self, max_age: Duration) {
        let expired = self.table.expire(max_age);
        if expired.is_empty() {
            return;
        }
        tracing::warn!(count = expired.len(), ?max_age, "exchanges timed out");
        self.dispatcher.fail_all(expired, &ClientError::Timeout(max_age));
    }

    fn open_request(&self, token: &str) -> Result<Request, ClientError> {
        let endpoint = self.endpoint.endpoint();
        match &self.options.credential_placement {
            CredentialPlacement::Header => {
                let mut request = endpoint.into_client_request()?;
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
                Ok(request)
            }
            CredentialPlacement::Query { param } => {
                let separator = if endpoint.contains('?') { '&' } else { '?' };
                let url = format!(
                    "{}{}{}={}",
                    endpoint,
                    separator,
                    param,
                    utf8_percent_encode(token, NON_ALPHANUMERIC)
                );
                Ok(url.into_client_request()?)
            }
        }
    }
}

/// Check for stale exchanges a few times per timeout window.
fn sweep_period(timeout: Duration) -> Duration {
    (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
}
