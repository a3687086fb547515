//! Public client: connect, send, cancel, disconnect, and connection-state accessors.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::connection::{
    ClientOptions, ConnectionManager, ConnectionState, CredentialPlacement, CredentialProvider,
    EndpointResolver,
};
use crate::dispatcher::{Completion, Handlers, StatusUpdate};
use crate::error::{ClientError, ErrorEvent};
use crate::messages::ChatRequest;
use crate::policy::RetryPolicy;

/// Streaming chat client. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    manager: Arc<ConnectionManager>,
}

impl Client {
    pub fn builder<E, C>(endpoint: E, credentials: C) -> ClientBuilder
    where
        E: EndpointResolver + 'static,
        C: CredentialProvider + 'static,
    {
        ClientBuilder {
            endpoint: Box::new(endpoint),
            credentials: Box::new(credentials),
            options: ClientOptions::default(),
            handlers: Handlers::default(),
        }
    }

    /// Open the connection. Returns once the state machine is running; watch
    /// [`Client::state`] or the state callback for `Open`. Fails only with
    /// `ClientError::Auth` when no credential is available.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.manager.connect().await
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await
    }

    /// Send a request and return its correlation id. Never waits: fails with
    /// `ClientError::Connection` unless the connection is open.
    pub fn send(&self, request: ChatRequest) -> Result<String, ClientError> {
        self.manager.send(request)
    }

    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.manager.cancel(correlation_id)
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    pub fn is_reconnecting(&self) -> bool {
        self.manager.is_reconnecting()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.manager.reconnect_attempts()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) {
        self.manager.wait_for_state(target).await
    }

    pub fn pending_count(&self) -> usize {
        self.manager.pending_count()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.manager.is_pending(correlation_id)
    }
}

pub struct ClientBuilder {
    endpoint: Box<dyn EndpointResolver>,
    credentials: Box<dyn CredentialProvider>,
    options: ClientOptions,
    handlers: Handlers,
}

impl ClientBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = Some(timeout);
        self
    }

    pub fn credential_placement(mut self, placement: CredentialPlacement) -> Self {
        self.options.credential_placement = placement;
        self
    }

    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn on_status(mut self, f: impl Fn(&StatusUpdate) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_status(f);
        self
    }

    pub fn on_token(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_token(f);
        self
    }

    pub fn on_response_complete(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_response_complete(f);
        self
    }

    pub fn on_chart(mut self, f: impl Fn(&Value, &str) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_chart(f);
        self
    }

    pub fn on_done(mut self, f: impl Fn(&Completion) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_done(f);
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_error(f);
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.handlers = self.handlers.on_state_change(f);
        self
    }

    pub fn build(self) -> Client {
        Client {
            manager: Arc::new(ConnectionManager::new(
                self.endpoint,
                self.credentials,
                self.options,
                self.handlers,
            )),
        }
    }
}
