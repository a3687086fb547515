//! Streaming chat client over a persistent WebSocket: request correlation,
//! per-frame callbacks, and automatic reconnection. Used by the `chat-stream` CLI.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod messages;
pub mod pending;
pub mod policy;

pub use client::{Client, ClientBuilder};
pub use config::{default_config_path, ChatSection, Config, ConfigError, ServerSection};
pub use connection::{
    ClientOptions, ConnectionState, CredentialPlacement, CredentialProvider, EndpointResolver,
};
pub use dispatcher::{Completion, Handlers, StatusUpdate};
pub use error::{ClientError, ErrorEvent, ErrorKind};
pub use messages::{ChatRequest, Frame};
pub use policy::RetryPolicy;
