//! Client error taxonomy and the error event handed to `on_error` callbacks.

use std::time::Duration;

/// Errors surfaced by the client, either as `Result` values or through the
/// `on_error` callback.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// No credential was available when opening the connection.
    #[error("no credential available, please sign in again")]
    Auth,
    /// The transport failed to open, closed abnormally, or is not open.
    #[error("connection error: {0}")]
    Connection(String),
    /// The connection went away while the exchange was still pending.
    #[error("disconnected before the exchange completed")]
    Disconnect,
    /// The backend answered the exchange with an `error` frame.
    #[error("backend error{}: {message}", .code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Protocol {
        code: Option<String>,
        message: String,
    },
    /// An inbound frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// No terminal frame arrived within the configured request timeout.
    #[error("no terminal frame within {0:?}")]
    Timeout(Duration),
    #[error("correlation id already pending: {0}")]
    DuplicateCorrelationId(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Coarse classification used by UI layers to pick a presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Connection,
    Disconnect,
    Protocol,
    MalformedFrame,
    Timeout,
    Request,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Auth => ErrorKind::Auth,
            ClientError::Connection(_) => ErrorKind::Connection,
            ClientError::Disconnect => ErrorKind::Disconnect,
            ClientError::Protocol { .. } => ErrorKind::Protocol,
            ClientError::MalformedFrame(_) => ErrorKind::MalformedFrame,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::DuplicateCorrelationId(_) | ClientError::InvalidRequest(_) => {
                ErrorKind::Request
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::MalformedFrame(e.to_string())
    }
}

/// What an `on_error` callback receives. Connection-level errors carry no
/// correlation id; per-exchange errors carry the id of the exchange they end.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub correlation_id: Option<String>,
    pub error: ClientError,
}

impl ErrorEvent {
    pub fn connection(error: ClientError) -> Self {
        Self {
            correlation_id: None,
            error,
        }
    }

    pub fn exchange(correlation_id: impl Into<String>, error: ClientError) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            error,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display_includes_code_when_present() {
        let with_code = ClientError::Protocol {
            code: Some("rate_limited".into()),
            message: "slow down".into(),
        };
        assert_eq!(with_code.to_string(), "backend error [rate_limited]: slow down");

        let without = ClientError::Protocol {
            code: None,
            message: "boom".into(),
        };
        assert_eq!(without.to_string(), "backend error: boom");
    }

    #[test]
    fn kinds_map_to_presentation_classes() {
        assert_eq!(ClientError::Auth.kind(), ErrorKind::Auth);
        assert_eq!(ClientError::Disconnect.kind(), ErrorKind::Disconnect);
        assert_eq!(
            ErrorEvent::exchange("m1", ClientError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::Timeout
        );
    }
}
