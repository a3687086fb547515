//! Wire frames for the chat channel. One JSON object per WebSocket text message.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

/// A chat request as the caller describes it; the correlation id is added on send.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub dataset_id: String,
    pub conversation_id: Option<String>,
    pub streaming: bool,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, dataset_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            dataset_id: dataset_id.into(),
            conversation_id: None,
            streaming: true,
        }
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// Client → server: chat request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage<'a> {
    pub client_message_id: &'a str,
    pub message: &'a str,
    pub dataset_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<&'a str>,
    pub streaming: bool,
}

impl<'a> OutboundMessage<'a> {
    pub fn new(client_message_id: &'a str, request: &'a ChatRequest) -> Self {
        Self {
            client_message_id,
            message: &request.message,
            dataset_id: &request.dataset_id,
            conversation_id: request.conversation_id.as_deref(),
            streaming: request.streaming,
        }
    }
}

/// Client → server: abandon an exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelMessage<'a> {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub client_message_id: &'a str,
}

impl<'a> CancelMessage<'a> {
    pub fn new(client_message_id: &'a str) -> Self {
        Self {
            typ: "cancel",
            client_message_id,
        }
    }
}

/// Serialize a request together with its correlation id.
pub fn encode_request(client_message_id: &str, request: &ChatRequest) -> Result<String, ClientError> {
    serde_json::to_string(&OutboundMessage::new(client_message_id, request))
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))
}

pub fn encode_cancel(client_message_id: &str) -> Result<String, ClientError> {
    serde_json::to_string(&CancelMessage::new(client_message_id))
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))
}

/// Backends send codes and conversation ids as either strings or numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Server → client: progress note.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// Server → client: incremental text fragment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    content: String,
}

/// Server → client: full response text, non-incremental.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCompleteFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    #[serde(alias = "content")]
    full_response: String,
}

/// Server → client: visualization payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    chart_config: Value,
}

/// Server → client: exchange finished. Unknown fields are kept as side data.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DoneFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    conversation_id: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Server → client: non-streaming answer in a single frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssistantMessageFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    chart_config: Option<Value>,
    #[serde(default, deserialize_with = "string_or_number")]
    conversation_id: Option<String>,
}

/// Server → client: exchange failed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorFrame {
    #[serde(default)]
    client_message_id: Option<String>,
    #[serde(default, alias = "content")]
    message: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    code: Option<String>,
}

/// One inbound frame; discriminator is the JSON "type" field.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status {
        correlation_id: Option<String>,
        content: Option<String>,
    },
    Token {
        correlation_id: Option<String>,
        content: String,
    },
    ResponseComplete {
        correlation_id: Option<String>,
        full_response: String,
    },
    Chart {
        correlation_id: Option<String>,
        chart: Value,
    },
    Done {
        correlation_id: Option<String>,
        conversation_id: Option<String>,
        extra: Map<String, Value>,
    },
    AssistantMessage {
        correlation_id: Option<String>,
        content: String,
        chart: Option<Value>,
        conversation_id: Option<String>,
    },
    Error {
        correlation_id: Option<String>,
        message: String,
        code: Option<String>,
    },
}

impl Frame {
    /// Decode one text message.
    pub fn decode(text: &str) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, ClientError> {
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ClientError::MalformedFrame("missing type".into()))?;
        match typ {
            "status" => {
                let m: StatusFrame = serde_json::from_value(value.clone())?;
                Ok(Frame::Status {
                    correlation_id: m.client_message_id,
                    content: m.content,
                })
            }
            "token" => {
                let m: TokenFrame = serde_json::from_value(value.clone())?;
                Ok(Frame::Token {
                    correlation_id: m.client_message_id,
                    content: m.content,
                })
            }
            "response_complete" => {
                let m: ResponseCompleteFrame = serde_json::from_value(value.clone())?;
                Ok(Frame::ResponseComplete {
                    correlation_id: m.client_message_id,
                    full_response: m.full_response,
                })
            }
            "chart" => {
                let m: ChartFrame = serde_json::from_value(value.clone())?;
                Ok(Frame::Chart {
                    correlation_id: m.client_message_id,
                    chart: m.chart_config,
                })
            }
            "done" => {
                let mut m: DoneFrame = serde_json::from_value(value.clone())?;
                m.extra.remove("type");
                Ok(Frame::Done {
                    correlation_id: m.client_message_id,
                    conversation_id: m.conversation_id,
                    extra: m.extra,
                })
            }
            "assistant_message" => {
                let m: AssistantMessageFrame = serde_json::from_value(value.clone())?;
                Ok(Frame::AssistantMessage {
                    correlation_id: m.client_message_id,
                    content: m.content,
                    chart: m.chart_config.filter(|c| !c.is_null()),
                    conversation_id: m.conversation_id,
                })
            }
            "error" => {
                let m: ErrorFrame = serde_json::from_value(value.clone())?;
                Ok(Frame::Error {
                    correlation_id: m.client_message_id,
                    message: m.message.unwrap_or_else(|| "unknown error".into()),
                    code: m.code,
                })
            }
            _ => Err(ClientError::MalformedFrame(format!("unknown type: {}", typ))),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Frame::Status { correlation_id, .. }
            | Frame::Token { correlation_id, .. }
            | Frame::ResponseComplete { correlation_id, .. }
            | Frame::Chart { correlation_id, .. }
            | Frame::Done { correlation_id, .. }
            | Frame::AssistantMessage { correlation_id, .. }
            | Frame::Error { correlation_id, .. } => correlation_id.as_deref(),
        }
    }

    /// `done`, `assistant_message` and `error` close out an exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::Done { .. } | Frame::AssistantMessage { .. } | Frame::Error { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Status { .. } => "status",
            Frame::Token { .. } => "token",
            Frame::ResponseComplete { .. } => "response_complete",
            Frame::Chart { .. } => "chart",
            Frame::Done { .. } => "done",
            Frame::AssistantMessage { .. } => "assistant_message",
            Frame::Error { .. } => "error",
        }
    }
}
