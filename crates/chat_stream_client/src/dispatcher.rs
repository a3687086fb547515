//! Routes decoded frames to caller callbacks and keeps the pending table in step.
//!
//! Callbacks run on the receive loop. They are notifications: anything slow
//! must be handed off (a channel, a spawned task) or every exchange on the
//! connection stalls behind it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{ClientError, ErrorEvent};
use crate::messages::Frame;
use crate::pending::{PendingRequest, PendingRequestTable};
use crate::ConnectionState;

/// Status note from the backend; `correlation_id` is absent for connection-level notes.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub correlation_id: Option<String>,
    pub content: Option<String>,
}

/// Everything known about an exchange when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub correlation_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
    pub chart: Option<Value>,
    /// Extra fields the backend attached to the `done` frame.
    pub extra: Map<String, Value>,
    pub elapsed: Duration,
}

type StatusFn = dyn Fn(&StatusUpdate) + Send + Sync;
type TextFn = dyn Fn(&str, &str) + Send + Sync;
type ChartFn = dyn Fn(&Value, &str) + Send + Sync;
type DoneFn = dyn Fn(&Completion) + Send + Sync;
type ErrorFn = dyn Fn(&ErrorEvent) + Send + Sync;
type StateFn = dyn Fn(ConnectionState) + Send + Sync;

/// Caller-supplied callbacks. Unset callbacks drop their events.
#[derive(Clone, Default)]
pub struct Handlers {
    pub(crate) status: Option<Arc<StatusFn>>,
    pub(crate) token: Option<Arc<TextFn>>,
    pub(crate) response_complete: Option<Arc<TextFn>>,
    pub(crate) chart: Option<Arc<ChartFn>>,
    pub(crate) done: Option<Arc<DoneFn>>,
    pub(crate) error: Option<Arc<ErrorFn>>,
    pub(crate) state: Option<Arc<StateFn>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("status", &self.status.is_some())
            .field("token", &self.token.is_some())
            .field("response_complete", &self.response_complete.is_some())
            .field("chart", &self.chart.is_some())
            .field("done", &self.done.is_some())
            .field("error", &self.error.is_some())
            .field("state", &self.state.is_some())
            .finish()
    }
}

impl Handlers {
    pub fn on_status(mut self, f: impl Fn(&StatusUpdate) + Send + Sync + 'static) -> Self {
        self.status = Some(Arc::new(f));
        self
    }

    /// `f(fragment, correlation_id)`
    pub fn on_token(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.token = Some(Arc::new(f));
        self
    }

    /// `f(full_text, correlation_id)`
    pub fn on_response_complete(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.response_complete = Some(Arc::new(f));
        self
    }

    /// `f(chart_config, correlation_id)`
    pub fn on_chart(mut self, f: impl Fn(&Value, &str) + Send + Sync + 'static) -> Self {
        self.chart = Some(Arc::new(f));
        self
    }

    pub fn on_done(mut self, f: impl Fn(&Completion) + Send + Sync + 'static) -> Self {
        self.done = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(f));
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.state = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    handlers: Handlers,
}

impl Dispatcher {
    pub fn new(handlers: Handlers) -> Self {
        Self { handlers }
    }

    /// Route one frame. Never panics on unknown or already-resolved ids.
    pub fn dispatch(&self, frame: Frame, table: &PendingRequestTable) {
        match frame {
            Frame::Status {
                correlation_id,
                content,
            } => {
                if let Some(f) = &self.handlers.status {
                    f(&StatusUpdate {
                        correlation_id,
                        content,
                    });
                }
            }
            Frame::Token {
                correlation_id,
                content,
            } => {
                let Some(id) = self.advance(correlation_id, "token", table, |p| {
                    p.text.push_str(&content)
                }) else {
                    return;
                };
                if let Some(f) = &self.handlers.token {
                    f(&content, &id);
                }
            }
            Frame::ResponseComplete {
                correlation_id,
                full_response,
            } => {
                let Some(id) = self.advance(correlation_id, "response_complete", table, |p| {
                    p.text.clone_from(&full_response)
                }) else {
                    return;
                };
                if let Some(f) = &self.handlers.response_complete {
                    f(&full_response, &id);
                }
            }
            Frame::Chart {
                correlation_id,
                chart,
            } => {
                let Some(id) = self.advance(correlation_id, "chart", table, |p| {
                    p.chart = Some(chart.clone())
                }) else {
                    return;
                };
                if let Some(f) = &self.handlers.chart {
                    f(&chart, &id);
                }
            }
            Frame::Done {
                correlation_id,
                conversation_id,
                extra,
            } => {
                let Some(entry) = self.finish(correlation_id, "done", table) else {
                    return;
                };
                let mut completion = completion_from(entry);
                if conversation_id.is_some() {
                    completion.conversation_id = conversation_id;
                }
                completion.extra = extra;
                self.emit_done(&completion);
            }
            Frame::AssistantMessage {
                correlation_id,
                content,
                chart,
                conversation_id,
            } => {
                let Some(entry) = self.finish(correlation_id, "assistant_message", table) else {
                    return;
                };
                let id = entry.correlation_id.clone();
                if let Some(f) = &self.handlers.response_complete {
                    f(&content, &id);
                }
                if let (Some(f), Some(chart)) = (&self.handlers.chart, &chart) {
                    f(chart, &id);
                }
                let mut completion = completion_from(entry);
                completion.text = content;
                if chart.is_some() {
                    completion.chart = chart;
                }
                if conversation_id.is_some() {
                    completion.conversation_id = conversation_id;
                }
                self.emit_done(&completion);
            }
            Frame::Error {
                correlation_id: None,
                message,
                code,
            } => {
                tracing::warn!(%message, ?code, "backend error without correlation id");
                self.emit_error(&ErrorEvent::connection(ClientError::Protocol { code, message }));
            }
            Frame::Error {
                correlation_id,
                message,
                code,
            } => {
                let Some(entry) = self.finish(correlation_id, "error", table) else {
                    return;
                };
                self.emit_error(&ErrorEvent::exchange(
                    entry.correlation_id,
                    ClientError::Protocol { code, message },
                ));
            }
        }
    }

    /// Deliver `error` once for each entry, e.g. after a teardown drained the table.
    pub fn fail_all(&self, entries: Vec<PendingRequest>, error: &ClientError) {
        for entry in entries {
            self.emit_error(&ErrorEvent::exchange(entry.correlation_id, error.clone()));
        }
    }

    pub fn emit_error(&self, event: &ErrorEvent) {
        if let Some(f) = &self.handlers.error {
            f(event);
        }
    }

    pub fn emit_state(&self, state: ConnectionState) {
        if let Some(f) = &self.handlers.state {
            f(state);
        }
    }

    fn emit_done(&self, completion: &Completion) {
        if let Some(f) = &self.handlers.done {
            f(completion);
        }
    }

    /// Update a pending entry for a non-terminal frame; `None` drops the frame.
    fn advance<F>(
        &self,
        correlation_id: Option<String>,
        kind: &'static str,
        table: &PendingRequestTable,
        f: F,
    ) -> Option<String>
    where
        F: FnOnce(&mut PendingRequest),
    {
        let Some(id) = correlation_id else {
            tracing::warn!(kind, "dropping frame without correlation id");
            return None;
        };
        if table.update(&id, f) {
            Some(id)
        } else {
            tracing::debug!(kind, correlation_id = %id, "dropping frame for exchange that is not pending");
            None
        }
    }

    fn finish(
        &self,
        correlation_id: Option<String>,
        kind: &'static str,
        table: &PendingRequestTable,
    ) -> Option<PendingRequest> {
        let Some(id) = correlation_id else {
            tracing::warn!(kind, "dropping terminal frame without correlation id");
            return None;
        };
        let entry = table.resolve(&id);
        if entry.is_none() {
            tracing::warn!(kind, correlation_id = %id, "terminal frame for unknown exchange, dropped");
        }
        entry
    }
}

fn completion_from(entry: PendingRequest) -> Completion {
    Completion {
        elapsed: entry.submitted_at.elapsed(),
        correlation_id: entry.correlation_id,
        conversation_id: entry.conversation_id,
        text: entry.text,
        chart: entry.chart,
        extra: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::messages::ChatRequest;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Status(Option<String>),
        Token(String, String),
        Full(String, String),
        Chart(String),
        Done(String, String),
        Error(ErrorKind, Option<String>),
    }

    fn recording() -> (Dispatcher, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c, d, e, g) = (
            seen.clone(),
            seen.clone(),
            seen.clone(),
            seen.clone(),
            seen.clone(),
            seen.clone(),
        );
        let handlers = Handlers::default()
            .on_status(move |s| a.lock().unwrap().push(Seen::Status(s.content.clone())))
            .on_token(move |t, id| b.lock().unwrap().push(Seen::Token(t.into(), id.into())))
            .on_response_complete(move |t, id| c.lock().unwrap().push(Seen::Full(t.into(), id.into())))
            .on_chart(move |_, id| d.lock().unwrap().push(Seen::Chart(id.into())))
            .on_done(move |done| {
                e.lock()
                    .unwrap()
                    .push(Seen::Done(done.correlation_id.clone(), done.text.clone()))
            })
            .on_error(move |err| g.lock().unwrap().push(Seen::Error(err.kind(), err.correlation_id.clone())));
        (Dispatcher::new(handlers), seen)
    }

    fn table_with(ids: &[&str]) -> PendingRequestTable {
        let table = PendingRequestTable::new();
        for id in ids {
            table
                .register(PendingRequest::new(*id, ChatRequest::new("q", "ds")))
                .unwrap();
        }
        table
    }

    fn frame(text: &str) -> Frame {
        Frame::decode(text).unwrap()
    }

    #[test]
    fn non_terminal_frames_keep_entry() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m1"]);
        dispatcher.dispatch(frame(r#"{"type":"status","clientMessageId":"m1","content":"thinking"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"token","clientMessageId":"m1","content":"Hi"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"response_complete","clientMessageId":"m1","fullResponse":"Hi there"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"chart","clientMessageId":"m1","chartConfig":{"kind":"bar"}}"#), &table);

        assert!(table.contains("m1"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Seen::Status(Some("thinking".into())),
                Seen::Token("Hi".into(), "m1".into()),
                Seen::Full("Hi there".into(), "m1".into()),
                Seen::Chart("m1".into()),
            ]
        );
    }

    #[test]
    fn status_fires_without_pending_entry() {
        let (dispatcher, seen) = recording();
        let table = PendingRequestTable::new();
        dispatcher.dispatch(frame(r#"{"type":"status","content":"warming up"}"#), &table);
        assert_eq!(*seen.lock().unwrap(), vec![Seen::Status(Some("warming up".into()))]);
    }

    #[test]
    fn done_fires_once_with_accumulated_text() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m1"]);
        dispatcher.dispatch(frame(r#"{"type":"token","clientMessageId":"m1","content":"Hel"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"token","clientMessageId":"m1","content":"lo"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"done","clientMessageId":"m1"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"done","clientMessageId":"m1"}"#), &table);

        assert!(table.is_empty());
        let done: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, Seen::Done(..)))
            .cloned()
            .collect();
        assert_eq!(done, vec![Seen::Done("m1".into(), "Hello".into())]);
    }

    #[test]
    fn done_carries_chart_and_extra_fields() {
        let table = table_with(&["m1"]);
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = completions.clone();
        let dispatcher = Dispatcher::new(Handlers::default().on_done(move |c| sink.lock().unwrap().push(c.clone())));
        dispatcher.dispatch(frame(r#"{"type":"chart","clientMessageId":"m1","chartConfig":{"kind":"pie"}}"#), &table);
        dispatcher.dispatch(
            frame(r#"{"type":"done","clientMessageId":"m1","conversationId":"c7","rows":3}"#),
            &table,
        );
        let completions = completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].chart, Some(json!({"kind": "pie"})));
        assert_eq!(completions[0].conversation_id.as_deref(), Some("c7"));
        assert_eq!(completions[0].extra.get("rows"), Some(&json!(3)));
    }

    #[test]
    fn assistant_message_is_one_terminal_event() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m2"]);
        dispatcher.dispatch(
            frame(r#"{"type":"assistant_message","clientMessageId":"m2","content":"Total is 4","chartConfig":{"kind":"line"}}"#),
            &table,
        );
        dispatcher.dispatch(
            frame(r#"{"type":"assistant_message","clientMessageId":"m2","content":"again"}"#),
            &table,
        );
        assert!(table.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Seen::Full("Total is 4".into(), "m2".into()),
                Seen::Chart("m2".into()),
                Seen::Done("m2".into(), "Total is 4".into()),
            ]
        );
    }

    #[test]
    fn error_frame_ends_exchange_and_is_idempotent() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m1", "m2"]);
        dispatcher.dispatch(frame(r#"{"type":"error","clientMessageId":"m1","content":"no such dataset"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"error","clientMessageId":"m1","content":"no such dataset"}"#), &table);
        assert!(!table.contains("m1"));
        assert!(table.contains("m2"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Seen::Error(ErrorKind::Protocol, Some("m1".into()))]
        );
    }

    #[test]
    fn error_frame_with_numeric_code_still_ends_exchange() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m1"]);
        dispatcher.dispatch(
            frame(r#"{"type":"error","clientMessageId":"m1","content":"rate limited","code":429}"#),
            &table,
        );
        assert!(table.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Seen::Error(ErrorKind::Protocol, Some("m1".into()))]
        );
    }

    #[test]
    fn unknown_ids_are_dropped() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m1"]);
        dispatcher.dispatch(frame(r#"{"type":"token","clientMessageId":"zz","content":"x"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"done","clientMessageId":"zz"}"#), &table);
        dispatcher.dispatch(frame(r#"{"type":"done"}"#), &table);
        assert!(seen.lock().unwrap().is_empty());
        assert!(table.contains("m1"));
    }

    #[test]
    fn uncorrelated_error_goes_to_connection_callback() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["m1"]);
        dispatcher.dispatch(frame(r#"{"type":"error","content":"server overloaded"}"#), &table);
        assert!(table.contains("m1"));
        assert_eq!(*seen.lock().unwrap(), vec![Seen::Error(ErrorKind::Protocol, None)]);
    }

    #[test]
    fn fail_all_delivers_one_error_per_entry() {
        let (dispatcher, seen) = recording();
        let table = table_with(&["a", "b", "c"]);
        dispatcher.fail_all(table.drain_all(), &ClientError::Disconnect);
        assert!(table.is_empty());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen
            .iter()
            .all(|s| matches!(s, Seen::Error(ErrorKind::Disconnect, Some(_)))));
    }
}
