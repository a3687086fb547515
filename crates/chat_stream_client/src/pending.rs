//! Outstanding exchanges keyed by correlation id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::ClientError;
use crate::messages::ChatRequest;

/// One exchange waiting for its terminal frame, plus the side data gathered
/// from the frames seen so far.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub submitted_at: Instant,
    pub request: ChatRequest,
    /// Streamed tokens, replaced wholesale by a `response_complete` frame.
    pub text: String,
    pub chart: Option<Value>,
    pub conversation_id: Option<String>,
}

impl PendingRequest {
    pub fn new(correlation_id: impl Into<String>, request: ChatRequest) -> Self {
        let conversation_id = request.conversation_id.clone();
        Self {
            correlation_id: correlation_id.into(),
            submitted_at: Instant::now(),
            request,
            text: String::new(),
            chart: None,
            conversation_id,
        }
    }
}

/// Concurrency-safe table of pending exchanges. The receive loop and `send()`
/// mutate it from different tasks; the lock is never held across an await.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, entry: PendingRequest) -> Result<(), ClientError> {
        let mut entries = self.entries();
        if entries.contains_key(&entry.correlation_id) {
            return Err(ClientError::DuplicateCorrelationId(entry.correlation_id));
        }
        entries.insert(entry.correlation_id.clone(), entry);
        Ok(())
    }

    pub fn resolve(&self, correlation_id: &str) -> Option<PendingRequest> {
        self.entries().remove(correlation_id)
    }

    /// Apply `f` to the entry in place. Returns false if the id is not pending.
    pub fn update<F>(&self, correlation_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PendingRequest),
    {
        match self.entries().get_mut(correlation_id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Empty the table in one step and hand back everything it held.
    pub fn drain_all(&self) -> Vec<PendingRequest> {
        let mut drained: Vec<_> = self.entries().drain().map(|(_, v)| v).collect();
        drained.sort_by_key(|p| p.submitted_at);
        drained
    }

    /// Remove and return entries submitted more than `max_age` ago.
    pub fn expire(&self, max_age: Duration) -> Vec<PendingRequest> {
        let now = Instant::now();
        let mut entries = self.entries();
        let stale: Vec<String> = entries
            .values()
            .filter(|p| now.duration_since(p.submitted_at) >= max_age)
            .map(|p| p.correlation_id.clone())
            .collect();
        stale.iter().filter_map(|id| entries.remove(id)).collect()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
