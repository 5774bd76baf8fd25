//! Scripted collaborators for session tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use vts_core::{StorageError, TokenStore, Transport, TransportError, TransportEvent};

#[derive(Default)]
struct MockState {
    started: Vec<String>,
    stops: usize,
    sent: Vec<Value>,
    events: VecDeque<TransportEvent>,
    open: bool,
    fail_start: bool,
}

/// Transport whose inbound events are pushed by the test.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn push(&self, event: TransportEvent) {
        if event == TransportEvent::Opened {
            self.state().open = true;
        }
        self.state().events.push_back(event);
    }

    pub(crate) fn push_json(&self, value: &Value) {
        self.push(TransportEvent::Message(value.to_string()));
    }

    /// Reply to a sent request, echoing its `requestID`.
    pub(crate) fn respond(&self, request_id: &str, message_type: &str, data: Value) {
        self.push_json(&json!({
            "apiName": "VTubeStudioPublicAPI",
            "apiVersion": "1.0",
            "timestamp": 1_700_000_000_000_i64,
            "requestID": request_id,
            "messageType": message_type,
            "data": data,
        }));
    }

    /// Reply to the most recent request of `request_type`.
    pub(crate) fn respond_to(&self, request_type: &str, message_type: &str, data: Value) {
        let id = self
            .last_sent(request_type)
            .map(|v| v["requestID"].as_str().unwrap_or_default().to_string())
            .unwrap();
        self.respond(&id, message_type, data);
    }

    pub(crate) fn push_event(&self, event_name: &str, data: Value) {
        self.push_json(&json!({
            "apiName": "VTubeStudioPublicAPI",
            "requestID": "event",
            "messageType": event_name,
            "data": data,
        }));
    }

    /// Make further sends fail as if the socket had gone away.
    pub(crate) fn refuse_sends(&self) {
        self.state().open = false;
    }

    pub(crate) fn fail_next_start(&self) {
        self.state().fail_start = true;
    }

    pub(crate) fn sent(&self) -> Vec<Value> {
        self.state().sent.clone()
    }

    pub(crate) fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|v| v["messageType"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub(crate) fn last_sent(&self, message_type: &str) -> Option<Value> {
        self.sent()
            .into_iter()
            .rev()
            .find(|v| v["messageType"] == message_type)
    }

    pub(crate) fn clear_sent(&self) {
        self.state().sent.clear();
    }

    pub(crate) fn starts(&self) -> usize {
        self.state().started.len()
    }

    pub(crate) fn last_url(&self) -> Option<String> {
        self.state().started.last().cloned()
    }

    pub(crate) fn stops(&self) -> usize {
        self.state().stops
    }
}

impl Transport for MockTransport {
    fn start(&mut self, url: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_start) {
            return Err(TransportError::StartFailed("refused".into()));
        }
        state.started.push(url.to_string());
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state();
        state.stops += 1;
        state.open = false;
        state.events.clear();
    }

    fn send(&mut self, text: String) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.sent.push(serde_json::from_str(&text).unwrap());
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.state().events.pop_front()
    }

    fn is_open(&self) -> bool {
        self.state().open
    }
}

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    saves: usize,
    deletes: usize,
}

/// Token store counting writes.
#[derive(Clone, Default)]
pub(crate) struct CountingTokenStore {
    state: Arc<Mutex<TokenState>>,
}

impl CountingTokenStore {
    pub(crate) fn with_token(token: &str) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().token = Some(token.to_string());
        store
    }

    pub(crate) fn token(&self) -> Option<String> {
        self.state.lock().unwrap().token.clone()
    }

    pub(crate) fn saves(&self) -> usize {
        self.state.lock().unwrap().saves
    }

    pub(crate) fn deletes(&self) -> usize {
        self.state.lock().unwrap().deletes
    }
}

impl TokenStore for CountingTokenStore {
    fn load(&self) -> Result<Option<String>, StorageError> {
        Ok(self.token())
    }

    fn save(&self, token: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.token = Some(token.to_string());
        state.saves += 1;
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.token = None;
        state.deletes += 1;
        Ok(())
    }
}

/// Ordered log of callback invocations.
#[derive(Clone, Default)]
pub(crate) struct CallLog {
    calls: Rc<RefCell<Vec<String>>>,
}

impl CallLog {
    pub(crate) fn push(&self, call: impl Into<String>) {
        self.calls.borrow_mut().push(call.into());
    }

    /// Closure appending `call` each time it runs.
    pub(crate) fn recorder(&self, call: &str) -> impl FnMut() + 'static {
        let log = self.clone();
        let call = call.to_string();
        move || log.push(call.clone())
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}
