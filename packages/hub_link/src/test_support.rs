//! Shared test doubles: a scripted in-memory hub session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::connection::ConnectionConfig;
use crate::error::HubError;
use crate::transport::{EventHandler, HubSession, SessionNotification};

/// In-memory [`HubSession`] with scripted open outcomes and recorded
/// invokes. Open attempts consume the scripted results front to back; once
/// exhausted, every further open succeeds.
pub struct ScriptedSession {
    open_results: Mutex<VecDeque<Result<(), HubError>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    invokes: Mutex<Vec<(String, Vec<Value>)>>,
    failing_methods: Mutex<Vec<String>>,
    handlers: Mutex<Vec<(String, EventHandler)>>,
    notification_tx: broadcast::Sender<SessionNotification>,
}

impl ScriptedSession {
    pub fn new() -> Arc<Self> {
        Self::with_open_results(Vec::new())
    }

    pub fn with_open_results(results: Vec<Result<(), HubError>>) -> Arc<Self> {
        let (notification_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            open_results: Mutex::new(results.into()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            invokes: Mutex::new(Vec::new()),
            failing_methods: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            notification_tx,
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// How many times `method` was invoked.
    pub fn invoked(&self, method: &str) -> usize {
        self.invokes.lock().iter().filter(|(m, _)| m == method).count()
    }

    /// Full invoke log, in order.
    pub fn invoke_log(&self) -> Vec<(String, Vec<Value>)> {
        self.invokes.lock().clone()
    }

    /// Make every future invoke of `method` fail.
    pub fn fail_invokes_of(&self, method: &str) {
        self.failing_methods.lock().push(method.to_string());
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Push a server event to every handler registered for `event_name`.
    pub fn push_event(&self, event_name: &str, payload: Value) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .filter(|(name, _)| name == event_name)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(payload.clone());
        }
    }

    /// Emit a session lifecycle notification.
    pub fn notify(&self, notification: SessionNotification) {
        let _ = self.notification_tx.send(notification);
    }
}

#[async_trait]
impl HubSession for ScriptedSession {
    async fn open(&self) -> Result<(), HubError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_results.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        self.invokes.lock().push((method.to_string(), args));
        if self.failing_methods.lock().iter().any(|m| m == method) {
            return Err(HubError::Invoke {
                method: method.into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(Value::Null)
    }

    fn on(&self, event_name: &str, handler: EventHandler) {
        self.handlers.lock().push((event_name.to_string(), handler));
    }

    fn off(&self, event_name: &str, handler: &EventHandler) {
        self.handlers
            .lock()
            .retain(|(name, h)| !(name == event_name && Arc::ptr_eq(h, handler)));
    }

    fn notifications(&self) -> broadcast::Receiver<SessionNotification> {
        self.notification_tx.subscribe()
    }
}

/// A connection config wired to one fixed scripted session.
pub fn scripted_config(session: &Arc<ScriptedSession>) -> ConnectionConfig {
    let session = session.clone();
    ConnectionConfig::new("hub://test", move || {
        session.clone() as Arc<dyn HubSession>
    })
}

/// Install a test log subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
