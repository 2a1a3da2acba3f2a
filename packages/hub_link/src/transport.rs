//! Abstract hub transport session.
//!
//! The concrete wire client lives outside this crate; the core only relies
//! on this interface. A session is one bidirectional link to the remote
//! hub: it can be opened, closed, invoked on, and it pushes named events
//! and lifecycle notifications back.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::HubError;

/// Server-push event handler. Identity (for [`HubSession::off`]) is `Arc`
/// pointer equality.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Builds a fresh session each time a connection starts.
pub type SessionFactory = dyn Fn() -> Arc<dyn HubSession> + Send + Sync;

/// Lifecycle notifications emitted by a transport session.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// The session lost its link and is re-establishing it internally.
    Reconnecting,
    /// The session re-established its link.
    Reconnected,
    /// The session closed for good. `Some` carries the transport's failure
    /// reason; `None` is a reasonless close.
    Closed(Option<String>),
}

/// One bidirectional hub session.
///
/// `open` may be called again after a failure (the connect loop retries
/// it). `close` is best-effort, must tolerate repeated calls, and must
/// never panic.
#[async_trait]
pub trait HubSession: Send + Sync + 'static {
    async fn open(&self) -> Result<(), HubError>;

    async fn close(&self);

    /// Invoke a named method on the hub. Valid only while open.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError>;

    /// Register a raw server-push handler for `event_name`.
    fn on(&self, event_name: &str, handler: EventHandler);

    /// Remove a raw handler previously registered for `event_name`.
    fn off(&self, event_name: &str, handler: &EventHandler);

    /// Subscribe to session lifecycle notifications.
    fn notifications(&self) -> broadcast::Receiver<SessionNotification>;
}
