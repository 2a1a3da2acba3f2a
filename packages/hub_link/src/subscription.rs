//! Public surface: one facade per subscriber, shared connections and group
//! memberships underneath.
//!
//! A subscriber asks for a named event stream on a connection identity plus
//! zero or more groups; the facade acquires the shared connection, joins
//! the groups, forwards matching events, and undoes all of it in reverse
//! order on unsubscribe.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::{CallbackId, ConnectionConfig, GroupGuard, HubConnection};
use crate::error::HubError;
use crate::refcount::{RefCounted, RefCountedExt};
use crate::registry::RefCountedRegistry;
use crate::transport::EventHandler;

/// Buffered events per subscription. A slow consumer loses events rather
/// than blocking the transport's dispatch.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a subscription requests: a connection identity, an event name, and
/// the groups to join.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub connection: Arc<ConnectionConfig>,
    pub event_name: String,
    pub groups: Vec<String>,
}

impl SubscribeOptions {
    pub fn new(connection: Arc<ConnectionConfig>, event_name: impl Into<String>) -> Self {
        Self {
            connection,
            event_name: event_name.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }
}

enum FeedItem {
    Event(Value),
    Terminal(Option<HubError>),
}

/// Shares hub connections across any number of event subscriptions.
///
/// Connections are keyed by `Arc` identity of their config: subscriptions
/// made with the same `Arc<ConnectionConfig>` share one transport session.
/// A connection that completed (cleanly or with an error) is gone for
/// good; the next subscription with that config starts a fresh one.
pub struct HubMux {
    connections: RefCountedRegistry<HubConnection>,
}

impl HubMux {
    pub fn new() -> Self {
        Self {
            connections: RefCountedRegistry::new(
                |config: &Arc<ConnectionConfig>| HubConnection::new(config.clone()),
                |a, b| Arc::ptr_eq(a, b),
            ),
        }
    }

    /// Number of live shared connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Acquire an event stream. Starts the shared connection on its first
    /// subscriber and joins the requested groups as soon as the connection
    /// is up.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<EventSubscription, HubError> {
        let connection = self.connections.get_by_key(&options.connection)?;
        debug!(
            connection = %connection.name(),
            event = %options.event_name,
            groups = ?options.groups,
            "subscribing"
        );

        let (event_tx, event_rx) = mpsc::channel::<FeedItem>(EVENT_CHANNEL_CAPACITY);

        // exactly one terminal signal per subscription: an error item for a
        // lost connection, a bare close for a clean one
        let completion_task = {
            let completed = connection.lifecycle().completed();
            let connection = connection.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                completed.cancelled().await;
                let _ = event_tx
                    .send(FeedItem::Terminal(connection.lifecycle().error()))
                    .await;
            })
        };

        let groups = match connection.join_groups(options.groups.iter().cloned()) {
            Ok(groups) => groups,
            Err(err) => {
                completion_task.abort();
                connection.release().await;
                return Err(err);
            }
        };

        let handler: EventHandler = {
            let event_tx = event_tx.clone();
            let event_name = options.event_name.clone();
            Arc::new(move |payload: Value| {
                // never block the transport's dispatch
                if event_tx.try_send(FeedItem::Event(payload)).is_err() {
                    trace!(event = %event_name, "subscriber behind, dropping event");
                }
            })
        };
        let callback_id = match connection.on(&options.event_name, handler) {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    connection = %connection.name(),
                    event = %options.event_name,
                    error = %err,
                    "subscription setup failed"
                );
                groups.leave().await;
                completion_task.abort();
                connection.release().await;
                return Err(err);
            }
        };

        Ok(EventSubscription {
            connection,
            event_name: options.event_name,
            callback_id,
            groups: Some(groups),
            completion_task,
            events: event_rx,
            terminated: false,
        })
    }

    /// Force-release every shared connection. Used on full shutdown; every
    /// group gets its leave attempt and every session its close.
    pub async fn shutdown(&self) {
        self.connections.stop_all().await;
    }
}

impl Default for HubMux {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's handle on a shared event stream.
///
/// Events arrive through [`recv`](Self::recv); the stream ends with
/// exactly one terminal signal: `Some(Err(_))` for a lost connection,
/// `None` for a clean end. Call [`unsubscribe`](Self::unsubscribe) when
/// done; merely dropping the handle keeps the shared connection and
/// groups acquired.
pub struct EventSubscription {
    connection: Arc<HubConnection>,
    event_name: String,
    callback_id: CallbackId,
    groups: Option<GroupGuard>,
    completion_task: JoinHandle<()>,
    events: mpsc::Receiver<FeedItem>,
    terminated: bool,
}

impl EventSubscription {
    /// Next event payload. After the terminal signal every further call
    /// returns `None`.
    pub async fn recv(&mut self) -> Option<Result<Value, HubError>> {
        if self.terminated {
            return None;
        }
        match self.events.recv().await {
            Some(FeedItem::Event(payload)) => Some(Ok(payload)),
            Some(FeedItem::Terminal(Some(err))) => {
                self.terminated = true;
                Some(Err(err))
            }
            Some(FeedItem::Terminal(None)) | None => {
                self.terminated = true;
                None
            }
        }
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Current connected status of the underlying connection.
    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    /// The connected stream of the underlying connection.
    pub fn connected_stream(&self) -> watch::Receiver<bool> {
        self.connection.subscribe_connected()
    }

    pub async fn wait_for_connected(&self) {
        self.wait_for_status(true).await;
    }

    pub async fn wait_for_disconnected(&self) {
        self.wait_for_status(false).await;
    }

    /// Suspend until the connection reports the desired status; immediate
    /// if it already does.
    pub async fn wait_for_status(&self, status: bool) {
        self.connection.wait_for_status(status).await;
    }

    /// Invoke a hub method over the shared connection.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        self.connection.invoke(method, args).await
    }

    /// Tear down this subscription: unregister the wire callback, leave
    /// the groups (last holder only), detach from the connection's
    /// completion signal, release the connection. Strictly in that order,
    /// so no late event or completion can reach a subscriber that already
    /// started tearing down.
    pub async fn unsubscribe(mut self) {
        debug!(
            connection = %self.connection.name(),
            event = %self.event_name,
            "unsubscribing"
        );
        self.connection.off(self.callback_id);
        if let Some(groups) = self.groups.take() {
            groups.leave().await;
        }
        self.completion_task.abort();
        self.connection.release().await;
    }
}
