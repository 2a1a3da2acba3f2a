//! Shared hub connection.
//!
//! One transport session, ref-counted across every subscriber that uses
//! it. Owns the explicit connection state machine, the backoff-driven
//! connect loop, the per-connection group registry, and the wire callback
//! multiplexer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::group::GroupMembership;
use crate::refcount::{LifecycleState, RefCounted, RefCountedExt};
use crate::registry::{Keyed, RefCountedRegistry};
use crate::retry::{RetryContext, RetryPolicy};
use crate::transport::{EventHandler, HubSession, SessionFactory, SessionNotification};

/// Default wait after a transition into connected before rejoining groups.
/// Joining immediately after a reconnect can hang on some servers.
pub const DEFAULT_REJOIN_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Identity and behavior of one shared connection.
///
/// Connections are deduplicated by `Arc` identity of their config: two
/// subscriptions share a connection iff they hold the same
/// `Arc<ConnectionConfig>`. Two configs describing the same URL are
/// distinct keys.
pub struct ConnectionConfig {
    /// Display name for log lines, typically the hub URL.
    pub url: String,
    /// Connect-retry policy. `None` means any open failure is terminal.
    pub retry: Option<Arc<dyn RetryPolicy>>,
    /// Settle delay before group rejoin, see
    /// [`DEFAULT_REJOIN_SETTLE_DELAY`].
    pub rejoin_settle_delay: Duration,
    /// Builds the transport session when the connection starts.
    pub session_factory: Box<SessionFactory>,
}

impl ConnectionConfig {
    pub fn new(
        url: impl Into<String>,
        session_factory: impl Fn() -> Arc<dyn HubSession> + Send + Sync + 'static,
    ) -> Self {
        Self {
            url: url.into(),
            retry: None,
            rejoin_settle_delay: DEFAULT_REJOIN_SETTLE_DELAY,
            session_factory: Box::new(session_factory),
        }
    }

    pub fn with_retry(mut self, policy: impl RetryPolicy) -> Self {
        self.retry = Some(Arc::new(policy));
        self
    }

    pub fn with_rejoin_settle_delay(mut self, delay: Duration) -> Self {
        self.rejoin_settle_delay = delay;
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("retry", &self.retry.is_some())
            .field("rejoin_settle_delay", &self.rejoin_settle_delay)
            .finish_non_exhaustive()
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Transition table. Anything not listed is ignored by `set_state`.
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnecting)
                | (Reconnecting, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Stable identity of one registered wire callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct HubCallback {
    id: u64,
    event_name: String,
    handler: EventHandler,
}

/// One shared hub connection.
///
/// Created through a registry keyed by `Arc<ConnectionConfig>`; starts its
/// transport session on the first acquire and tears everything down on the
/// last release. An unexpected transport loss puts the connection into a
/// terminal error state that every attached consumer observes through the
/// completion signal.
pub struct HubConnection {
    config: Arc<ConnectionConfig>,
    lifecycle: LifecycleState,
    state_tx: watch::Sender<ConnectionState>,
    connected_tx: watch::Sender<bool>,
    /// Settled exactly once with the outcome of the initial connect loop.
    connect_result_tx: watch::Sender<Option<Result<(), HubError>>>,
    session: Mutex<Option<Arc<dyn HubSession>>>,
    groups: RefCountedRegistry<GroupMembership>,
    callbacks: Mutex<Vec<HubCallback>>,
    next_callback_id: AtomicU64,
    /// Cancels the connect loop and the notification listener on teardown.
    tasks: CancellationToken,
    weak_self: Weak<HubConnection>,
}

impl HubConnection {
    pub fn new(config: Arc<ConnectionConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HubConnection>| {
            let factory_weak = weak.clone();
            let groups = RefCountedRegistry::new(
                move |name: &String| GroupMembership::new(factory_weak.clone(), name.clone()),
                |a: &String, b: &String| a == b,
            );
            let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
            let (connected_tx, _) = watch::channel(false);
            let (connect_result_tx, _) = watch::channel(None);
            Self {
                config,
                lifecycle: LifecycleState::new(),
                state_tx,
                connected_tx,
                connect_result_tx,
                session: Mutex::new(None),
                groups,
                callbacks: Mutex::new(Vec::new()),
                next_callback_id: AtomicU64::new(0),
                tasks: CancellationToken::new(),
                weak_self: weak.clone(),
            }
        })
    }

    /// Connection name for log lines (the configured URL).
    pub fn name(&self) -> &str {
        &self.config.url
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The full state stream. Equal consecutive states never re-emit.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The connected stream, derived from the state stream.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Suspend until the connected status equals `status`. Returns
    /// immediately when it already does.
    pub async fn wait_for_status(&self, status: bool) {
        let mut rx = self.connected_tx.subscribe();
        let _ = rx.wait_for(|connected| *connected == status).await;
    }

    /// Outcome of the initial connect loop. Settled exactly once; later
    /// reconnects surface through the state stream only.
    pub async fn connect_result(&self) -> Result<(), HubError> {
        let mut rx = self.connect_result_tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(HubError::ConnectionLost {
                    name: self.name().into(),
                    reason: "was dropped before connecting".into(),
                });
            }
        }
    }

    /// Register `handler` for `event_name` on the wire. Re-registering the
    /// same handler `Arc` returns the existing id without touching the
    /// wire; ids are unique and monotonic per connection instance.
    pub fn on(&self, event_name: &str, handler: EventHandler) -> Result<CallbackId, HubError> {
        let session = self.live_session().ok_or_else(|| {
            HubError::Usage(format!(
                "cannot register '{event_name}' on connection {} because it is stopped",
                self.name()
            ))
        })?;
        let mut callbacks = self.callbacks.lock();
        if let Some(existing) = callbacks
            .iter()
            .find(|cb| Arc::ptr_eq(&cb.handler, &handler))
        {
            return Ok(CallbackId(existing.id));
        }
        session.on(event_name, handler.clone());
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst) + 1;
        callbacks.push(HubCallback {
            id,
            event_name: event_name.to_string(),
            handler,
        });
        Ok(CallbackId(id))
    }

    /// Remove a previously registered callback. Unknown ids are a no-op.
    pub fn off(&self, id: CallbackId) {
        let removed = {
            let mut callbacks = self.callbacks.lock();
            callbacks
                .iter()
                .position(|cb| cb.id == id.0)
                .map(|idx| callbacks.remove(idx))
        };
        if let Some(cb) = removed {
            if let Some(session) = self.live_session() {
                session.off(&cb.event_name, &cb.handler);
            }
        }
    }

    /// Invoke a hub method on the live session.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, HubError> {
        let session = self.live_session().ok_or_else(|| HubError::Invoke {
            method: method.into(),
            reason: format!("connection {} is stopped", self.name()),
        })?;
        match session.invoke(method, args).await {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(connection = %self.name(), method, error = %err, "invoke failed");
                Err(err)
            }
        }
    }

    /// Join `groups` on this connection, returning a guard whose `leave`
    /// releases every membership acquired here. Memberships are shared:
    /// a group is joined on the wire by its first holder and left by its
    /// last. Zero groups yields a no-op guard.
    pub fn join_groups<I, S>(&self, groups: I) -> Result<GroupGuard, HubError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(connection) = self.weak_self.upgrade() else {
            return Ok(GroupGuard {
                connection: None,
                names: Vec::new(),
            });
        };
        let mut names = Vec::new();
        for group in groups {
            let name: String = group.into();
            self.groups.get_by_key(&name)?;
            names.push(name);
        }
        Ok(GroupGuard {
            connection: Some(connection),
            names,
        })
    }

    pub(crate) fn rejoin_settle_delay(&self) -> Duration {
        self.config.rejoin_settle_delay
    }

    pub(crate) fn live_session(&self) -> Option<Arc<dyn HubSession>> {
        self.session.lock().clone()
    }

    /// Apply a state transition, ignoring no-ops and anything the
    /// transition table does not allow.
    fn set_state(&self, next: ConnectionState) {
        let prev = *self.state_tx.borrow();
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            debug!(
                connection = %self.name(),
                from = %prev,
                to = %next,
                "ignoring invalid state transition"
            );
            return;
        }
        info!(
            connection = %self.name(),
            "connection state changed from {prev} to {next}"
        );
        self.state_tx.send_replace(next);
        self.connected_tx.send_replace(next.is_connected());
    }

    fn settle_connect(&self, result: Result<(), HubError>) {
        self.connect_result_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(result);
                true
            } else {
                false
            }
        });
    }

    /// Drop the session and stop background tasks after a terminal error.
    /// The normal stop hook never runs for an errored connection.
    async fn teardown_after_error(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.tasks.cancel();
    }
}

impl Keyed for HubConnection {
    type Key = Arc<ConnectionConfig>;

    fn key(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }
}

#[async_trait]
impl RefCounted for HubConnection {
    fn lifecycle(&self) -> &LifecycleState {
        &self.lifecycle
    }

    fn describe(&self) -> String {
        format!("connection {}", self.name())
    }

    fn on_start(&self) {
        let Some(connection) = self.weak_self.upgrade() else {
            return;
        };
        let session = (self.config.session_factory)();
        *self.session.lock() = Some(session.clone());

        // subscribe before the first open so no notification is missed
        let notifications = session.notifications();
        tokio::spawn(notification_loop(connection.clone(), notifications));

        self.set_state(ConnectionState::Connecting);
        tokio::spawn(connect_loop(connection, session));
    }

    async fn on_stop(&self) {
        if self.lifecycle.error().is_none() {
            self.set_state(ConnectionState::Disconnecting);
            // every group gets its leave attempt before the session goes
            self.groups.stop_all().await;
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        self.tasks.cancel();
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Maps transport notifications onto state transitions until the session
/// closes or the connection is torn down.
async fn notification_loop(
    connection: Arc<HubConnection>,
    mut notifications: broadcast::Receiver<SessionNotification>,
) {
    loop {
        tokio::select! {
            _ = connection.tasks.cancelled() => break,
            notification = notifications.recv() => match notification {
                Ok(SessionNotification::Reconnected) => {
                    connection.set_state(ConnectionState::Connected);
                }
                Ok(SessionNotification::Reconnecting) => {
                    connection.set_state(ConnectionState::Reconnecting);
                }
                Ok(SessionNotification::Closed(reason)) => {
                    if !connection.lifecycle().is_complete() {
                        let reason = reason.unwrap_or_else(|| "was lost".into());
                        error!(
                            connection = %connection.name(),
                            %reason,
                            "connection lost"
                        );
                        connection.raise_error(HubError::ConnectionLost {
                            name: connection.name().into(),
                            reason,
                        });
                        connection.set_state(ConnectionState::Disconnected);
                        connection.teardown_after_error().await;
                    } else {
                        connection.set_state(ConnectionState::Disconnected);
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        connection = %connection.name(),
                        skipped,
                        "lagged behind session notifications"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Opens the session, retrying per the configured policy. The outward
/// result settles exactly once; retries after that only move the state
/// stream.
async fn connect_loop(connection: Arc<HubConnection>, session: Arc<dyn HubSession>) {
    let first_attempt = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        match session.open().await {
            Ok(()) => {
                connection.settle_connect(Ok(()));
                connection.set_state(ConnectionState::Connected);
                return;
            }
            Err(err) => {
                let delay = connection.config.retry.as_ref().and_then(|policy| {
                    policy.next_delay(&RetryContext {
                        elapsed: first_attempt.elapsed(),
                        previous_attempts: attempts,
                        reason: &err,
                    })
                });
                match delay {
                    Some(delay) => {
                        attempts += 1;
                        debug!(
                            connection = %connection.name(),
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "connect attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = connection.tasks.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        warn!(
                            connection = %connection.name(),
                            error = %err,
                            "connect failed, giving up"
                        );
                        connection.settle_connect(Err(err.clone()));
                        if !connection.lifecycle().is_complete() {
                            connection.raise_error(HubError::ConnectionLost {
                                name: connection.name().into(),
                                reason: err.to_string(),
                            });
                        }
                        connection.set_state(ConnectionState::Disconnected);
                        connection.teardown_after_error().await;
                        return;
                    }
                }
            }
        }
    }
}

/// Releases the group memberships acquired by one
/// [`HubConnection::join_groups`] call.
#[must_use = "dropping the guard without calling leave() keeps the groups joined"]
pub struct GroupGuard {
    connection: Option<Arc<HubConnection>>,
    names: Vec<String>,
}

impl GroupGuard {
    /// Release every membership this guard holds, leaving each group on
    /// the wire when this was its last holder. Safe with zero groups.
    pub async fn leave(mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        for name in self.names.drain(..) {
            connection.groups.stop_by_key(&name).await;
        }
    }
}
