//! Group membership on a shared connection.
//!
//! One membership per group name per connection, ref-counted across all
//! subscribers interested in that group. The first holder joins the group
//! on the wire, the last holder leaves it, and the membership rejoins
//! after every reconnect since the server forgets group assignments when
//! a connection drops.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::HubConnection;
use crate::error::HubError;
use crate::refcount::{LifecycleState, RefCounted, RefCountedExt};
use crate::registry::Keyed;

/// Hub method invoked to join a group.
pub const JOIN_GROUP_METHOD: &str = "joinGroup";
/// Hub method invoked to leave a group.
pub const LEAVE_GROUP_METHOD: &str = "leaveGroup";

/// Membership in one named group on one connection.
///
/// Join and leave failures are isolated here: the membership enters error
/// state and drops out of the connection's group registry, while the
/// connection and every other group carry on.
pub struct GroupMembership {
    connection: Weak<HubConnection>,
    name: String,
    lifecycle: LifecycleState,
    weak_self: Weak<GroupMembership>,
}

impl GroupMembership {
    pub(crate) fn new(connection: Weak<HubConnection>, name: String) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connection,
            name,
            lifecycle: LifecycleState::new(),
            weak_self: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke joinGroup/leaveGroup while the connection is connected;
    /// skipped otherwise (a dropped connection already implies the server
    /// forgot the membership). Failures land on this membership only.
    async fn invoke_group_action(&self, method: &'static str) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        if !connection.connected() {
            return;
        }
        debug!(
            connection = %connection.name(),
            group = %self.name,
            method,
            "group action about to be called"
        );
        match connection
            .invoke(method, vec![Value::String(self.name.clone())])
            .await
        {
            Ok(_) => {
                info!(
                    connection = %connection.name(),
                    group = %self.name,
                    method,
                    "group action successful"
                );
            }
            Err(err) => {
                warn!(
                    connection = %connection.name(),
                    group = %self.name,
                    method,
                    error = %err,
                    "group action failed"
                );
                self.raise_error(HubError::Group {
                    group: self.name.clone(),
                    connection: connection.name().into(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

impl Keyed for GroupMembership {
    type Key = String;

    fn key(&self) -> &String {
        &self.name
    }
}

#[async_trait]
impl RefCounted for GroupMembership {
    fn lifecycle(&self) -> &LifecycleState {
        &self.lifecycle
    }

    fn describe(&self) -> String {
        format!("group {}", self.name)
    }

    /// Watch the connection's connected stream and join on every
    /// transition into connected, including each reconnect, until this
    /// membership completes.
    fn on_start(&self) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let Some(membership) = self.weak_self.upgrade() else {
            return;
        };
        let mut connected_rx = connection.subscribe_connected();
        let completed = self.lifecycle.completed();
        let settle = connection.rejoin_settle_delay();
        drop(connection);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = completed.cancelled() => break,
                    changed = connected_rx.wait_for(|connected| *connected) => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                // joining immediately after a reconnect can hang; give the
                // server a moment to settle first
                tokio::select! {
                    _ = completed.cancelled() => break,
                    _ = tokio::time::sleep(settle) => {}
                }
                membership.invoke_group_action(JOIN_GROUP_METHOD).await;

                // arm for the next reconnect
                tokio::select! {
                    _ = completed.cancelled() => break,
                    changed = connected_rx.wait_for(|connected| !*connected) => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One best-effort leave if the connection is still up.
    async fn on_stop(&self) {
        self.invoke_group_action(LEAVE_GROUP_METHOD).await;
    }
}
