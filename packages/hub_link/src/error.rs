//! Error taxonomy for the multiplexing core.

use thiserror::Error;

/// Errors surfaced by the multiplexing core.
///
/// Clonable so a single terminal failure can fan out to every subscriber
/// sharing the connection that produced it.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// Lifecycle contract misuse, e.g. acquiring an object that is already
    /// in error state. Fatal to the caller's operation, never retried.
    #[error("usage fault: {0}")]
    Usage(String),

    /// A transport open attempt failed. Retried per policy when one is
    /// configured, otherwise promoted to [`HubError::ConnectionLost`].
    #[error("connect failed: {0}")]
    Connect(String),

    /// Terminal connection loss: retries exhausted, the retry policy
    /// declined, or the transport closed unexpectedly. Delivered to every
    /// attached subscriber through the completion channel, never thrown
    /// synchronously.
    #[error("connection {name} {reason}")]
    ConnectionLost { name: String, reason: String },

    /// joinGroup/leaveGroup failed for one group. Isolated to that group's
    /// membership; the connection and other groups are unaffected.
    #[error("group {group} on connection {connection}: {reason}")]
    Group {
        group: String,
        connection: String,
        reason: String,
    },

    /// `invoke` was called with no live session, or the remote call failed.
    /// Surfaced only to the caller of `invoke`.
    #[error("invoke {method}: {reason}")]
    Invoke { method: String, reason: String },
}
