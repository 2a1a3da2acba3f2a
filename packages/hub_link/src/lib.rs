//! Share a few long-lived hub connections across many independent event
//! subscribers.
//!
//! Each subscriber asks for a named event stream on a connection identity,
//! scoped to zero or more server-side groups. Underneath, connections and
//! group memberships are reference-counted: the first subscriber starts
//! the transport session and joins the groups, later subscribers share
//! them, and the last one leaving tears everything down. Connections
//! auto-reconnect per a pluggable retry policy and re-establish group
//! membership after every reconnect.
//!
//! The concrete wire client is not part of this crate; plug one in by
//! implementing [`HubSession`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hub_link::{ConnectionConfig, ExponentialBackoff, HubMux, SubscribeOptions};
//!
//! let config = Arc::new(
//!     ConnectionConfig::new("https://example.org/echohub", || my_transport::session())
//!         .with_retry(ExponentialBackoff::default()),
//! );
//!
//! let mux = HubMux::new();
//! let mut sub = mux
//!     .subscribe(SubscribeOptions::new(config, "notifyMessage").with_group("g1"))
//!     .await?;
//!
//! while let Some(event) = sub.recv().await {
//!     println!("{:?}", event?);
//! }
//! ```

mod connection;
mod error;
mod group;
mod refcount;
mod registry;
mod retry;
mod subscription;
mod transport;

#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod test_support;

pub use connection::{
    CallbackId, ConnectionConfig, ConnectionState, DEFAULT_REJOIN_SETTLE_DELAY, GroupGuard,
    HubConnection,
};
pub use error::HubError;
pub use group::{GroupMembership, JOIN_GROUP_METHOD, LEAVE_GROUP_METHOD};
pub use refcount::{LifecycleState, RefCounted, RefCountedExt};
pub use registry::{Keyed, RefCountedRegistry};
pub use retry::{ExponentialBackoff, FixedDelay, RetryContext, RetryPolicy};
pub use subscription::{EventSubscription, HubMux, SubscribeOptions};
pub use transport::{EventHandler, HubSession, SessionFactory, SessionNotification};
