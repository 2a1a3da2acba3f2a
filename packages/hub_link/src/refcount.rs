//! Reference-counted lifecycle primitive.
//!
//! Every shared resource in this crate (connections, group memberships) is
//! built on the same rule: start when the first consumer arrives, stop when
//! the last one leaves. [`LifecycleState`] carries the book-keeping and the
//! one-shot completion signal; the [`RefCounted`] trait supplies the
//! start/stop hooks; the driver methods on [`RefCountedExt`] own the
//! counting rules so each hook runs exactly once no matter how callers
//! interleave.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::HubError;

#[derive(Default)]
struct Inner {
    count: u32,
    started: bool,
    error: Option<HubError>,
}

/// Consumer count, started flag, terminal error, and a completion token
/// that fires once and replays to late observers.
///
/// Invariant: complete means started with a count of zero. A raised error
/// forces completion.
pub struct LifecycleState {
    inner: Mutex<Inner>,
    completed: CancellationToken,
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            completed: CancellationToken::new(),
        }
    }

    /// Whether the start hook has ever run.
    pub fn started(&self) -> bool {
        self.inner.lock().started
    }

    /// `true` once all consumers are gone from a started object, or after
    /// an error. Completion is permanent.
    pub fn is_complete(&self) -> bool {
        let inner = self.inner.lock();
        inner.error.is_some() || (inner.started && inner.count == 0)
    }

    /// The terminal error, if one was raised.
    pub fn error(&self) -> Option<HubError> {
        self.inner.lock().error.clone()
    }

    /// Completion signal. Fires at most once; observers subscribing after
    /// the fact are notified immediately.
    pub fn completed(&self) -> CancellationToken {
        self.completed.clone()
    }

    /// Current consumer count.
    pub fn ref_count(&self) -> u32 {
        self.inner.lock().count
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared object with exactly-once start/stop semantics.
///
/// Implementors provide the hooks and a [`LifecycleState`]; consumers drive
/// the object through [`RefCountedExt`]. `on_stop` runs at most once and
/// never after [`RefCountedExt::raise_error`].
#[async_trait]
pub trait RefCounted: Send + Sync + 'static {
    fn lifecycle(&self) -> &LifecycleState;

    /// Short name for log lines and fault messages.
    fn describe(&self) -> String;

    /// Runs exactly once, synchronously, when the first consumer is added.
    fn on_start(&self) {}

    /// Runs exactly once, when the last consumer leaves cleanly.
    async fn on_stop(&self) {}
}

/// Consumer-side driver for [`RefCounted`] objects.
#[async_trait]
pub trait RefCountedExt: RefCounted {
    /// Track another consumer. The first call ever starts the object.
    /// Acquiring an errored object is a usage fault; acquiring a completed
    /// one is a no-op.
    fn add_ref(&self) -> Result<(), HubError> {
        let run_start = {
            let mut inner = self.lifecycle().inner.lock();
            if inner.error.is_some() {
                return Err(HubError::Usage(format!(
                    "cannot acquire {} while it is in error state",
                    self.describe()
                )));
            }
            if inner.started && inner.count == 0 {
                return Ok(());
            }
            inner.count += 1;
            if inner.started {
                false
            } else {
                inner.started = true;
                true
            }
        };
        if run_start {
            debug!(object = %self.describe(), "first consumer, starting");
            self.on_start();
        }
        Ok(())
    }

    /// Stop tracking one consumer. The last departing consumer runs the
    /// stop hook and then fires completion. No-op on errored or completed
    /// objects.
    async fn release(&self) {
        let run_stop = {
            let mut inner = self.lifecycle().inner.lock();
            if inner.error.is_some() || inner.count == 0 {
                return;
            }
            inner.count -= 1;
            inner.count == 0 && inner.started
        };
        if run_stop {
            debug!(object = %self.describe(), "last consumer gone, stopping");
            self.on_stop().await;
            self.lifecycle().completed.cancel();
        }
    }

    /// Record a terminal failure: forces the count to zero, fires
    /// completion, and skips the stop hook. The first error wins; later
    /// calls are no-ops.
    fn raise_error(&self, error: HubError) {
        {
            let mut inner = self.lifecycle().inner.lock();
            if inner.error.is_some() {
                return;
            }
            inner.error = Some(error);
            inner.count = 0;
        }
        debug!(object = %self.describe(), "entered error state");
        self.lifecycle().completed.cancel();
    }
}

impl<T: RefCounted> RefCountedExt for T {}
