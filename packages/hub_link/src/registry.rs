//! Keyed registry of shared ref-counted objects.
//!
//! Deduplicates live entries by key: the first `get_by_key` for a key
//! builds the entry through the factory and starts it, later calls share
//! it. Entries remove themselves from the collection once they complete;
//! there is no explicit unregister.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::HubError;
use crate::refcount::{RefCounted, RefCountedExt};

/// A ref-counted object that carries its own registry key.
pub trait Keyed {
    type Key: Send + Sync + 'static;

    fn key(&self) -> &Self::Key;
}

type Factory<T> = Box<dyn Fn(&<T as Keyed>::Key) -> Arc<T> + Send + Sync>;
type Compare<T> = Box<dyn Fn(&<T as Keyed>::Key, &<T as Keyed>::Key) -> bool + Send + Sync>;

/// Keyed collection handing out shared [`RefCounted`] entries.
///
/// At most one live (non-completed) entry exists per key under the supplied
/// equality predicate. Expected entry counts are small (tens of groups or
/// connections), so lookup is a linear scan.
pub struct RefCountedRegistry<T: RefCounted + Keyed> {
    entries: Arc<Mutex<Vec<Arc<T>>>>,
    factory: Factory<T>,
    compare: Compare<T>,
}

impl<T: RefCounted + Keyed> RefCountedRegistry<T> {
    pub fn new(
        factory: impl Fn(&T::Key) -> Arc<T> + Send + Sync + 'static,
        compare: impl Fn(&T::Key, &T::Key) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            factory: Box::new(factory),
            compare: Box::new(compare),
        }
    }

    /// Shared entry for `key`, with its count already incremented. Builds
    /// and starts a fresh entry when no live one matches.
    ///
    /// Must run inside a tokio runtime: removal-on-completion is a spawned
    /// watcher.
    pub fn get_by_key(&self, key: &T::Key) -> Result<Arc<T>, HubError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter()
            .find(|e| Self::is_live(e) && (self.compare)(e.key(), key))
        {
            // an error can slip in between the liveness check and the
            // acquire; fall through and build a replacement when it does
            if entry.add_ref().is_ok() {
                return Ok(entry.clone());
            }
        }

        let entry = (self.factory)(key);
        entry.add_ref()?;
        entries.push(entry.clone());
        self.watch_for_completion(entry.clone());
        Ok(entry)
    }

    /// Release one consumer of the live entry matching `key`, if any. The
    /// entry completes (and drops out of the collection) only when this was
    /// the last consumer.
    pub async fn stop_by_key(&self, key: &T::Key) {
        let entry = {
            let entries = self.entries.lock();
            entries
                .iter()
                .find(|e| Self::is_live(e) && (self.compare)(e.key(), key))
                .cloned()
        };
        if let Some(entry) = entry {
            entry.release().await;
        }
    }

    /// Drain the whole registry: release the most recently added entry
    /// until it completes, then the next, until nothing is left. Tolerates
    /// entries removing themselves concurrently.
    pub async fn stop_all(&self) {
        loop {
            let entry = { self.entries.lock().last().cloned() };
            let Some(entry) = entry else { break };
            while Self::is_live(&entry) {
                entry.release().await;
            }
            // the completion watcher also removes the entry; removing it
            // here keeps the drain independent of task scheduling
            self.entries.lock().retain(|e| !Arc::ptr_eq(e, &entry));
        }
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn is_live(entry: &Arc<T>) -> bool {
        !entry.lifecycle().is_complete()
    }

    fn watch_for_completion(&self, entry: Arc<T>) {
        let completed = entry.lifecycle().completed();
        let entries = Arc::downgrade(&self.entries);
        tokio::spawn(async move {
            completed.cancelled().await;
            if let Some(entries) = entries.upgrade() {
                debug!(object = %entry.describe(), "completed, dropping from registry");
                entries.lock().retain(|e| !Arc::ptr_eq(e, &entry));
            }
        });
    }
}
