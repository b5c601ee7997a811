//! Reference-counted registry of runtime watches.
//!
//! A runtime watch exists for a mapped path exactly while at least one
//! directory wants it tracked and no static entry shadows it. Ownership is
//! keyed by the owning directory's registered path, which is unique for the
//! cache's lifetime.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::client::SubscriptionId;

struct RuntimeWatch {
    owners: HashSet<String>,
    subscription: SubscriptionId,
}

/// The dynamic set of paths watched on behalf of directories.
///
/// Written only by the watch-engine task; the map is the authoritative
/// existence signal consulted by reader-side introspection, so it sits
/// behind a lock shared with the facade.
#[derive(Clone)]
pub(crate) struct RuntimeWatches {
    inner: Arc<RwLock<HashMap<String, RuntimeWatch>>>,
}

impl RuntimeWatches {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether a runtime watch currently exists for `path`.
    pub fn is_watched(&self, path: &str) -> bool {
        self.inner.read().contains_key(path)
    }

    /// Paths currently watched, in no particular order.
    pub fn paths(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// The directories currently owning `path`.
    pub fn owners_of(&self, path: &str) -> Vec<String> {
        self.inner
            .read()
            .get(path)
            .map(|w| w.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a freshly installed subscription for `path`, owned by `owner`.
    pub fn insert(&self, path: &str, owner: &str, subscription: SubscriptionId) {
        let mut inner = self.inner.write();
        inner.insert(
            path.to_string(),
            RuntimeWatch {
                owners: HashSet::from([owner.to_string()]),
                subscription,
            },
        );
    }

    /// Add `owner` to an existing watch. Returns false if no watch exists,
    /// in which case the caller must install a subscription first.
    pub fn add_owner(&self, path: &str, owner: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(path) {
            Some(watch) => {
                watch.owners.insert(owner.to_string());
                true
            }
            None => false,
        }
    }

    /// Drop `owner`'s interest in `path`. When the last owner goes, the
    /// entry is removed and its subscription handle returned so the caller
    /// can unregister it exactly once.
    pub fn remove_owner(&self, path: &str, owner: &str) -> Option<SubscriptionId> {
        let mut inner = self.inner.write();
        let watch = inner.get_mut(path)?;
        watch.owners.remove(owner);
        if watch.owners.is_empty() {
            inner.remove(path).map(|w| w.subscription)
        } else {
            None
        }
    }

    /// Drop every watch, returning the subscription handles for release.
    pub fn drain(&self) -> Vec<SubscriptionId> {
        let mut inner = self.inner.write();
        inner.drain().map(|(_, w)| w.subscription).collect()
    }
}
