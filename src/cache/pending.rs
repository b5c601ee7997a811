//! Retry queue for update passes that could not complete.

use std::collections::HashMap;

/// Which update function a parked path belongs to.
///
/// A tagged kind rather than a common interface: the three update passes
/// have different payload shapes and the drain dispatches on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateKind {
    Static,
    Directory,
    Runtime,
}

/// Map of path → update kind awaiting retry, at most one entry per path.
///
/// No backoff: entries survive in the map until some subsequent event
/// triggers a drain.
#[derive(Default)]
pub(crate) struct PendingUpdates {
    entries: HashMap<String, UpdateKind>,
}

impl PendingUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: String, kind: UpdateKind) {
        self.entries.insert(path, kind);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove and return every parked entry; the caller re-inserts the ones
    /// that fail again.
    pub fn take_all(&mut self) -> Vec<(String, UpdateKind)> {
        self.entries.drain().collect()
    }
}
