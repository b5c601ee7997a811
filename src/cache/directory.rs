//! Mirror of one registered directory path.
//!
//! A directory mirror tracks the direct children of its node, maps each
//! child name to a value path, and holds the deserialized value for every
//! mapped path whose node currently exists. Membership reconciliation is a
//! pure computation; acquiring and releasing the per-child watches the
//! deltas call for is the engine's job.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::client::Stat;

use super::{ChildDeserializer, Deserialized, PathMapper};

/// Value slot for one mapped path inside a directory.
///
/// `Static` marks a mapped path that collides with a statically-registered
/// path; the value for such a slot is resolved from the static table at read
/// time and never stored here.
#[derive(Debug, Clone)]
pub(crate) enum DirectorySlot<V> {
    Value(V),
    Static,
}

/// Result of reconciling current membership with an incoming child set.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MembershipDelta {
    /// Mapped paths that joined the directory.
    pub added: Vec<String>,
    /// Mapped paths that left the directory.
    pub removed: Vec<String>,
}

/// Compute the watch changes needed to move from `watched` to `incoming`.
///
/// Pure set arithmetic; performs no mutations.
pub(crate) fn reconcile_children(
    watched: &HashSet<String>,
    incoming: &HashSet<String>,
) -> MembershipDelta {
    let mut delta = MembershipDelta {
        added: incoming.difference(watched).cloned().collect(),
        removed: watched.difference(incoming).cloned().collect(),
    };
    delta.added.sort();
    delta.removed.sort();
    delta
}

struct DirectoryCell<V> {
    watched: HashSet<String>,
    values: HashMap<String, DirectorySlot<V>>,
    stat: Option<Stat>,
}

/// Mirror of one registered directory path.
///
/// Mutated only by the watch-engine task; read from any thread. The invariant
/// `keys(values) ⊆ watched` holds at every step: a mapped path whose value
/// failed to deserialize (or deserialized to the use-default sentinel) is
/// absent from `values`, not present with a placeholder.
pub struct DirectoryMirror<V> {
    mapper: PathMapper,
    deserializer: ChildDeserializer<V>,
    cell: RwLock<DirectoryCell<V>>,
}

impl<V: Clone + Send + Sync + 'static> DirectoryMirror<V> {
    pub(crate) fn new(mapper: PathMapper, deserializer: ChildDeserializer<V>) -> Self {
        Self {
            mapper,
            deserializer,
            cell: RwLock::new(DirectoryCell {
                watched: HashSet::new(),
                values: HashMap::new(),
                stat: None,
            }),
        }
    }

    /// Apply the path mapper to a child name.
    pub fn mapped(&self, child: &str) -> String {
        (self.mapper)(child)
    }

    /// The mapped paths currently tracked, sorted.
    pub fn watched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.cell.read().watched.iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Snapshot copy of the value slots.
    pub(crate) fn slots_snapshot(&self) -> HashMap<String, DirectorySlot<V>> {
        self.cell.read().values.clone()
    }

    /// Replace the membership with `incoming` and drop value slots that are
    /// no longer members. Returns the watch delta.
    pub(crate) fn apply_membership(
        &self,
        incoming: HashSet<String>,
        stat: Stat,
    ) -> MembershipDelta {
        let mut cell = self.cell.write();
        let delta = reconcile_children(&cell.watched, &incoming);
        cell.values.retain(|path, _| incoming.contains(path));
        cell.watched = incoming;
        cell.stat = Some(stat);
        delta
    }

    /// Empty the mirror after observing the directory node absent.
    /// Returns the mapped paths that were being tracked.
    pub(crate) fn clear(&self) -> Vec<String> {
        let mut cell = self.cell.write();
        let mut removed: Vec<String> = cell.watched.drain().collect();
        removed.sort();
        cell.values.clear();
        cell.stat = None;
        removed
    }

    /// Mark a mapped path as shadowed by a static entry.
    pub(crate) fn set_static_slot(&self, mapped_path: &str) {
        let mut cell = self.cell.write();
        if cell.watched.contains(mapped_path) {
            cell.values
                .insert(mapped_path.to_string(), DirectorySlot::Static);
        }
    }

    /// Deserialize and store a runtime value for a mapped path. A failure or
    /// use-default result removes the slot instead; the error string, if any,
    /// is returned for logging.
    pub(crate) fn apply_child_value(&self, mapped_path: &str, raw: &[u8]) -> Option<String> {
        let mut cell = self.cell.write();
        if !cell.watched.contains(mapped_path) {
            return None;
        }
        match (self.deserializer)(raw) {
            Ok(Deserialized::Value(v)) => {
                cell.values
                    .insert(mapped_path.to_string(), DirectorySlot::Value(v));
                None
            }
            Ok(Deserialized::UseDefault) => {
                cell.values.remove(mapped_path);
                None
            }
            Err(e) => {
                cell.values.remove(mapped_path);
                Some(e.to_string())
            }
        }
    }

    /// Drop the value slot for a mapped path whose node went away.
    pub(crate) fn remove_child_value(&self, mapped_path: &str) {
        self.cell.write().values.remove(mapped_path);
    }

    /// Take a mapped path back out of the membership. Used when its watch
    /// could not be installed, so a retried pass reconciles it as added.
    pub(crate) fn forget_member(&self, mapped_path: &str) {
        let mut cell = self.cell.write();
        cell.watched.remove(mapped_path);
        cell.values.remove(mapped_path);
    }
}
