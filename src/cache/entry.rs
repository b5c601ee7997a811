//! Mirror cell for one statically-registered path.

use parking_lot::RwLock;

use crate::client::Stat;

use super::{Deserialized, StaticDeserializer};

/// Snapshot of an entry's readable state.
#[derive(Debug, Clone)]
pub(crate) struct EntrySnapshot<V> {
    pub value: V,
    pub valid: bool,
    pub stat: Option<Stat>,
}

/// What an update pass did to the entry.
pub(crate) struct ApplyOutcome<V> {
    pub old_value: V,
    pub value: V,
    pub valid: bool,
    pub error: Option<String>,
}

/// Mirror of one statically-registered path: immutable default value and
/// deserializer, plus the `(value, valid, stat)` triple behind one lock so
/// readers observe either the previous or the new state, never a mix.
///
/// Mutated only by the watch-engine task; read from any thread.
pub struct StaticEntry<V> {
    default_value: V,
    deserializer: StaticDeserializer<V>,
    cell: RwLock<EntrySnapshot<V>>,
}

impl<V: Clone + Send + Sync + 'static> StaticEntry<V> {
    pub(crate) fn new(default_value: V, deserializer: StaticDeserializer<V>) -> Self {
        let cell = RwLock::new(EntrySnapshot {
            value: default_value.clone(),
            valid: false,
            stat: None,
        });
        Self {
            default_value,
            deserializer,
            cell,
        }
    }

    pub fn default_value(&self) -> &V {
        &self.default_value
    }

    /// The value currently served by `fetch`.
    pub fn value(&self) -> V {
        self.cell.read().value.clone()
    }

    /// The value iff it came from a successful deserialization.
    pub fn valid_value(&self) -> Option<V> {
        let cell = self.cell.read();
        cell.valid.then(|| cell.value.clone())
    }

    /// Last observed node metadata.
    pub fn stat(&self) -> Option<Stat> {
        self.cell.read().stat
    }

    /// Reset to the default value after observing the node absent.
    /// Returns the previously served value.
    pub(crate) fn reset_to_default(&self) -> V {
        let mut cell = self.cell.write();
        let old = std::mem::replace(&mut cell.value, self.default_value.clone());
        cell.valid = false;
        cell.stat = None;
        old
    }

    /// Apply freshly fetched node data. A deserializer returning
    /// [`Deserialized::UseDefault`] or failing leaves the entry on the
    /// default value and invalid; the failure is reported in the outcome,
    /// not raised.
    pub(crate) fn apply(&self, raw: &[u8], stat: Stat) -> ApplyOutcome<V> {
        let (value, valid, error) = match (self.deserializer)(raw, &stat) {
            Ok(Deserialized::Value(v)) => (v, true, None),
            Ok(Deserialized::UseDefault) => (self.default_value.clone(), false, None),
            Err(e) => (self.default_value.clone(), false, Some(e.to_string())),
        };

        let mut cell = self.cell.write();
        let old_value = std::mem::replace(&mut cell.value, value.clone());
        cell.valid = valid;
        cell.stat = Some(stat);

        ApplyOutcome {
            old_value,
            value,
            valid,
            error,
        }
    }
}
