//! Update notifications published by the watch engine.
//!
//! Every completed update pass publishes one event. The three event kinds
//! are the three notification channels: static value updates, directory
//! membership updates, and runtime (per-child) value updates.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A static path's mirror was updated.
#[derive(Debug, Clone, Serialize)]
pub struct StaticUpdate<V> {
    /// The registered path.
    pub path: String,
    /// The value now served by `fetch`.
    pub value: V,
    /// The value served before this update, if the entry existed.
    pub old_value: Option<V>,
    /// Whether the value came from a successful deserialization of an
    /// existing node.
    pub valid: bool,
    /// Stringified deserializer failure, when one occurred.
    pub error: Option<String>,
    /// Seconds between the node's last write and this update pass.
    pub latency_seconds: Option<f64>,
    /// Node data version, when the node exists.
    pub version: Option<i64>,
    /// Node data length, when the node exists.
    pub data_length: Option<u64>,
}

/// A directory path's child membership was updated.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryUpdate {
    /// The registered directory path.
    pub path: String,
    /// The mapped paths currently tracked for this directory, sorted.
    pub directory_paths: Vec<String>,
    /// The directory node's child-list version, when the node exists.
    pub directory_version: Option<i64>,
    /// Seconds between the node's last write and this update pass.
    pub latency_seconds: Option<f64>,
    /// Directory node data length, when the node exists.
    pub data_length: Option<u64>,
}

/// A runtime path's mirrored value was refreshed on behalf of its owning
/// directories. Values surface through `fetch_directory_values`, not here.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeUpdate {
    /// The mapped path the watch fired for.
    pub path: String,
    /// Whether the node existed during this pass.
    pub exists: bool,
    /// Seconds between the node's last write and this update pass.
    pub latency_seconds: Option<f64>,
    /// Node data version, when the node exists.
    pub version: Option<i64>,
    /// Node data length, when the node exists.
    pub data_length: Option<u64>,
}

/// An update notification; the variant is the channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum UpdateEvent<V> {
    Static(StaticUpdate<V>),
    Directory(DirectoryUpdate),
    Runtime(RuntimeUpdate),
}

impl<V> UpdateEvent<V> {
    /// The path this event is about.
    pub fn path(&self) -> &str {
        match self {
            UpdateEvent::Static(e) => &e.path,
            UpdateEvent::Directory(e) => &e.path,
            UpdateEvent::Runtime(e) => &e.path,
        }
    }
}

/// Sink for update notifications.
///
/// The engine publishes synchronously after the cache cell is updated.
/// Publication failures are the subscriber's problem: the engine does not
/// catch panics raised here, so implementations are responsible for their
/// own error handling.
pub trait Notifier<V>: Send + Sync {
    fn publish(&self, event: UpdateEvent<V>);
}

/// Broadcast-backed default [`Notifier`] for in-process consumers.
#[derive(Clone)]
pub struct UpdateBroadcaster<V> {
    sender: Arc<broadcast::Sender<UpdateEvent<V>>>,
}

impl<V: Clone + Send + 'static> UpdateBroadcaster<V> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent<V>> {
        self.sender.subscribe()
    }
}

impl<V: Clone + Send + 'static> Default for UpdateBroadcaster<V> {
    fn default() -> Self {
        Self::new(256)
    }
}

impl<V: Clone + Send + 'static> Notifier<V> for UpdateBroadcaster<V> {
    fn publish(&self, event: UpdateEvent<V>) {
        // Ignore errors when there are no active subscribers
        let _ = self.sender.send(event);
    }
}
