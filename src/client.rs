//! The coordination-store client capability consumed by the cache.
//!
//! The cache does not implement connection management, heartbeats, or the
//! watch primitive itself; it drives a [`CoordClient`] that does. The trait
//! models a ZooKeeper-style client: hierarchical paths, per-node stats,
//! single-shot watches re-armed by watch-flagged reads, and a session whose
//! expiry invalidates every watch installed under it.
//!
//! Connection and node events arrive on one broadcast stream, and the cache
//! consumes that stream from a single task, which preserves the client's
//! serial delivery order per path.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Session identity at the coordination store.
///
/// Two connects that return the same id are the same session; server-side
/// watches installed under it are still armed. A different id means every
/// watch from the previous session is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A unique identifier for a per-path watch subscription (used for unsubscribe)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node metadata as observed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Data version, bumped on every write.
    pub version: i64,
    /// Child-list version, bumped when a direct child is created or deleted.
    pub cversion: i64,
    /// Last data modification, milliseconds since the epoch.
    pub mtime_ms: u64,
    /// Length of the node's data in bytes.
    pub data_length: u64,
}

/// Type of change that occurred to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEventKind {
    /// Node was created (did not exist before).
    Created,
    /// Node data changed.
    DataChanged,
    /// Node was deleted.
    Deleted,
    /// The node's direct child list changed.
    ChildrenChanged,
}

/// A watch delivery for a subscribed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// The path the watch fired for.
    pub path: String,
    /// Type of change.
    pub kind: NodeEventKind,
}

/// Events delivered on the client's event stream.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A session was established (first connect, reconnect, or post-expiry).
    Connected { session_id: SessionId },
    /// The connection dropped; the session may still be alive server-side.
    Disconnected,
    /// A watch fired for a subscribed path.
    Node(NodeEvent),
    /// The client hit an error it could not attribute to a request.
    Exception { message: String },
}

/// Errors surfaced by the coordination client.
///
/// The taxonomy matters to the cache: [transient](ClientError::is_transient)
/// errors are retried within the same update pass, everything else fails the
/// pass and parks the path for a later drain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Connection to the store was lost mid-operation (retryable)
    #[error("connection to the coordination store was lost")]
    ConnectionLoss,

    /// The operation timed out at the transport (retryable)
    #[error("operation timed out")]
    Timeout,

    /// No node exists at the requested path
    #[error("no node at {0}")]
    NoNode(String),

    /// The session was expired by the server
    #[error("session expired")]
    SessionExpired,

    /// The store answered with something the client could not decode
    #[error("marshalling failure: {0}")]
    Marshalling(String),

    /// The client could not establish a connection at all
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
}

impl ClientError {
    /// Whether a subsequent attempt in the same pass can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::Timeout)
    }
}

/// The coordination-store client the cache is attached to.
///
/// Reads taken with `watch = true` arm a single-shot watch that fires once
/// on the next change and must be re-armed by the next read; that re-arm is
/// the cache's responsibility. [`subscribe`](CoordClient::subscribe) only
/// routes a path's watch deliveries onto the [event
/// stream](CoordClient::events) — it does not arm anything by itself.
#[async_trait]
pub trait CoordClient: Send + Sync + 'static {
    /// Whether a session is currently established.
    fn connected(&self) -> bool;

    /// Whether a connection attempt is in flight.
    fn connecting(&self) -> bool;

    /// The current session identity, if one was ever established.
    fn session_id(&self) -> Option<SessionId>;

    /// Fetch a node's stat. `None` means the node does not exist; with
    /// `watch` set, an existence watch is armed in that case.
    async fn stat(&self, path: &str, watch: bool) -> Result<Option<Stat>, ClientError>;

    /// Fetch a node's data and stat. Fails with [`ClientError::NoNode`] if
    /// the node does not exist.
    async fn get(&self, path: &str, watch: bool) -> Result<(Bytes, Stat), ClientError>;

    /// List a node's direct children together with the node's stat.
    async fn children(&self, path: &str, watch: bool) -> Result<(Vec<String>, Stat), ClientError>;

    /// Route watch deliveries for `path` onto the event stream.
    async fn subscribe(&self, path: &str) -> Result<SubscriptionId, ClientError>;

    /// Drop a routing registration created by `subscribe`.
    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ClientError>;

    /// A receiver for connection and node events.
    fn events(&self) -> broadcast::Receiver<ClientEvent>;

    /// Tear down the current session (if any) and establish a fresh one.
    /// Used both for the initial connect and to recover after a fork.
    async fn reopen(&self) -> Result<(), ClientError>;

    /// Close the client for good.
    async fn close(&self);
}

/// Builds a not-yet-connected client from a host string.
///
/// This is the seam the cache-owning construction mode goes through; the
/// production client library sits behind it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn build(&self, hosts: &str) -> Result<std::sync::Arc<dyn CoordClient>, ClientError>;
}
