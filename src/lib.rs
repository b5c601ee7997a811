//! In-process coordination-data cache.
//!
//! Applications register interest in a fixed set of coordination paths at
//! startup; the cache mirrors each path's value locally, updates the mirrors
//! from server-side watch deliveries, and serves reads at local-memory
//! latency from any thread. Directory paths track a node's children and
//! recursively watch a mapped value node per child, acquiring and releasing
//! watches as the membership changes.
//!
//! The cache consumes two capabilities rather than implementing them: a
//! [`client::CoordClient`] for the store itself and an [`events::Notifier`]
//! for update notifications. [`memory::MemoryStore`] provides an embedded
//! store and client for tests and single-process use.
//!
//! # Example
//!
//! ```no_run
//! use coordcache::{CoordCache, CoordClient, Deserialized, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let cache: CoordCache<String> = CoordCache::new();
//! cache.register_static("/service/flag", "off".to_string(), |raw, _stat| {
//!     Ok(Deserialized::Value(String::from_utf8(raw.to_vec())?))
//! })?;
//!
//! let client = Arc::new(store.client());
//! cache.start(client.clone()).await?;
//! client.reopen().await?;
//!
//! cache.wait_for_warm_cache(std::time::Duration::from_secs(5)).await;
//! let flag = cache.fetch("/service/flag")?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod events;
pub mod memory;

pub use cache::{
    CacheOptions, ChildDeserializer, CoordCache, DeserializeError, Deserialized, PathMapper,
    StaticDeserializer,
};
pub use client::{
    ClientError, ClientEvent, Connector, CoordClient, NodeEvent, NodeEventKind, SessionId, Stat,
    SubscriptionId,
};
pub use error::{CacheError, CacheResult};
pub use events::{
    DirectoryUpdate, Notifier, RuntimeUpdate, StaticUpdate, UpdateBroadcaster, UpdateEvent,
};
pub use memory::{MemoryClient, MemoryConnector, MemoryStore};
