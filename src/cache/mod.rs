//! The cache facade: registration, lifecycle, and the reader surface.
//!
//! A [`CoordCache`] goes through three phases. During **registration** the
//! application declares every static path and directory it cares about.
//! `start` freezes the tables, attaches the watch engine to a client, and
//! moves to **running**; from then on mirrors update from watch deliveries
//! and readers hit them from any thread. `close` moves to **closed** and
//! releases every subscription.

mod directory;
mod engine;
mod entry;
mod pending;
mod runtime;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::client::{Connector, CoordClient, Stat};
use crate::error::{CacheError, CacheResult};
use crate::events::{DirectoryUpdate, Notifier, StaticUpdate, UpdateBroadcaster, UpdateEvent};

use directory::{DirectoryMirror, DirectorySlot};
use engine::{EngineCommand, WatchEngine};
use entry::StaticEntry;
use runtime::RuntimeWatches;

/// Error type a deserializer may fail with.
pub type DeserializeError = Box<dyn std::error::Error + Send + Sync>;

/// What a deserializer produced.
///
/// `UseDefault` is an identity-unique sentinel: returning it forces the
/// entry onto its default value with `valid` unset, which no legitimate
/// value can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deserialized<V> {
    Value(V),
    UseDefault,
}

/// Deserializer for a static path's node data.
pub type StaticDeserializer<V> =
    Arc<dyn Fn(&[u8], &Stat) -> Result<Deserialized<V>, DeserializeError> + Send + Sync>;

/// Deserializer for a directory's non-shadowed child values.
pub type ChildDeserializer<V> =
    Arc<dyn Fn(&[u8]) -> Result<Deserialized<V>, DeserializeError> + Send + Sync>;

/// Maps a directory child name to the value path to watch.
pub type PathMapper = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Options for the cache-owning construction mode.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Host string handed to the connector.
    pub hosts: String,
    /// How long `open` waits for the first warm-up.
    pub warm_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registering,
    Running,
    Closed,
}

/// State shared between the facade, the engine task, and readers.
pub(crate) struct CacheShared<V> {
    phase: RwLock<Phase>,
    statics: RwLock<HashMap<String, Arc<StaticEntry<V>>>>,
    directories: RwLock<HashMap<String, Arc<DirectoryMirror<V>>>>,
    pub(crate) runtime: RuntimeWatches,
    warm: watch::Sender<bool>,
    notifier: Arc<dyn Notifier<V>>,
}

impl<V: Clone + Send + Sync + 'static> CacheShared<V> {
    pub(crate) fn static_entry(&self, path: &str) -> Option<Arc<StaticEntry<V>>> {
        self.statics.read().get(path).cloned()
    }

    pub(crate) fn directory(&self, path: &str) -> Option<Arc<DirectoryMirror<V>>> {
        self.directories.read().get(path).cloned()
    }

    pub(crate) fn is_static(&self, path: &str) -> bool {
        self.statics.read().contains_key(path)
    }

    pub(crate) fn static_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.statics.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub(crate) fn directory_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.directories.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub(crate) fn publish(&self, event: UpdateEvent<V>) {
        self.notifier.publish(event);
    }

    pub(crate) fn release_warm(&self) {
        self.warm.send_replace(true);
    }
}

struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    task: JoinHandle<()>,
}

struct Control {
    client: Option<Arc<dyn CoordClient>>,
    owned: bool,
    engine: Option<EngineHandle>,
}

/// In-process cache of coordination data.
///
/// Readers (`fetch*`) are cheap and callable from any thread. Registration
/// and the lifecycle operations (`start`, `close`, `reopen`) belong to one
/// application-control thread and must not be interleaved with each other.
pub struct CoordCache<V> {
    shared: Arc<CacheShared<V>>,
    control: Mutex<Control>,
}

fn validate_path(path: &str) -> CacheResult<()> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(CacheError::argument(format!("path must be absolute: {path:?}")));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(CacheError::argument(format!(
            "path must not end with a slash: {path:?}"
        )));
    }
    Ok(())
}

impl<V: Clone + Send + Sync + 'static> CoordCache<V> {
    /// A cache with an unobserved default notifier. Use
    /// [`with_notifier`](Self::with_notifier) to receive update events.
    pub fn new() -> Self {
        let notifier: Arc<UpdateBroadcaster<V>> = Arc::new(UpdateBroadcaster::default());
        Self::with_notifier(notifier)
    }

    /// A cache publishing update events to the given notifier.
    pub fn with_notifier(notifier: Arc<dyn Notifier<V>>) -> Self {
        let (warm, _) = watch::channel(false);
        Self {
            shared: Arc::new(CacheShared {
                phase: RwLock::new(Phase::Registering),
                statics: RwLock::new(HashMap::new()),
                directories: RwLock::new(HashMap::new()),
                runtime: RuntimeWatches::new(),
                warm,
                notifier,
            }),
            control: Mutex::new(Control {
                client: None,
                owned: false,
                engine: None,
            }),
        }
    }

    /// Cache-owning construction: build a client through the connector, run
    /// the registration block, start, connect, and wait for the first
    /// warm-up. Fails with [`CacheError::WarmTimeout`] if the cache is not
    /// warm within `options.warm_timeout`.
    pub async fn open<R>(
        connector: &dyn Connector,
        options: CacheOptions,
        register: R,
    ) -> CacheResult<Self>
    where
        R: FnOnce(&Self) -> CacheResult<()>,
    {
        if options.hosts.trim().is_empty() {
            return Err(CacheError::argument("hosts must not be empty"));
        }
        if options.warm_timeout.is_zero() {
            return Err(CacheError::argument("warm timeout must be non-zero"));
        }

        let cache = Self::new();
        register(&cache)?;

        let client = connector.build(&options.hosts).await?;
        cache.start_inner(client.clone(), true).await?;
        client.reopen().await?;

        if !cache.wait_for_warm_cache(options.warm_timeout).await {
            return Err(CacheError::WarmTimeout(options.warm_timeout));
        }
        Ok(cache)
    }

    /// Register a static value path with its default value and deserializer.
    ///
    /// Until the first update pass (and again whenever the node is absent)
    /// `fetch` serves the default and `fetch_valid` serves nothing.
    pub fn register_static<D>(&self, path: &str, default_value: V, deserializer: D) -> CacheResult<()>
    where
        D: Fn(&[u8], &Stat) -> Result<Deserialized<V>, DeserializeError> + Send + Sync + 'static,
    {
        self.ensure_registering()?;
        validate_path(path)?;
        self.ensure_unregistered(path)?;

        let entry = Arc::new(StaticEntry::new(
            default_value.clone(),
            Arc::new(deserializer) as StaticDeserializer<V>,
        ));
        self.shared.statics.write().insert(path.to_string(), entry);

        // One default-value notification per registration.
        self.shared.publish(UpdateEvent::Static(StaticUpdate {
            path: path.to_string(),
            value: default_value,
            old_value: None,
            valid: false,
            error: None,
            latency_seconds: None,
            version: None,
            data_length: None,
        }));
        Ok(())
    }

    /// Register a directory path. The children of the node are mapped
    /// through `mapper` to value paths; non-shadowed mapped paths are
    /// watched dynamically and their values parsed with `deserializer`.
    pub fn register_directory<M, D>(&self, path: &str, mapper: M, deserializer: D) -> CacheResult<()>
    where
        M: Fn(&str) -> String + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<Deserialized<V>, DeserializeError> + Send + Sync + 'static,
    {
        self.ensure_registering()?;
        validate_path(path)?;
        self.ensure_unregistered(path)?;

        let mirror = Arc::new(DirectoryMirror::new(
            Arc::new(mapper) as PathMapper,
            Arc::new(deserializer) as ChildDeserializer<V>,
        ));
        self.shared
            .directories
            .write()
            .insert(path.to_string(), mirror);

        self.shared.publish(UpdateEvent::Directory(DirectoryUpdate {
            path: path.to_string(),
            directory_paths: Vec::new(),
            directory_version: None,
            latency_seconds: None,
            data_length: None,
        }));
        Ok(())
    }

    /// Freeze the registration tables and attach the watch engine to the
    /// client. The client must not be connected or connecting yet: the
    /// engine's subscriptions have to be in place before the first session
    /// so the seed pass and the first watch delivery cannot race.
    pub async fn start(&self, client: Arc<dyn CoordClient>) -> CacheResult<()> {
        self.start_inner(client, false).await
    }

    async fn start_inner(&self, client: Arc<dyn CoordClient>, owned: bool) -> CacheResult<()> {
        let mut control = self.control.lock().await;
        match *self.shared.phase.read() {
            Phase::Registering => {}
            Phase::Running => return Err(CacheError::lifecycle("cache already started")),
            Phase::Closed => return Err(CacheError::lifecycle("cache is closed")),
        }
        if client.connected() || client.connecting() {
            return Err(CacheError::lifecycle(
                "client must not be connected at start; subscriptions go in before the first session",
            ));
        }

        let mut subscriptions = HashMap::new();
        for path in self
            .shared
            .static_paths()
            .into_iter()
            .chain(self.shared.directory_paths())
        {
            let subscription = client.subscribe(&path).await?;
            subscriptions.insert(path, subscription);
        }

        let watched_paths = subscriptions.len();
        let events = client.events();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let engine = WatchEngine::new(
            self.shared.clone(),
            client.clone(),
            subscriptions,
            cmd_tx.clone(),
        );
        let task = tokio::spawn(engine.run(cmd_rx, events));

        *self.shared.phase.write() = Phase::Running;
        control.client = Some(client);
        control.owned = owned;
        control.engine = Some(EngineHandle { cmd_tx, task });
        info!("cache started; watching {} registered paths", watched_paths);
        Ok(())
    }

    /// The mirrored value for a registered static path.
    pub fn fetch(&self, path: &str) -> CacheResult<V> {
        self.shared
            .static_entry(path)
            .map(|entry| entry.value())
            .ok_or_else(|| CacheError::unknown_path(path))
    }

    /// The mirrored value iff it came from a successful deserialization of
    /// an existing node.
    pub fn fetch_valid(&self, path: &str) -> CacheResult<Option<V>> {
        self.shared
            .static_entry(path)
            .map(|entry| entry.valid_value())
            .ok_or_else(|| CacheError::unknown_path(path))
    }

    /// The last node metadata observed for a registered static path, if the
    /// node existed at the last update pass.
    pub fn stat(&self, path: &str) -> CacheResult<Option<Stat>> {
        self.shared
            .static_entry(path)
            .map(|entry| entry.stat())
            .ok_or_else(|| CacheError::unknown_path(path))
    }

    /// Snapshot of a directory's mapped-path values, with shadowed slots
    /// resolved against the current static entries.
    pub fn fetch_directory_values(&self, path: &str) -> CacheResult<HashMap<String, V>> {
        let dir = self
            .shared
            .directory(path)
            .ok_or_else(|| CacheError::unknown_path(path))?;
        let slots = dir.slots_snapshot();
        let statics = self.shared.statics.read();

        let mut values = HashMap::with_capacity(slots.len());
        for (mapped, slot) in slots {
            match slot {
                DirectorySlot::Value(v) => {
                    values.insert(mapped, v);
                }
                DirectorySlot::Static => {
                    if let Some(entry) = statics.get(&mapped) {
                        values.insert(mapped, entry.value());
                    }
                }
            }
        }
        Ok(values)
    }

    /// Wait until every registered path has undergone an update pass against
    /// the current session, or the timeout elapses.
    pub async fn wait_for_warm_cache(&self, timeout: Duration) -> bool {
        let mut warm = self.shared.warm.subscribe();
        let result = tokio::time::timeout(timeout, warm.wait_for(|w| *w)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Whether `path` was registered as a static path.
    pub fn is_static_registered(&self, path: &str) -> bool {
        self.shared.is_static(path)
    }

    /// Whether `path` was registered as a directory path.
    pub fn is_directory_registered(&self, path: &str) -> bool {
        self.shared.directory(path).is_some()
    }

    /// Whether a runtime watch is currently installed for `path`.
    pub fn is_runtime_watched(&self, path: &str) -> bool {
        self.shared.runtime.is_watched(path)
    }

    /// Registered static paths, sorted.
    pub fn static_paths(&self) -> Vec<String> {
        self.shared.static_paths()
    }

    /// Registered directory paths, sorted.
    pub fn directory_paths(&self) -> Vec<String> {
        self.shared.directory_paths()
    }

    /// Release every subscription, stop the engine, and close the client if
    /// this cache owns it. Readers keep serving the last mirrored state.
    pub async fn close(&self) -> CacheResult<()> {
        let mut control = self.control.lock().await;
        if *self.shared.phase.read() == Phase::Closed {
            return Ok(());
        }

        if let Some(engine) = control.engine.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if engine
                .cmd_tx
                .send(EngineCommand::Shutdown { ack: ack_tx })
                .await
                .is_ok()
            {
                let _ = ack_rx.await;
            }
            let _ = engine.task.await;
        }
        if control.owned {
            if let Some(client) = control.client.take() {
                client.close().await;
            }
        }
        control.client = None;
        *self.shared.phase.write() = Phase::Closed;
        info!("cache closed");
        Ok(())
    }

    /// Prepare for a fresh session after a fork: reset the warm latch,
    /// forget the previous session and pending updates, and — when this
    /// cache owns its client — reopen it. The warm latch releases again
    /// once the new session's seed pass completes; use
    /// [`wait_for_warm_cache`](Self::wait_for_warm_cache) to observe it.
    pub async fn reopen(&self) -> CacheResult<()> {
        let control = self.control.lock().await;
        if *self.shared.phase.read() != Phase::Running {
            return Err(CacheError::lifecycle("reopen requires a running cache"));
        }

        // Latch and session state go first so the child's fresh session
        // cannot be mistaken for the parent's.
        self.shared.warm.send_replace(false);

        let engine = control
            .engine
            .as_ref()
            .ok_or_else(|| CacheError::state("watch engine is not running"))?;
        let (ack_tx, ack_rx) = oneshot::channel();
        engine
            .cmd_tx
            .send(EngineCommand::Reset { ack: ack_tx })
            .await
            .map_err(|_| CacheError::state("watch engine mailbox closed"))?;
        ack_rx
            .await
            .map_err(|_| CacheError::state("watch engine dropped the reset"))?;

        if control.owned {
            if let Some(client) = &control.client {
                client.reopen().await?;
            }
        }
        Ok(())
    }

    fn ensure_registering(&self) -> CacheResult<()> {
        match *self.shared.phase.read() {
            Phase::Registering => Ok(()),
            Phase::Running => Err(CacheError::lifecycle(
                "registration is closed once the cache is started",
            )),
            Phase::Closed => Err(CacheError::lifecycle("cache is closed")),
        }
    }

    fn ensure_unregistered(&self, path: &str) -> CacheResult<()> {
        if self.shared.statics.read().contains_key(path)
            || self.shared.directories.read().contains_key(path)
        {
            return Err(CacheError::lifecycle(format!(
                "path already registered: {path}"
            )));
        }
        Ok(())
    }
}

impl<V: Clone + Send + Sync + 'static> Default for CoordCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
