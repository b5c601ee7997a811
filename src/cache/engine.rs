//! The watch engine: the state machine that keeps mirrors coherent.
//!
//! The engine is one task consuming two streams: the client's event stream
//! (connection transitions and watch deliveries) and the facade's command
//! mailbox (pending drains, resets, shutdown). Every mirror mutation happens
//! inside this task, so per-path update order matches the client's delivery
//! order and no additional locking is needed for the engine-owned state.
//!
//! Update passes re-arm their own watches: each `stat`/`get`/`children` is
//! taken with the watch flag, which is the single-shot re-arm mechanism.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ClientEvent, CoordClient, NodeEvent, SessionId, Stat, SubscriptionId};
use crate::events::{DirectoryUpdate, RuntimeUpdate, StaticUpdate, UpdateEvent};

use super::pending::{PendingUpdates, UpdateKind};
use super::runtime::RuntimeWatches;
use super::CacheShared;

/// Commands the facade posts onto the engine's mailbox.
pub(crate) enum EngineCommand {
    /// Drain the pending-update queue.
    Drain,
    /// Forget the session and pending state ahead of a reconnect.
    Reset { ack: oneshot::Sender<()> },
    /// Release every subscription and stop.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Seconds between the node's last write and now.
fn latency_seconds(stat: &Stat) -> f64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    now_ms.saturating_sub(stat.mtime_ms) as f64 / 1000.0
}

/// The update state machine attached to one client.
pub(crate) struct WatchEngine<V> {
    shared: Arc<CacheShared<V>>,
    client: Arc<dyn CoordClient>,
    runtime: RuntimeWatches,
    pending: PendingUpdates,
    last_session: Option<SessionId>,
    /// Subscriptions for the registered static and directory paths.
    path_subscriptions: HashMap<String, SubscriptionId>,
    cmd_tx: mpsc::Sender<EngineCommand>,
}

impl<V: Clone + Send + Sync + 'static> WatchEngine<V> {
    pub(crate) fn new(
        shared: Arc<CacheShared<V>>,
        client: Arc<dyn CoordClient>,
        path_subscriptions: HashMap<String, SubscriptionId>,
        cmd_tx: mpsc::Sender<EngineCommand>,
    ) -> Self {
        let runtime = shared.runtime.clone();
        Self {
            shared,
            client,
            runtime,
            pending: PendingUpdates::new(),
            last_session: None,
            path_subscriptions,
            cmd_tx,
        }
    }

    /// Run until shut down. This task is the dispatch thread: every mirror
    /// mutation funnels through here.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut events: broadcast::Receiver<ClientEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(EngineCommand::Drain) => self.process_pending().await,
                    Some(EngineCommand::Reset { ack }) => {
                        debug!("engine reset: forgetting session and pending updates");
                        self.pending.clear();
                        self.last_session = None;
                        let _ = ack.send(());
                    }
                    Some(EngineCommand::Shutdown { ack }) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => return,
                },
                event = events.recv() => match event {
                    Ok(ClientEvent::Connected { session_id }) => self.on_connected(session_id).await,
                    Ok(ClientEvent::Disconnected) => {
                        debug!("client disconnected; session may still be alive");
                    }
                    Ok(ClientEvent::Node(event)) => self.on_node_event(event).await,
                    Ok(ClientEvent::Exception { message }) => {
                        error!("client exception: {}", message);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("dropped {} client events; mirrors catch up on the next delivery", missed);
                    }
                    Err(RecvError::Closed) => {
                        warn!("client event stream closed");
                        return;
                    }
                },
            }
        }
    }

    /// Session-aware connect handling. A reconnect within the same session
    /// keeps every server-side watch armed, so only parked updates need a
    /// drain; a new session invalidates all of them and every mirror is
    /// reseeded.
    async fn on_connected(&mut self, session_id: SessionId) {
        if self.last_session == Some(session_id) {
            debug!("reconnected within session {}", session_id);
            self.process_pending().await;
            return;
        }

        info!("session {} established; seeding mirrors", session_id);
        self.pending.clear();

        // Runtime paths carried over from a previous session get their own
        // pass after the directory seeds; paths the directory seeds add are
        // fetched inline there.
        let carried_runtime = self.runtime.paths();

        for path in self.shared.static_paths() {
            if !self.update_static(&path).await {
                self.pending.insert(path, UpdateKind::Static);
            }
        }
        for path in self.shared.directory_paths() {
            if !self.update_directory(&path).await {
                self.pending.insert(path, UpdateKind::Directory);
            }
        }
        for path in carried_runtime {
            if self.runtime.is_watched(&path) && !self.update_runtime(&path).await {
                self.pending.insert(path, UpdateKind::Runtime);
            }
        }

        self.last_session = Some(session_id);
        self.shared.release_warm();
        self.schedule_drain();
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        let path = event.path;
        debug!("watch fired for {}: {:?}", path, event.kind);

        if self.shared.is_static(&path) {
            if !self.update_static(&path).await {
                self.pending.insert(path, UpdateKind::Static);
                self.schedule_drain();
            }
        } else if self.shared.directory(&path).is_some() {
            if !self.update_directory(&path).await {
                self.pending.insert(path, UpdateKind::Directory);
                self.schedule_drain();
            }
        } else if self.runtime.is_watched(&path) {
            if !self.update_runtime(&path).await {
                self.pending.insert(path, UpdateKind::Runtime);
                self.schedule_drain();
            }
        } else {
            debug!("event for untracked path {} ignored", path);
        }
    }

    /// Retry parked updates. Short-circuits when there is nothing to do or
    /// the client cannot service a fetch; entries that fail again survive in
    /// the queue until a later event schedules another drain.
    async fn process_pending(&mut self) {
        if self.pending.is_empty() || !self.client.connected() {
            return;
        }
        let entries = self.pending.take_all();
        debug!("draining {} pending updates", entries.len());
        for (path, kind) in entries {
            let ok = match kind {
                UpdateKind::Static => self.update_static(&path).await,
                UpdateKind::Directory => self.update_directory(&path).await,
                UpdateKind::Runtime => self.update_runtime(&path).await,
            };
            if !ok {
                self.pending.insert(path, kind);
            }
        }
    }

    fn schedule_drain(&self) {
        // A full mailbox already has a drain queued.
        let _ = self.cmd_tx.try_send(EngineCommand::Drain);
    }

    /// Refresh the mirror for one static path. Returns false when the pass
    /// could not complete and should be parked for retry.
    async fn update_static(&mut self, path: &str) -> bool {
        let Some(entry) = self.shared.static_entry(path) else {
            return true;
        };
        if !self.client.connected() {
            return false;
        }

        let stat = match self.stat_watched(path).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!("stat of {} failed: {}", path, e);
                return false;
            }
        };

        if stat.is_none() {
            let old = entry.reset_to_default();
            self.shared.publish(UpdateEvent::Static(StaticUpdate {
                path: path.to_string(),
                value: entry.default_value().clone(),
                old_value: Some(old),
                valid: false,
                error: None,
                latency_seconds: None,
                version: None,
                data_length: None,
            }));
            return true;
        }

        let (raw, stat) = match self.get_watched(path).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("get of {} failed: {}", path, e);
                return false;
            }
        };

        let outcome = entry.apply(&raw, stat);
        if let Some(err) = &outcome.error {
            warn!("deserializer for {} failed: {}", path, err);
        }
        self.shared.publish(UpdateEvent::Static(StaticUpdate {
            path: path.to_string(),
            value: outcome.value,
            old_value: Some(outcome.old_value),
            valid: outcome.valid,
            error: outcome.error,
            latency_seconds: Some(latency_seconds(&stat)),
            version: Some(stat.version),
            data_length: Some(stat.data_length),
        }));
        true
    }

    /// Refresh the mirror for one directory path, acquiring and releasing
    /// runtime watches as the child membership changes.
    async fn update_directory(&mut self, path: &str) -> bool {
        let Some(dir) = self.shared.directory(path) else {
            return true;
        };
        if !self.client.connected() {
            return false;
        }

        let stat = match self.stat_watched(path).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!("stat of directory {} failed: {}", path, e);
                return false;
            }
        };

        if stat.is_none() {
            let removed = dir.clear();
            for mapped in &removed {
                if !self.shared.is_static(mapped) {
                    self.release_runtime(mapped, path).await;
                }
            }
            self.shared.publish(UpdateEvent::Directory(DirectoryUpdate {
                path: path.to_string(),
                directory_paths: Vec::new(),
                directory_version: None,
                latency_seconds: None,
                data_length: None,
            }));
            return true;
        }

        let (children, stat) = match self.children_watched(path).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("children of {} failed: {}", path, e);
                return false;
            }
        };

        let incoming: HashSet<String> = children.iter().map(|c| dir.mapped(c)).collect();
        let delta = dir.apply_membership(incoming, stat);

        let mut ok = true;
        for mapped in &delta.added {
            if self.shared.is_static(mapped) {
                dir.set_static_slot(mapped);
            } else if self.acquire_runtime(mapped, path).await {
                // The subscription is in place before the first value fetch.
                if !self.update_runtime(mapped).await {
                    self.pending.insert(mapped.clone(), UpdateKind::Runtime);
                    self.schedule_drain();
                }
            } else {
                // No subscription; put the member back on the table so a
                // retry of this pass sees it as added again.
                dir.forget_member(mapped);
                ok = false;
            }
        }
        for mapped in &delta.removed {
            if !self.shared.is_static(mapped) {
                self.release_runtime(mapped, path).await;
            }
        }

        self.shared.publish(UpdateEvent::Directory(DirectoryUpdate {
            path: path.to_string(),
            directory_paths: dir.watched_paths(),
            directory_version: Some(stat.cversion),
            latency_seconds: Some(latency_seconds(&stat)),
            data_length: Some(stat.data_length),
        }));
        ok
    }

    /// Refresh the mirrored value for one runtime path on behalf of its
    /// owning directories.
    async fn update_runtime(&mut self, path: &str) -> bool {
        let owners = self.runtime.owners_of(path);
        if owners.is_empty() {
            // Watch released while the event was in flight.
            return true;
        }
        if !self.client.connected() {
            return false;
        }

        let stat = match self.stat_watched(path).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!("stat of runtime path {} failed: {}", path, e);
                return false;
            }
        };

        if stat.is_none() {
            for owner in &owners {
                if let Some(dir) = self.shared.directory(owner) {
                    dir.remove_child_value(path);
                }
            }
            self.shared.publish(UpdateEvent::Runtime(RuntimeUpdate {
                path: path.to_string(),
                exists: false,
                latency_seconds: None,
                version: None,
                data_length: None,
            }));
            return true;
        }

        let (raw, stat) = match self.get_watched(path).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("get of runtime path {} failed: {}", path, e);
                return false;
            }
        };

        for owner in &owners {
            if let Some(dir) = self.shared.directory(owner) {
                if let Some(err) = dir.apply_child_value(path, &raw) {
                    warn!("deserializer for {} in directory {} failed: {}", path, owner, err);
                }
            }
        }
        self.shared.publish(UpdateEvent::Runtime(RuntimeUpdate {
            path: path.to_string(),
            exists: true,
            latency_seconds: Some(latency_seconds(&stat)),
            version: Some(stat.version),
            data_length: Some(stat.data_length),
        }));
        true
    }

    async fn acquire_runtime(&mut self, mapped: &str, owner: &str) -> bool {
        if self.runtime.add_owner(mapped, owner) {
            return true;
        }
        match self.client.subscribe(mapped).await {
            Ok(subscription) => {
                self.runtime.insert(mapped, owner, subscription);
                true
            }
            Err(e) => {
                warn!("subscribing to runtime path {} failed: {}", mapped, e);
                false
            }
        }
    }

    async fn release_runtime(&mut self, mapped: &str, owner: &str) {
        if let Some(subscription) = self.runtime.remove_owner(mapped, owner) {
            if let Err(e) = self.client.unsubscribe(subscription).await {
                warn!("unsubscribing runtime path {} failed: {}", mapped, e);
            }
        }
    }

    /// Take a node's stat with the watch flag, retrying transient errors in
    /// the same pass while the client still reports connected.
    async fn stat_watched(&self, path: &str) -> Result<Option<Stat>, ClientError> {
        loop {
            match self.client.stat(path, true).await {
                Ok(stat) => return Ok(stat),
                Err(e) if e.is_transient() && self.client.connected() => {
                    debug!("transient error on stat {}: {}; retrying", path, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_watched(&self, path: &str) -> Result<(Bytes, Stat), ClientError> {
        loop {
            match self.client.get(path, true).await {
                Ok(pair) => return Ok(pair),
                Err(e) if e.is_transient() && self.client.connected() => {
                    debug!("transient error on get {}: {}; retrying", path, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn children_watched(&self, path: &str) -> Result<(Vec<String>, Stat), ClientError> {
        loop {
            match self.client.children(path, true).await {
                Ok(pair) => return Ok(pair),
                Err(e) if e.is_transient() && self.client.connected() => {
                    debug!("transient error on children {}: {}; retrying", path, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release every subscription ahead of teardown.
    async fn shutdown(&mut self) {
        debug!("engine shutting down");
        self.pending.clear();
        for (_, subscription) in self.path_subscriptions.drain() {
            if let Err(e) = self.client.unsubscribe(subscription).await {
                debug!("unsubscribe during shutdown failed: {}", e);
            }
        }
        for subscription in self.runtime.drain() {
            if let Err(e) = self.client.unsubscribe(subscription).await {
                debug!("unsubscribe during shutdown failed: {}", e);
            }
        }
    }
}
