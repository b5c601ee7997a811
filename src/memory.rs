//! In-memory coordination store and client.
//!
//! A complete in-process stand-in for the coordination service: hierarchical
//! nodes with versioned stats, single-shot data and child watches re-armed by
//! watch-flagged reads, and sessions that survive disconnects but lose every
//! watch on expiry. The store can be driven offline to exercise reconnect
//! and expiry behavior.
//!
//! [`MemoryClient`] implements [`CoordClient`] against a store; many clients
//! can share one store, each with its own session and event stream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::client::{
    ClientError, ClientEvent, Connector, CoordClient, NodeEvent, NodeEventKind, SessionId, Stat,
    SubscriptionId,
};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parent of a node path, if it has one.
fn parent_path(path: &str) -> Option<String> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        (path.len() > 1).then(|| "/".to_string())
    } else {
        Some(path[..idx].to_string())
    }
}

struct NodeRecord {
    data: Bytes,
    version: i64,
    cversion: i64,
    mtime_ms: u64,
}

impl NodeRecord {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            cversion: self.cversion,
            mtime_ms: self.mtime_ms,
            data_length: self.data.len() as u64,
        }
    }
}

/// Direct child names of `path`, sorted.
fn child_names(nodes: &HashMap<String, NodeRecord>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    let mut names: Vec<String> = nodes
        .keys()
        .filter_map(|p| p.strip_prefix(prefix.as_str()))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(|s| s.to_string())
        .collect();
    names.sort();
    names
}

#[derive(Default)]
struct ClientState {
    session: Option<u64>,
    connected: bool,
    connecting: bool,
    closed: bool,
    registrations: HashMap<String, HashSet<SubscriptionId>>,
    subscription_paths: HashMap<SubscriptionId, String>,
}

struct ClientInner {
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<ClientState>,
}

/// Deliver an event to a client, filtering node events down to the paths it
/// subscribed to.
fn send_to_client(client: &ClientInner, event: ClientEvent) {
    if let ClientEvent::Node(node_event) = &event {
        let state = client.state.lock();
        if !state.registrations.contains_key(&node_event.path) {
            return;
        }
    }
    let _ = client.events.send(event);
}

struct Session {
    connected: bool,
    data_watches: HashSet<String>,
    child_watches: HashSet<String>,
    /// Watch triggers that fired while this session was unreachable.
    queued: Vec<NodeEvent>,
    client: Arc<ClientInner>,
}

struct StoreState {
    nodes: HashMap<String, NodeRecord>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    offline: bool,
    /// Clients waiting for the store to become reachable.
    pending_attaches: Vec<Arc<ClientInner>>,
}

fn fire_data_watches(
    sessions: &mut HashMap<u64, Session>,
    offline: bool,
    path: &str,
    kind: NodeEventKind,
) {
    for session in sessions.values_mut() {
        if session.data_watches.remove(path) {
            deliver(
                session,
                offline,
                NodeEvent {
                    path: path.to_string(),
                    kind,
                },
            );
        }
    }
}

fn fire_child_watches(sessions: &mut HashMap<u64, Session>, offline: bool, parent: &str) {
    for session in sessions.values_mut() {
        if session.child_watches.remove(parent) {
            deliver(
                session,
                offline,
                NodeEvent {
                    path: parent.to_string(),
                    kind: NodeEventKind::ChildrenChanged,
                },
            );
        }
    }
}

/// Single-shot delivery: the watch was already disarmed by the caller.
/// Unreachable sessions keep the trigger queued until they reattach.
fn deliver(session: &mut Session, offline: bool, event: NodeEvent) {
    if offline || !session.connected {
        session.queued.push(event);
    } else {
        send_to_client(&session.client, ClientEvent::Node(event));
    }
}

/// Establish a fresh session for a client and announce it.
fn attach_client(state: &mut StoreState, client: Arc<ClientInner>) {
    let id = state.next_session;
    state.next_session += 1;
    state.sessions.insert(
        id,
        Session {
            connected: true,
            data_watches: HashSet::new(),
            child_watches: HashSet::new(),
            queued: Vec::new(),
            client: client.clone(),
        },
    );
    {
        let mut cs = client.state.lock();
        cs.session = Some(id);
        cs.connected = true;
        cs.connecting = false;
    }
    debug!("session {} attached", SessionId(id));
    let _ = client.events.send(ClientEvent::Connected {
        session_id: SessionId(id),
    });
}

/// An in-process coordination store.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                nodes: HashMap::new(),
                sessions: HashMap::new(),
                next_session: 1,
                offline: false,
                pending_attaches: Vec::new(),
            })),
        }
    }

    /// A new, unconnected client bound to this store. Connect it with
    /// [`CoordClient::reopen`].
    pub fn client(&self) -> MemoryClient {
        let (events, _) = broadcast::channel(256);
        MemoryClient {
            store: self.clone(),
            inner: Arc::new(ClientInner {
                events,
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    /// A connector producing clients for this store.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// Create or overwrite a node, firing data watches on the path and, on
    /// creation, child watches on the parent.
    pub fn set(&self, path: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = now_ms();

        let created = !state.nodes.contains_key(path);
        let record = state
            .nodes
            .entry(path.to_string())
            .or_insert_with(|| NodeRecord {
                data: Bytes::new(),
                version: -1,
                cversion: 0,
                mtime_ms: now,
            });
        record.version += 1;
        record.data = data;
        record.mtime_ms = now;

        let offline = state.offline;
        let kind = if created {
            NodeEventKind::Created
        } else {
            NodeEventKind::DataChanged
        };
        fire_data_watches(&mut state.sessions, offline, path, kind);
        if created {
            if let Some(parent) = parent_path(path) {
                if let Some(parent_node) = state.nodes.get_mut(&parent) {
                    parent_node.cversion += 1;
                }
                fire_child_watches(&mut state.sessions, offline, &parent);
            }
        }
    }

    /// Delete a node, firing data watches on the path and child watches on
    /// the parent. Deleting an absent node is a no-op.
    pub fn delete(&self, path: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.nodes.remove(path).is_none() {
            return;
        }
        let offline = state.offline;
        fire_data_watches(&mut state.sessions, offline, path, NodeEventKind::Deleted);
        if let Some(parent) = parent_path(path) {
            if let Some(parent_node) = state.nodes.get_mut(&parent) {
                parent_node.cversion += 1;
            }
            fire_child_watches(&mut state.sessions, offline, &parent);
        }
    }

    /// Whether a node exists.
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    /// Take the store offline or bring it back.
    ///
    /// Going offline disconnects every session without expiring it; watch
    /// triggers queue up. Coming back reattaches surviving sessions under
    /// their old ids, flushes their queues, and services clients that tried
    /// to connect in the meantime.
    pub fn set_offline(&self, offline: bool) {
        let mut guard = self.state.lock();
        if guard.offline == offline {
            return;
        }
        guard.offline = offline;
        let state = &mut *guard;

        if offline {
            info!("memory store going offline");
            for session in state.sessions.values_mut() {
                if !session.connected {
                    continue;
                }
                session.connected = false;
                {
                    let mut cs = session.client.state.lock();
                    cs.connected = false;
                    cs.connecting = !cs.closed;
                }
                let _ = session.client.events.send(ClientEvent::Disconnected);
            }
            return;
        }

        info!("memory store back online");
        for (id, session) in state.sessions.iter_mut() {
            let open = {
                let mut cs = session.client.state.lock();
                if cs.closed {
                    false
                } else {
                    cs.session = Some(*id);
                    cs.connected = true;
                    cs.connecting = false;
                    true
                }
            };
            if !open {
                continue;
            }
            session.connected = true;
            let _ = session.client.events.send(ClientEvent::Connected {
                session_id: SessionId(*id),
            });
            for event in session.queued.drain(..) {
                send_to_client(&session.client, ClientEvent::Node(event));
            }
        }

        let pending: Vec<Arc<ClientInner>> = state.pending_attaches.drain(..).collect();
        for client in pending {
            let closed = client.state.lock().closed;
            if !closed {
                attach_client(state, client);
            }
        }
    }

    /// Expire a session: its watches are gone for good, and its client (if
    /// still open) chases a fresh session.
    pub fn expire_session(&self, session: SessionId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(old) = state.sessions.remove(&session.0) else {
            return;
        };
        info!("session {} expired", session);
        let client = old.client;
        let open = {
            let mut cs = client.state.lock();
            cs.session = None;
            cs.connected = false;
            cs.connecting = !cs.closed;
            !cs.closed
        };
        if !open {
            return;
        }
        if state.offline {
            state.pending_attaches.push(client);
        } else {
            let _ = client.events.send(ClientEvent::Disconnected);
            attach_client(state, client);
        }
    }
}

/// A client handle onto a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    inner: Arc<ClientInner>,
}

impl MemoryClient {
    /// The session this client holds, for store-side admin calls.
    pub fn current_session(&self) -> Option<SessionId> {
        self.inner.state.lock().session.map(SessionId)
    }

    fn session_or_disconnected(&self) -> Result<u64, ClientError> {
        let state = self.inner.state.lock();
        if !state.connected {
            return Err(ClientError::ConnectionLoss);
        }
        state.session.ok_or(ClientError::ConnectionLoss)
    }
}

#[async_trait]
impl CoordClient for MemoryClient {
    fn connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    fn connecting(&self) -> bool {
        self.inner.state.lock().connecting
    }

    fn session_id(&self) -> Option<SessionId> {
        self.current_session()
    }

    async fn stat(&self, path: &str, watch: bool) -> Result<Option<Stat>, ClientError> {
        let session = self.session_or_disconnected()?;
        let mut guard = self.store.state.lock();
        let state = &mut *guard;
        let Some(sess) = state.sessions.get_mut(&session) else {
            return Err(ClientError::SessionExpired);
        };
        if !sess.connected {
            return Err(ClientError::ConnectionLoss);
        }
        if watch {
            // Arms an existence watch when the node is absent.
            sess.data_watches.insert(path.to_string());
        }
        Ok(state.nodes.get(path).map(|n| n.stat()))
    }

    async fn get(&self, path: &str, watch: bool) -> Result<(Bytes, Stat), ClientError> {
        let session = self.session_or_disconnected()?;
        let mut guard = self.store.state.lock();
        let state = &mut *guard;
        let Some(sess) = state.sessions.get_mut(&session) else {
            return Err(ClientError::SessionExpired);
        };
        if !sess.connected {
            return Err(ClientError::ConnectionLoss);
        }
        let Some(record) = state.nodes.get(path) else {
            return Err(ClientError::NoNode(path.to_string()));
        };
        if watch {
            sess.data_watches.insert(path.to_string());
        }
        Ok((record.data.clone(), record.stat()))
    }

    async fn children(&self, path: &str, watch: bool) -> Result<(Vec<String>, Stat), ClientError> {
        let session = self.session_or_disconnected()?;
        let mut guard = self.store.state.lock();
        let state = &mut *guard;
        let Some(sess) = state.sessions.get_mut(&session) else {
            return Err(ClientError::SessionExpired);
        };
        if !sess.connected {
            return Err(ClientError::ConnectionLoss);
        }
        let Some(record) = state.nodes.get(path) else {
            return Err(ClientError::NoNode(path.to_string()));
        };
        if watch {
            sess.child_watches.insert(path.to_string());
        }
        Ok((child_names(&state.nodes, path), record.stat()))
    }

    async fn subscribe(&self, path: &str) -> Result<SubscriptionId, ClientError> {
        let id = SubscriptionId::new();
        let mut state = self.inner.state.lock();
        state
            .registrations
            .entry(path.to_string())
            .or_default()
            .insert(id.clone());
        state.subscription_paths.insert(id.clone(), path.to_string());
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock();
        if let Some(path) = state.subscription_paths.remove(&subscription) {
            if let Some(ids) = state.registrations.get_mut(&path) {
                ids.remove(&subscription);
                if ids.is_empty() {
                    state.registrations.remove(&path);
                }
            }
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    async fn reopen(&self) -> Result<(), ClientError> {
        let old = {
            let mut cs = self.inner.state.lock();
            cs.connected = false;
            cs.connecting = true;
            cs.session.take()
        };
        let mut guard = self.store.state.lock();
        let state = &mut *guard;
        if let Some(id) = old {
            // Closing the old session invalidates its watches.
            state.sessions.remove(&id);
        }
        if state.offline {
            debug!("store unreachable; connection attempt deferred");
            state.pending_attaches.push(self.inner.clone());
            return Ok(());
        }
        attach_client(state, self.inner.clone());
        Ok(())
    }

    async fn close(&self) {
        let old = {
            let mut cs = self.inner.state.lock();
            cs.closed = true;
            cs.connected = false;
            cs.connecting = false;
            cs.session.take()
        };
        let mut guard = self.store.state.lock();
        let state = &mut *guard;
        if let Some(id) = old {
            state.sessions.remove(&id);
        }
        state
            .pending_attaches
            .retain(|client| !Arc::ptr_eq(client, &self.inner));
    }
}

/// Builds [`MemoryClient`]s for the cache-owning construction mode.
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn build(&self, _hosts: &str) -> Result<Arc<dyn CoordClient>, ClientError> {
        Ok(Arc::new(self.store.client()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn connected_client(store: &MemoryStore) -> (MemoryClient, broadcast::Receiver<ClientEvent>) {
        let client = store.client();
        let mut events = client.events();
        client.reopen().await.unwrap();
        match events.recv().await.unwrap() {
            ClientEvent::Connected { .. } => {}
            other => panic!("expected connected event, got {other:?}"),
        }
        (client, events)
    }

    fn expect_node_event(events: &mut broadcast::Receiver<ClientEvent>) -> NodeEvent {
        match events.try_recv() {
            Ok(ClientEvent::Node(event)) => event,
            other => panic!("expected node event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watches_are_single_shot() {
        let store = MemoryStore::new();
        let (client, mut events) = connected_client(&store).await;
        client.subscribe("/x/boom").await.unwrap();

        store.set("/x/boom", "cat");
        client.stat("/x/boom", true).await.unwrap();

        store.set("/x/boom", "dog");
        let event = expect_node_event(&mut events);
        assert_eq!(event.path, "/x/boom");
        assert_eq!(event.kind, NodeEventKind::DataChanged);

        // watch consumed, no re-arm: the next write is silent
        store.set("/x/boom", "bat");
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_existence_watch_on_missing_node() {
        let store = MemoryStore::new();
        let (client, mut events) = connected_client(&store).await;
        client.subscribe("/x/boom").await.unwrap();

        let stat = client.stat("/x/boom", true).await.unwrap();
        assert!(stat.is_none());

        store.set("/x/boom", "cat");
        let event = expect_node_event(&mut events);
        assert_eq!(event.kind, NodeEventKind::Created);
    }

    #[tokio::test]
    async fn test_child_watch_fires_on_membership_change() {
        let store = MemoryStore::new();
        store.set("/x/group", "");
        let (client, mut events) = connected_client(&store).await;
        client.subscribe("/x/group").await.unwrap();

        let (children, _) = client.children("/x/group", true).await.unwrap();
        assert!(children.is_empty());

        store.set("/x/group/runtime", "");
        let event = expect_node_event(&mut events);
        assert_eq!(event.path, "/x/group");
        assert_eq!(event.kind, NodeEventKind::ChildrenChanged);

        let (children, stat) = client.children("/x/group", true).await.unwrap();
        assert_eq!(children, vec!["runtime"]);
        assert_eq!(stat.cversion, 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_paths_are_filtered() {
        let store = MemoryStore::new();
        let (client, mut events) = connected_client(&store).await;
        client.subscribe("/x/boom").await.unwrap();

        client.stat("/x/other", true).await.unwrap();
        store.set("/x/other", "noise");

        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_offline_preserves_session_and_queues_triggers() {
        let store = MemoryStore::new();
        store.set("/x/boom", "cat");
        let (client, mut events) = connected_client(&store).await;
        client.subscribe("/x/boom").await.unwrap();
        client.stat("/x/boom", true).await.unwrap();
        let session = client.current_session().unwrap();

        store.set_offline(true);
        assert!(!client.connected());
        assert!(matches!(
            client.stat("/x/boom", true).await,
            Err(ClientError::ConnectionLoss)
        ));
        match events.recv().await.unwrap() {
            ClientEvent::Disconnected => {}
            other => panic!("expected disconnect, got {other:?}"),
        }

        store.set("/x/boom", "dog");
        store.set_offline(false);

        match events.recv().await.unwrap() {
            ClientEvent::Connected { session_id } => assert_eq!(session_id, session),
            other => panic!("expected reconnect, got {other:?}"),
        }
        let event = expect_node_event(&mut events);
        assert_eq!(event.path, "/x/boom");
    }

    #[tokio::test]
    async fn test_expiry_yields_fresh_session() {
        let store = MemoryStore::new();
        let (client, mut events) = connected_client(&store).await;
        let first = client.current_session().unwrap();

        store.set_offline(true);
        let _ = events.recv().await.unwrap();
        store.expire_session(first);
        store.set_offline(false);

        match events.recv().await.unwrap() {
            ClientEvent::Connected { session_id } => assert_ne!(session_id, first),
            other => panic!("expected fresh session, got {other:?}"),
        }
        assert_ne!(client.current_session(), Some(first));
    }

    #[tokio::test]
    async fn test_reopen_discards_previous_session() {
        let store = MemoryStore::new();
        let (client, mut events) = connected_client(&store).await;
        let first = client.current_session().unwrap();

        client.reopen().await.unwrap();
        match events.recv().await.unwrap() {
            ClientEvent::Connected { session_id } => assert_ne!(session_id, first),
            other => panic!("expected fresh session, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_version_and_stat_tracking() {
        let store = MemoryStore::new();
        let (client, _events) = connected_client(&store).await;

        store.set("/x/foo", "1");
        store.set("/x/foo", "22");

        let (data, stat) = client.get("/x/foo", false).await.unwrap();
        assert_eq!(&data[..], b"22");
        assert_eq!(stat.version, 1);
        assert_eq!(stat.data_length, 2);
    }

    #[tokio::test]
    async fn test_get_missing_node() {
        let store = MemoryStore::new();
        let (client, _events) = connected_client(&store).await;

        assert!(matches!(
            client.get("/x/ghost", true).await,
            Err(ClientError::NoNode(_))
        ));
    }
}
