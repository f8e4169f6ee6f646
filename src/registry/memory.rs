//! Registry backend over an in-process coordination tree.
//!
//! [`Coordinator`] is a small hierarchical key space in the style of the
//! coordination services registries usually sit on: nodes are created
//! persistent or bound to a session, changes are announced on a broadcast
//! channel, and sessions can be disconnected, reconnected and expired. An
//! expired session loses its ephemeral nodes.
//!
//! [`MemoryRegistry`] stores every provider as an ephemeral node
//! `{service key}/{nodeName}` whose data is the provider address.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{
    check_registration, join_key, service_key, split_key, subscription_key,
    ChildEvent, DataEvent, Discovery, NotifyListener, Registry,
    RegistryState, RegistrySupport, StateListener,
};
use crate::{
    common::{address::EndpointAddress, scheduler::Scheduler},
    config::RegistryConfig,
    error::{Error, Result},
};

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// The data of `path` changed; `None` when the node was deleted.
    DataChanged { path: String, data: Option<String> },
    /// A child of `path` was created or deleted.
    ChildrenChanged { path: String },
    Session { id: SessionId, state: SessionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Expired,
}

#[derive(Debug)]
struct Node {
    data: Option<String>,
    owner: Option<SessionId>,
}

pub struct Coordinator {
    nodes: Mutex<BTreeMap<String, Node>>,
    sessions: Mutex<HashMap<SessionId, SessionState>>,
    next_session: AtomicU64,
    events: broadcast::Sender<TreeEvent>,
}

impl Coordinator {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            nodes: Mutex::new(BTreeMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            events,
        })
    }

    pub fn events(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    pub fn open_session(&self) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(id, SessionState::Connected);
        debug!(session = id, "coordinator session opened");
        id
    }

    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.lock().get(&id).copied()
    }

    fn check_session(&self, id: SessionId) -> Result<()> {
        match self.session_state(id) {
            Some(SessionState::Connected) => Ok(()),
            Some(state) => Err(Error::Registry(format!(
                "session {id} is {state:?}"
            ))),
            None => Err(Error::Registry(format!("unknown session {id}"))),
        }
    }

    /// Creates `path`, or replaces its data if it exists. Missing parents are
    /// created as persistent nodes. An ephemeral node belongs to `session`
    /// and disappears with it.
    pub fn put(
        &self,
        session: SessionId,
        path: &str,
        data: Option<String>,
        ephemeral: bool,
    ) -> Result<()> {
        self.check_session(session)?;
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.lock();
            let mut parent = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                let current = format!("{parent}/{segment}");
                if current != path && !nodes.contains_key(&current) {
                    nodes.insert(current.clone(), Node { data: None, owner: None });
                    events.push(TreeEvent::ChildrenChanged {
                        path: or_root(&parent),
                    });
                }
                parent = current;
            }

            let owner = ephemeral.then_some(session);
            match nodes.get_mut(path) {
                Some(node) => {
                    if node.data != data {
                        node.data = data.clone();
                        events.push(TreeEvent::DataChanged {
                            path: path.to_owned(),
                            data,
                        });
                    }
                    node.owner = owner;
                }
                None => {
                    nodes.insert(path.to_owned(), Node { data: data.clone(), owner });
                    events.push(TreeEvent::DataChanged {
                        path: path.to_owned(),
                        data,
                    });
                    if let Some((parent, _)) = split_key(path) {
                        events.push(TreeEvent::ChildrenChanged {
                            path: parent.to_owned(),
                        });
                    }
                }
            }
        }
        self.publish(events);
        Ok(())
    }

    /// Deletes `path` and everything below it. Returns false if it did not
    /// exist.
    pub fn delete(&self, session: SessionId, path: &str) -> Result<bool> {
        self.check_session(session)?;
        let removed = self.remove_matching(|key, _| {
            key == path || key.starts_with(&format!("{path}/"))
        });
        Ok(removed)
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.nodes.lock().get(path).and_then(|n| n.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(path)
    }

    /// Direct children of `path` with their data.
    pub fn children(&self, path: &str) -> Vec<(String, Option<String>)> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .lock()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, node)| (key[prefix.len()..].to_owned(), node.data.clone()))
            .collect()
    }

    /// The session loses its connection. Its nodes stay until it expires.
    pub fn disconnect(&self, id: SessionId) {
        self.transition(id, SessionState::Disconnected);
    }

    pub fn reconnect(&self, id: SessionId) {
        self.transition(id, SessionState::Connected);
    }

    /// Ends the session and deletes every ephemeral node it owned.
    pub fn expire_session(&self, id: SessionId) {
        self.remove_matching(|_, node| node.owner == Some(id));
        self.transition(id, SessionState::Expired);
    }

    fn transition(&self, id: SessionId, state: SessionState) {
        {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id) {
                Some(current) if *current != SessionState::Expired => {
                    *current = state
                }
                _ => return,
            }
        }
        debug!(session = id, ?state, "coordinator session changed");
        self.publish([TreeEvent::Session { id, state }]);
    }

    fn remove_matching(&self, matches: impl Fn(&str, &Node) -> bool) -> bool {
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.lock();
            let doomed: Vec<String> = nodes
                .iter()
                .filter(|(key, node)| matches(key, node))
                .map(|(key, _)| key.clone())
                .collect();
            for path in doomed {
                nodes.remove(&path);
                events.push(TreeEvent::DataChanged {
                    path: path.clone(),
                    data: None,
                });
                if let Some((parent, _)) = split_key(&path) {
                    events.push(TreeEvent::ChildrenChanged {
                        path: parent.to_owned(),
                    });
                }
            }
        }
        let removed = !events.is_empty();
        self.publish(events);
        removed
    }

    fn publish(&self, events: impl IntoIterator<Item = TreeEvent>) {
        for event in events {
            // no receivers is fine
            let _ = self.events.send(event);
        }
    }
}

fn or_root(path: &str) -> String {
    if path.is_empty() {
        "/".to_owned()
    } else {
        path.to_owned()
    }
}

/// A [`Registry`] whose backend is a [`Coordinator`].
///
/// Registrations are ephemeral nodes of this registry's session. When the
/// session expires the registry opens a new one, tells its state listeners,
/// re-registers everything it had registered and re-reads every subscribed
/// key.
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    address: EndpointAddress,
    coordinator: Arc<Coordinator>,
    session: AtomicU64,
    support: Arc<RegistrySupport>,
    registered: Mutex<HashSet<EndpointAddress>>,
    watched: Mutex<HashSet<String>>,
}

impl MemoryRegistry {
    pub fn new(
        address: EndpointAddress,
        coordinator: Arc<Coordinator>,
        config: RegistryConfig,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let support =
            Arc::new(RegistrySupport::new(&address, config, scheduler.clone()));
        let events = coordinator.events();
        let session = coordinator.open_session();
        let inner = Arc::new(Inner {
            address,
            coordinator,
            session: AtomicU64::new(session),
            support,
            registered: Mutex::new(HashSet::new()),
            watched: Mutex::new(HashSet::new()),
        });
        let pump = Arc::downgrade(&inner);
        scheduler.spawn(pump_events(pump, events));
        Self { inner }
    }

    pub fn support(&self) -> &Arc<RegistrySupport> {
        &self.inner.support
    }

    pub fn session(&self) -> SessionId {
        self.inner.session()
    }

    /// Keys this registry currently watches on the backend.
    pub fn watched_keys(&self) -> Vec<String> {
        self.inner.watched.lock().iter().cloned().collect()
    }
}

impl Inner {
    fn session(&self) -> SessionId {
        self.session.load(Ordering::Acquire)
    }

    fn node_path(address: &EndpointAddress) -> Result<String> {
        let node = check_registration(address)?;
        Ok(join_key(&service_key(address), node).into_owned())
    }

    fn publish(&self, address: &EndpointAddress) -> Result<()> {
        let path = Self::node_path(address)?;
        self.coordinator.put(
            self.session(),
            &path,
            Some(address.to_string()),
            true,
        )
    }

    fn read_children(&self, key: &str) -> Vec<EndpointAddress> {
        self.coordinator
            .children(key)
            .into_iter()
            .filter_map(|(_, data)| data)
            .filter_map(|data| match EndpointAddress::parse(&data) {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!(%key, %e, "ignoring unreadable registry node");
                    None
                }
            })
            .collect()
    }

    // Nodes with data are instances, everything else is read as a service.
    fn resync(&self, key: &str) {
        match self.coordinator.get(key) {
            Some(data) => self.fire_data(key, Some(data)),
            None => self.support.fire_child_change(ChildEvent {
                source: key.to_owned(),
                children: self.read_children(key),
            }),
        }
    }

    fn fire_data(&self, path: &str, data: Option<String>) {
        let address = match data.as_deref().map(EndpointAddress::parse) {
            Some(Ok(address)) => Some(address),
            Some(Err(e)) => {
                warn!(%path, %e, "ignoring unreadable registry node");
                return;
            }
            None => None,
        };
        self.support.fire_data_change(DataEvent {
            source: path.to_owned(),
            address,
        });
    }

    fn on_event(&self, event: TreeEvent) {
        match event {
            TreeEvent::DataChanged { path, data } => {
                if self.watched.lock().contains(&path) {
                    self.fire_data(&path, data);
                }
            }
            TreeEvent::ChildrenChanged { path } => {
                if self.watched.lock().contains(&path) {
                    let children = self.read_children(&path);
                    self.support.fire_child_change(ChildEvent {
                        source: path,
                        children,
                    });
                }
            }
            TreeEvent::Session { id, state } if id == self.session() => {
                self.on_session(state)
            }
            TreeEvent::Session { .. } => {}
        }
    }

    fn on_session(&self, state: SessionState) {
        match state {
            SessionState::Connected => {
                self.support.fire_state_change(RegistryState::Connected)
            }
            SessionState::Disconnected => {
                self.support.fire_state_change(RegistryState::Disconnected)
            }
            SessionState::Expired => {
                self.support.fire_state_change(RegistryState::Expired);
                self.renew_session();
            }
        }
    }

    fn renew_session(&self) {
        let session = self.coordinator.open_session();
        self.session.store(session, Ordering::Release);
        self.support.fire_new_session();

        let registered: Vec<_> = self.registered.lock().iter().cloned().collect();
        for address in &registered {
            if let Err(e) = self.publish(address) {
                warn!(%address, %e, "re-registration failed");
                self.support.fire_establishment_error(&e);
            }
        }
        let watched: Vec<_> = self.watched.lock().iter().cloned().collect();
        for key in &watched {
            self.resync(key);
        }
        debug!(
            session,
            registered = registered.len(),
            watched = watched.len(),
            "registry session renewed"
        );
    }
}

async fn pump_events(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<TreeEvent>,
) {
    loop {
        let event = events.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            Ok(event) => inner.on_event(event),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "registry fell behind its backend, resyncing");
                let watched: Vec<_> =
                    inner.watched.lock().iter().cloned().collect();
                for key in &watched {
                    inner.resync(key);
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[async_trait]
impl Discovery for Inner {
    async fn discover(&self, key: &str) -> Result<Vec<EndpointAddress>> {
        self.coordinator.check_session(self.session())?;
        Ok(self.read_children(key))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    async fn register(&self, address: &EndpointAddress) -> Result<()> {
        self.inner.publish(address)?;
        self.inner.registered.lock().insert(address.clone());
        let cache = self.inner.support.cache();
        cache.insert(&service_key(address), address);
        if let Err(e) = cache.saved().await {
            warn!(path = %cache.path().display(), %e, "registry cache not saved");
        }
        debug!(%address, "registered");
        Ok(())
    }

    async fn unregister(&self, address: &EndpointAddress) -> Result<()> {
        let path = Inner::node_path(address)?;
        self.inner.coordinator.delete(self.inner.session(), &path)?;
        self.inner.registered.lock().remove(address);
        let cache = self.inner.support.cache();
        cache.remove(&service_key(address), address);
        if let Err(e) = cache.saved().await {
            warn!(path = %cache.path().display(), %e, "registry cache not saved");
        }
        debug!(%address, "unregistered");
        Ok(())
    }

    fn subscribe(
        &self,
        address: &EndpointAddress,
        listener: Arc<dyn NotifyListener>,
    ) {
        let key = subscription_key(address);
        let watched = &self.inner.watched;
        self.inner.support.subscribe(&key, listener, || {
            watched.lock().insert(key.clone());
        });
    }

    fn unsubscribe(
        &self,
        address: &EndpointAddress,
        listener: &Arc<dyn NotifyListener>,
    ) {
        let key = subscription_key(address);
        let watched = &self.inner.watched;
        self.inner.support.unsubscribe(&key, listener, || {
            watched.lock().remove(&key);
        });
    }

    async fn lookup(
        &self,
        address: &EndpointAddress,
    ) -> Result<Vec<EndpointAddress>> {
        let discovery: Arc<dyn Discovery> = self.inner.clone();
        self.inner.support.lookup(address, discovery).await
    }

    fn subscribe_state(&self, listener: Arc<dyn StateListener>) {
        self.inner.support.add_state_listener(listener);
    }

    fn unsubscribe_state(&self, listener: &Arc<dyn StateListener>) {
        self.inner.support.remove_state_listener(listener);
    }

    async fn close(&self) {
        let registered: Vec<_> =
            self.inner.registered.lock().drain().collect();
        for address in registered {
            let withdrawn = Inner::node_path(&address).and_then(|path| {
                self.inner.coordinator.delete(self.inner.session(), &path)
            });
            if let Err(e) = withdrawn {
                warn!(%address, %e, "cannot withdraw registration");
            }
        }
        self.inner.watched.lock().clear();
        self.inner.support.close().await;
        debug!(address = %self.inner.address, "registry closed");
    }
}
