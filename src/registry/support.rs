use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use hashbrown::{hash_map::EntryRef, HashMap, HashSet};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    filter_by_node, service_key, split_key, ChildEvent, DataEvent,
    LocalCache, NotifyListener, RegistryState, StateListener,
};
use crate::{
    common::{
        address::{EndpointAddress, NODE_NAME},
        scheduler::Scheduler,
    },
    config::RegistryConfig,
    error::{Error, Result},
};

/// The backend half of a lookup: the current children of a service key.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn discover(&self, key: &str) -> Result<Vec<EndpointAddress>>;
}

/// The parts every registry backend shares: the local cache, listener
/// bookkeeping and fan-out, and the periodic refresh of looked up keys.
pub struct RegistrySupport {
    cache: LocalCache,
    listeners: Mutex<HashMap<String, Vec<Arc<dyn NotifyListener>>>>,
    state_listeners: Mutex<Vec<Arc<dyn StateListener>>>,
    lookup_keys: Mutex<HashSet<String>>,
    // one discovery at a time per missed key
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    refresher: Mutex<Option<AbortHandle>>,
    scheduler: Arc<Scheduler>,
    config: RegistryConfig,
}

impl RegistrySupport {
    pub fn new(
        registry: &EndpointAddress,
        config: RegistryConfig,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let path = LocalCache::file_for(&config.cache_dir, registry);
        let cache = LocalCache::open(path, config.clone(), scheduler.clone());
        Self {
            cache,
            listeners: Mutex::new(HashMap::new()),
            state_listeners: Mutex::new(Vec::new()),
            lookup_keys: Mutex::new(HashSet::new()),
            inflight: Mutex::new(HashMap::new()),
            refresher: Mutex::new(None),
            scheduler,
            config,
        }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Adds `listener` under `key`. `on_first` runs, under the listener
    /// lock, only when `key` had no listeners before. Returns whether it ran.
    pub fn subscribe(
        &self,
        key: &str,
        listener: Arc<dyn NotifyListener>,
        on_first: impl FnOnce(),
    ) -> bool {
        let mut listeners = self.listeners.lock();
        match listeners.entry_ref(key) {
            EntryRef::Occupied(mut entry) => {
                let present = entry.get().iter().any(|l| same(l, &listener));
                if !present {
                    entry.get_mut().push(listener);
                }
                false
            }
            EntryRef::Vacant(entry) => {
                on_first();
                entry.insert(vec![listener]);
                true
            }
        }
    }

    /// Removes `listener` from `key`. `on_last` runs, under the listener
    /// lock, only when that removal leaves `key` without listeners.
    pub fn unsubscribe(
        &self,
        key: &str,
        listener: &Arc<dyn NotifyListener>,
        on_last: impl FnOnce(),
    ) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(current) = listeners.get_mut(key) else {
            return false;
        };
        let before = current.len();
        current.retain(|l| !same(l, listener));
        if current.len() == before || !current.is_empty() {
            return false;
        }
        listeners.remove(key);
        on_last();
        true
    }

    pub fn subscribed_keys(&self) -> Vec<String> {
        self.listeners.lock().keys().cloned().collect()
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.listeners.lock().contains_key(key)
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        let mut listeners = self.state_listeners.lock();
        if !listeners.iter().any(|l| same(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_state_listener(&self, listener: &Arc<dyn StateListener>) {
        self.state_listeners.lock().retain(|l| !same(l, listener));
    }

    /// Applies a data change to the cache, then hands it to the listeners of
    /// its source key.
    pub fn fire_data_change(&self, event: DataEvent) {
        match &event.address {
            Some(address) => {
                let key = service_key(address);
                if let Some(node) = address.parameter(NODE_NAME) {
                    self.cache.remove_where(&key, |entry| {
                        entry_node(entry).as_deref() == Some(node)
                    });
                }
                self.cache.insert(&key, address);
            }
            None => {
                if let Some((parent, node)) = split_key(&event.source) {
                    self.cache.remove_where(parent, |entry| {
                        entry_node(entry).as_deref() == Some(node)
                    });
                }
            }
        }
        let listeners = self.listeners_of(&event.source);
        deliver(&listeners, "data", |l| l.data_changed(&event));
    }

    /// Replaces the cached children of the source key, then hands the change
    /// to its listeners.
    pub fn fire_child_change(&self, event: ChildEvent) {
        self.cache.replace(&event.source, &event.children);
        let listeners = self.listeners_of(&event.source);
        deliver(&listeners, "child", |l| l.children_changed(&event));
    }

    pub fn fire_state_change(&self, state: RegistryState) {
        debug!(?state, "registry state changed");
        let listeners = self.state_listeners.lock().clone();
        deliver(&listeners, "state", |l| l.state_changed(state));
    }

    pub fn fire_new_session(&self) {
        let listeners = self.state_listeners.lock().clone();
        deliver(&listeners, "state", |l| l.new_session());
    }

    pub fn fire_establishment_error(&self, error: &Error) {
        warn!(%error, "registry session could not be established");
        let listeners = self.state_listeners.lock().clone();
        deliver(&listeners, "state", |l| l.establishment_error(error));
    }

    /// Answers from the cache when possible, asking `discovery` on a miss.
    /// Either way the key is re-read every refresh interval from then on.
    pub async fn lookup(
        self: &Arc<Self>,
        query: &EndpointAddress,
        discovery: Arc<dyn Discovery>,
    ) -> Result<Vec<EndpointAddress>> {
        let key = service_key(query);
        let found = match self.cache.addresses(&key) {
            Some(cached) => cached,
            None => self.discover_once(&key, discovery.as_ref()).await?,
        };
        self.lookup_keys.lock().insert(key);
        self.ensure_refresher(discovery);
        Ok(filter_by_node(query, found))
    }

    // Concurrent misses on `key` wait for the first one and then read what
    // it cached.
    async fn discover_once(
        &self,
        key: &str,
        discovery: &dyn Discovery,
    ) -> Result<Vec<EndpointAddress>> {
        let gate = self.inflight.lock().entry_ref(key).or_default().clone();
        let turn = gate.lock().await;
        let found = match self.cache.addresses(key) {
            Some(cached) => Ok(cached),
            None => {
                let found = discovery
                    .discover(key)
                    .instrument(debug_span!("registry lookup", %key))
                    .await;
                if let Ok(found) = &found {
                    self.cache.replace(key, found);
                }
                found
            }
        };
        drop(turn);
        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|g| Arc::ptr_eq(g, &gate)) {
            inflight.remove(key);
        }
        found
    }

    fn ensure_refresher(self: &Arc<Self>, discovery: Arc<dyn Discovery>) {
        let mut refresher = self.refresher.lock();
        if refresher.is_some() {
            return;
        }
        let support: Weak<Self> = Arc::downgrade(self);
        *refresher = self.scheduler.spawn_periodic(
            self.config.refresh_interval,
            move || {
                let support = support.clone();
                let discovery = discovery.clone();
                async move {
                    if let Some(support) = support.upgrade() {
                        support.refresh(discovery.as_ref()).await;
                    }
                }
            },
        );
    }

    /// Re-reads every looked up key. A failing key keeps its cached value.
    pub async fn refresh(&self, discovery: &dyn Discovery) {
        let keys: Vec<String> = self.lookup_keys.lock().iter().cloned().collect();
        for key in keys {
            match discovery.discover(&key).await {
                Ok(found) => {
                    if self.cache.replace(&key, &found) {
                        debug!(%key, providers = found.len(), "lookup refreshed");
                    }
                }
                Err(e) => warn!(%key, %e, "lookup refresh failed"),
            }
        }
    }

    /// Stops the refresh and writes the cache out.
    pub async fn close(&self) {
        if let Some(refresher) = self.refresher.lock().take() {
            refresher.abort();
        }
        if let Err(e) = self.cache.flush_async().await {
            warn!(
                path = %self.cache.path().display(),
                %e,
                "registry cache flush on close failed"
            );
        }
    }

    fn listeners_of(&self, key: &str) -> Vec<Arc<dyn NotifyListener>> {
        self.listeners.lock().get(key).cloned().unwrap_or_default()
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn entry_node(entry: &str) -> Option<String> {
    EndpointAddress::parse(entry)
        .ok()
        .and_then(|a| a.parameter(NODE_NAME).map(str::to_owned))
}

// One failing or panicking listener must not keep the others from hearing
// about the change.
fn deliver<L: ?Sized>(
    listeners: &[Arc<L>],
    kind: &str,
    notify: impl Fn(&L) -> Result<()>,
) {
    for listener in listeners {
        match panic::catch_unwind(AssertUnwindSafe(|| notify(listener))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(kind, %e, "registry listener failed"),
            Err(_) => warn!(kind, "registry listener panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        data: AtomicUsize,
        children: AtomicUsize,
    }

    impl NotifyListener for Recorder {
        fn data_changed(&self, _event: &DataEvent) -> Result<()> {
            self.data.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn children_changed(&self, _event: &ChildEvent) -> Result<()> {
            self.children.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Faulty;

    impl NotifyListener for Faulty {
        fn data_changed(&self, _event: &DataEvent) -> Result<()> {
            Err(Error::Registry("listener broke".into()))
        }

        fn children_changed(&self, _event: &ChildEvent) -> Result<()> {
            panic!("listener exploded");
        }
    }

    struct Fixed {
        answer: Mutex<Result<Vec<EndpointAddress>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Discovery for Fixed {
        async fn discover(&self, _key: &str) -> Result<Vec<EndpointAddress>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.lock().clone()
        }
    }

    fn support(dir: &std::path::Path) -> Arc<RegistrySupport> {
        let config = RegistryConfig::builder()
            .cache_dir(dir)
            .refresh_interval(Duration::from_millis(50))
            .build();
        let scheduler = Arc::new(Scheduler::current().unwrap());
        Arc::new(RegistrySupport::new(
            &EndpointAddress::new("coord", 1),
            config,
            scheduler,
        ))
    }

    fn address(text: &str) -> EndpointAddress {
        EndpointAddress::parse(text).unwrap()
    }

    #[tokio::test]
    async fn backend_subscription_follows_first_and_last_listener() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let subscribes = AtomicUsize::new(0);
        let unsubscribes = AtomicUsize::new(0);
        let a: Arc<dyn NotifyListener> = Arc::new(Recorder::default());
        let b: Arc<dyn NotifyListener> = Arc::new(Recorder::default());

        support.subscribe("/s", a.clone(), || {
            subscribes.fetch_add(1, Ordering::SeqCst);
        });
        support.subscribe("/s", b.clone(), || {
            subscribes.fetch_add(1, Ordering::SeqCst);
        });
        support.subscribe("/s", b.clone(), || {
            subscribes.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);

        support.unsubscribe("/s", &a, || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 0);
        support.unsubscribe("/s", &b, || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        });
        support.unsubscribe("/s", &b, || {
            unsubscribes.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(unsubscribes.load(Ordering::SeqCst), 1);
        assert!(!support.is_subscribed("/s"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_subscribers_trigger_one_backend_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let subscribes = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let support = support.clone();
                let subscribes = subscribes.clone();
                tokio::spawn(async move {
                    let listener: Arc<dyn NotifyListener> =
                        Arc::new(Recorder::default());
                    support.subscribe("/s", listener, || {
                        subscribes.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        futures::future::join_all(tasks).await;
        assert_eq!(subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_failing_listener_does_not_stop_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let recorder = Arc::new(Recorder::default());
        support.subscribe("/s", Arc::new(Faulty), || {});
        support.subscribe("/s", recorder.clone(), || {});

        support.fire_data_change(DataEvent {
            source: "/s/a".into(),
            address: None,
        });
        support.fire_data_change(DataEvent {
            source: "/s".into(),
            address: Some(address("quic://a:1/s?nodeName=a")),
        });
        support.fire_child_change(ChildEvent {
            source: "/s".into(),
            children: vec![address("quic://b:1/s?nodeName=b")],
        });
        assert_eq!(recorder.data.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.children.load(Ordering::SeqCst), 1);
        assert_eq!(
            support.cache().addresses("/s").unwrap(),
            vec![address("quic://b:1/s?nodeName=b")]
        );
    }

    #[tokio::test]
    async fn data_changes_replace_the_node_entry() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let old = address("quic://a:1/s?nodeName=a");
        let moved = address("quic://a:2/s?nodeName=a");
        support.fire_data_change(DataEvent {
            source: "/s/a".into(),
            address: Some(old),
        });
        support.fire_data_change(DataEvent {
            source: "/s/a".into(),
            address: Some(moved.clone()),
        });
        assert_eq!(support.cache().addresses("/s").unwrap(), vec![moved]);

        support.fire_data_change(DataEvent {
            source: "/s/a".into(),
            address: None,
        });
        assert!(support.cache().get("/s").is_none());
    }

    #[tokio::test]
    async fn lookup_misses_once_then_serves_from_cache_and_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let a = address("quic://a:1/s?nodeName=a");
        let b = address("quic://b:1/s?nodeName=b");
        let discovery = Arc::new(Fixed {
            answer: Mutex::new(Ok(vec![a.clone(), b.clone()])),
            calls: AtomicUsize::new(0),
        });

        let query = address("quic:///s");
        let found = support.lookup(&query, discovery.clone()).await.unwrap();
        assert_eq!(found.len(), 2);
        let only_b = address("quic:///s?nodeName=b");
        assert_eq!(
            support.lookup(&only_b, discovery.clone()).await.unwrap(),
            vec![b.clone()]
        );
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);

        // a failing refresh keeps the cached answer
        *discovery.answer.lock() = Err(Error::Registry("down".into()));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(discovery.calls.load(Ordering::SeqCst) >= 2);
        let found = support.lookup(&query, discovery.clone()).await.unwrap();
        assert_eq!(found.len(), 2);

        *discovery.answer.lock() = Ok(vec![a.clone()]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(support.lookup(&query, discovery).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn cached_keys_are_refreshed_too() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let a = address("quic://a:1/s?nodeName=a");
        let b = address("quic://b:1/s?nodeName=b");
        support.cache().insert("/s", &a);
        let discovery = Arc::new(Fixed {
            answer: Mutex::new(Ok(vec![a.clone(), b.clone()])),
            calls: AtomicUsize::new(0),
        });

        let query = address("quic:///s");
        assert_eq!(
            support.lookup(&query, discovery.clone()).await.unwrap(),
            vec![a.clone()]
        );
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(discovery.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(support.lookup(&query, discovery).await.unwrap().len(), 2);
    }

    struct Slow {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Discovery for Slow {
        async fn discover(&self, _key: &str) -> Result<Vec<EndpointAddress>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(vec![address("quic://a:1/s?nodeName=a")])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let discovery = Arc::new(Slow {
            calls: AtomicUsize::new(0),
        });
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let support = support.clone();
                let discovery: Arc<dyn Discovery> = discovery.clone();
                tokio::spawn(async move {
                    support.lookup(&address("quic:///s"), discovery).await
                })
            })
            .collect();
        for found in futures::future::join_all(tasks).await {
            assert_eq!(found.unwrap().unwrap().len(), 1);
        }
        assert_eq!(discovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_failure_on_a_miss_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let support = support(dir.path());
        let discovery = Arc::new(Fixed {
            answer: Mutex::new(Err(Error::Registry("down".into()))),
            calls: AtomicUsize::new(0),
        });
        let result = support.lookup(&address("quic:///s"), discovery).await;
        assert!(matches!(result, Err(Error::Registry(_))));
    }
}
