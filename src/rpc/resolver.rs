use std::sync::Arc;

use hashbrown::{hash_map::Entry, HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    call::RpcCall,
    invoker::{Invoker, RemoteInvoker},
};
use crate::{
    common::{address::EndpointAddress, scheduler::Scheduler},
    error::{Error, Result},
    registry::Registry,
    remoting::{ChannelRegistry, Transport},
};

/// Builds invokers for the provider addresses of one protocol.
pub trait Protocol: Send + Sync {
    fn refer(&self, address: &EndpointAddress) -> Result<Arc<dyn Invoker>>;
}

/// A protocol whose invokers are [`RemoteInvoker`]s over one transport.
pub struct TransportProtocol {
    transport: Arc<dyn Transport>,
    channels: Arc<ChannelRegistry>,
    scheduler: Arc<Scheduler>,
}

impl TransportProtocol {
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            channels: ChannelRegistry::new(),
            scheduler,
        })
    }
}

impl Protocol for TransportProtocol {
    fn refer(&self, address: &EndpointAddress) -> Result<Arc<dyn Invoker>> {
        Ok(Arc::new(RemoteInvoker::new(
            address.clone(),
            self.transport.clone(),
            self.channels.clone(),
            self.scheduler.clone(),
        )))
    }
}

/// Turns calls into the invokers able to serve them.
///
/// Providers are discovered through the registry and each discovered
/// address gets one invoker, built by the [`Protocol`] registered for its
/// scheme. Once an address is no longer discovered for any command, its
/// invoker is dropped and destroyed.
pub struct InvokerResolver {
    registry: Arc<dyn Registry>,
    protocols: HashMap<String, Arc<dyn Protocol>>,
    // building, recording and evicting happen under this one lock, so an
    // invoker cannot be evicted before the lookup that built it is recorded
    state: Mutex<Resolved>,
}

#[derive(Default)]
struct Resolved {
    invokers: HashMap<EndpointAddress, Arc<dyn Invoker>>,
    // service key -> addresses its last lookup returned
    by_key: HashMap<String, HashSet<EndpointAddress>>,
}

impl Resolved {
    // Takes out the invokers of addresses no lookup returns any more.
    fn evict(&mut self) -> Vec<Arc<dyn Invoker>> {
        let by_key = &self.by_key;
        let stale: Vec<_> = self
            .invokers
            .keys()
            .filter(|address| {
                !by_key.values().any(|set| set.contains(*address))
            })
            .cloned()
            .collect();
        stale
            .into_iter()
            .filter_map(|address| self.invokers.remove(&address))
            .collect()
    }
}

impl InvokerResolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            protocols: HashMap::new(),
            state: Mutex::new(Resolved::default()),
        }
    }

    /// Serves provider addresses whose protocol is `scheme` with `protocol`.
    pub fn with_protocol(
        mut self,
        scheme: impl Into<String>,
        protocol: Arc<dyn Protocol>,
    ) -> Self {
        self.protocols.insert(scheme.into(), protocol);
        self
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// The invokers for every provider of `call`'s command, in discovery
    /// order. Empty when there is none.
    pub async fn find(&self, call: &RpcCall) -> Result<Vec<Arc<dyn Invoker>>> {
        let query = call.command.lookup_address(&call.group);
        let addresses = self.registry.lookup(&query).await?;
        let key = call.command.service_path(&call.group);

        let (found, evicted) = {
            let mut state = self.state.lock();
            let mut found = Vec::with_capacity(addresses.len());
            let mut current = HashSet::with_capacity(addresses.len());
            for address in addresses {
                match self.invoker_for(&mut state.invokers, &address) {
                    Ok(invoker) => {
                        current.insert(address);
                        found.push(invoker);
                    }
                    Err(e) => warn!(%address, %e, "skipping provider"),
                }
            }
            state.by_key.insert(key, current);
            (found, state.evict())
        };
        for invoker in evicted {
            debug!(address = %invoker.address(), "evicting invoker");
            invoker.destroy();
        }
        Ok(found)
    }

    fn invoker_for(
        &self,
        invokers: &mut HashMap<EndpointAddress, Arc<dyn Invoker>>,
        address: &EndpointAddress,
    ) -> Result<Arc<dyn Invoker>> {
        match invokers.entry(address.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let scheme = address.protocol().unwrap_or("");
                let protocol = self.protocols.get(scheme).ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no protocol registered for scheme {scheme:?}"
                    ))
                })?;
                let invoker = protocol.refer(address)?;
                Ok(entry.insert(invoker).clone())
            }
        }
    }

    /// Number of cached invokers.
    pub fn invokers(&self) -> usize {
        self.state.lock().invokers.len()
    }

    /// Destroys every invoker.
    pub fn close(&self) {
        let invokers: Vec<_> = {
            let mut state = self.state.lock();
            state.by_key.clear();
            state.invokers.drain().collect()
        };
        for (_, invoker) in invokers {
            invoker.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        common::promise::Promise,
        config::RegistryConfig,
        registry::{Coordinator, MemoryRegistry},
        rpc::{
            call::RpcResponse,
            command::RpcCommand,
        },
    };

    #[derive(Default)]
    struct Counting {
        referred: AtomicUsize,
        destroyed: Arc<AtomicUsize>,
        // how long building one invoker takes
        delay: Option<Duration>,
    }

    struct Inert {
        address: EndpointAddress,
        destroyed: Arc<AtomicUsize>,
        gone: AtomicBool,
    }

    impl Invoker for Inert {
        fn address(&self) -> &EndpointAddress {
            &self.address
        }

        fn is_available(&self) -> bool {
            !self.gone.load(Ordering::SeqCst)
        }

        fn invoke(&self, _call: &RpcCall) -> Promise<RpcResponse> {
            Promise::succeeded(RpcResponse::value(Vec::new()))
        }

        fn destroy(&self) {
            self.gone.store(true, Ordering::SeqCst);
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Protocol for Counting {
        fn refer(&self, address: &EndpointAddress) -> Result<Arc<dyn Invoker>> {
            self.referred.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(Arc::new(Inert {
                address: address.clone(),
                destroyed: self.destroyed.clone(),
                gone: AtomicBool::new(false),
            }))
        }
    }

    fn provider(command: &RpcCommand, node: &str, scheme: &str) -> EndpointAddress {
        EndpointAddress::parse(&format!("{scheme}://{node}:9000"))
            .unwrap()
            .with_parameter("nodeName", node)
            .with_path(command.service_path("g"))
    }

    async fn setup() -> (
        tempfile::TempDir,
        Arc<MemoryRegistry>,
        Arc<Counting>,
        InvokerResolver,
    ) {
        setup_with(Counting::default()).await
    }

    async fn setup_with(
        protocol: Counting,
    ) -> (
        tempfile::TempDir,
        Arc<MemoryRegistry>,
        Arc<Counting>,
        InvokerResolver,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = RegistryConfig::builder()
            .cache_dir(dir.path().to_path_buf())
            .sync_save(true)
            .build();
        let registry = Arc::new(MemoryRegistry::new(
            EndpointAddress::new("coord", 1),
            Coordinator::new(),
            config,
            Arc::new(Scheduler::current().unwrap()),
        ));
        let protocol = Arc::new(protocol);
        let resolver = InvokerResolver::new(registry.clone())
            .with_protocol("test", protocol.clone());
        (dir, registry, protocol, resolver)
    }

    #[tokio::test]
    async fn invokers_are_built_once_per_address() {
        let (_dir, registry, protocol, resolver) = setup().await;
        let command = RpcCommand::new("a::B", "ping", &[]);
        let call = RpcCall::new("g", command.clone(), Vec::new());
        assert!(resolver.find(&call).await.unwrap().is_empty());

        registry.register(&provider(&command, "n1", "test")).await.unwrap();
        registry.register(&provider(&command, "n2", "test")).await.unwrap();
        registry.register(&provider(&command, "n3", "elsewhere")).await.unwrap();

        let first = resolver.find(&call).await.unwrap();
        let second = resolver.find(&call).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(protocol.referred.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.invokers(), 2);
    }

    #[tokio::test]
    async fn undiscovered_invokers_are_destroyed() {
        let (_dir, registry, protocol, resolver) = setup().await;
        let command = RpcCommand::new("a::B", "ping", &[]);
        let call = RpcCall::new("g", command.clone(), Vec::new());
        let gone = provider(&command, "n1", "test");
        registry.register(&gone).await.unwrap();
        registry.register(&provider(&command, "n2", "test")).await.unwrap();
        assert_eq!(resolver.find(&call).await.unwrap().len(), 2);

        registry.unregister(&gone).await.unwrap();
        let left = resolver.find(&call).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].address().host(), Some("n2"));
        assert_eq!(protocol.destroyed.load(Ordering::SeqCst), 1);

        resolver.close();
        assert_eq!(resolver.invokers(), 0);
        assert_eq!(protocol.destroyed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finds_never_hand_out_destroyed_invokers() {
        let (_dir, registry, _protocol, resolver) = setup_with(Counting {
            delay: Some(Duration::from_micros(200)),
            ..Default::default()
        })
        .await;
        let resolver = Arc::new(resolver);
        let wide = RpcCommand::new("a::Wide", "ping", &[]);
        let narrow = RpcCommand::new("a::Narrow", "ping", &[]);
        for node in 0..40 {
            let address = provider(&wide, &format!("w{node}"), "test");
            registry.register(&address).await.unwrap();
        }
        registry
            .register(&provider(&narrow, "n", "test"))
            .await
            .unwrap();

        for _ in 0..20 {
            resolver.close();
            let wide_call = RpcCall::new("g", wide.clone(), Vec::new());
            let wide_find = {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.find(&wide_call).await })
            };
            let narrow_finds: Vec<_> = (0..20)
                .map(|_| {
                    let resolver = resolver.clone();
                    let call = RpcCall::new("g", narrow.clone(), Vec::new());
                    tokio::spawn(async move { resolver.find(&call).await })
                })
                .collect();

            let found = wide_find.await.unwrap().unwrap();
            assert_eq!(found.len(), 40);
            for outcome in futures::future::join_all(narrow_finds).await {
                assert_eq!(outcome.unwrap().unwrap().len(), 1);
            }
            assert!(found.iter().all(|invoker| invoker.is_available()));
        }
    }
}
