use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use tracing::debug;

use super::{
    call::{RpcCall, RpcResponse},
    command::connect_address,
};
use crate::{
    common::{address::EndpointAddress, promise::Promise, scheduler::Scheduler},
    config::ClientConfig,
    error::Error,
    remoting::{ChannelRegistry, Client, Transport},
};

/// Something that can carry a call to one provider.
pub trait Invoker: Send + Sync {
    /// The provider address as it was discovered.
    fn address(&self) -> &EndpointAddress;

    fn is_available(&self) -> bool;

    /// Starts `call` and returns the promise of its response without
    /// waiting for anything.
    fn invoke(&self, call: &RpcCall) -> Promise<RpcResponse>;

    /// The provider's preferred wait for a response, if it has one.
    fn request_timeout(&self) -> Option<Duration> {
        None
    }

    /// Releases the invoker's connections. Calls made afterwards fail.
    fn destroy(&self);
}

/// Round robin position for `len` candidates.
///
/// The counter wraps around at `usize::MAX`, which keeps the result in
/// range at the cost of one uneven step every 2^64 calls.
pub fn next_index(counter: &AtomicUsize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    counter.fetch_add(1, Ordering::Relaxed) % len
}

/// An invoker over [`Client`]s of a [`Transport`].
///
/// The address parameter `connections` sets how many clients, and thereby
/// connections, the invoker keeps; calls take turns over them.
pub struct RemoteInvoker {
    address: EndpointAddress,
    config: ClientConfig,
    clients: Vec<Arc<Client>>,
    next: AtomicUsize,
    destroyed: AtomicBool,
}

impl RemoteInvoker {
    pub fn new(
        address: EndpointAddress,
        transport: Arc<dyn Transport>,
        channels: Arc<ChannelRegistry>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let config = ClientConfig::from_address(&address);
        let target = connect_address(&address);
        let clients: Vec<_> = (0..config.connections)
            .map(|_| {
                Client::new(
                    target.clone(),
                    config.clone(),
                    transport.clone(),
                    channels.clone(),
                    scheduler.clone(),
                )
            })
            .collect();
        // invokers created together should not all start on client 0
        let start = rand::thread_rng().gen_range(0..clients.len().max(1));
        debug!(%address, clients = clients.len(), "invoker created");
        Self {
            address,
            config,
            clients,
            next: AtomicUsize::new(start),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    fn next_client(&self) -> Option<&Arc<Client>> {
        self.clients.get(next_index(&self.next, self.clients.len()))
    }
}

impl Invoker for RemoteInvoker {
    fn address(&self) -> &EndpointAddress {
        &self.address
    }

    fn is_available(&self) -> bool {
        !self.destroyed.load(Ordering::Acquire)
            && self.clients.iter().any(|client| !client.is_closed())
    }

    fn invoke(&self, call: &RpcCall) -> Promise<RpcResponse> {
        if self.destroyed.load(Ordering::Acquire) {
            return Promise::failed(Error::ConnectionClosed);
        }
        match self.next_client() {
            Some(client) => client.request(call),
            None => Promise::failed(Error::NoProvider(self.address.to_string())),
        }
    }

    fn request_timeout(&self) -> Option<Duration> {
        Some(self.config.request_timeout)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for client in &self.clients {
            client.close();
        }
        debug!(address = %self.address, "invoker destroyed");
    }
}

impl Drop for RemoteInvoker {
    fn drop(&mut self) {
        self.destroy();
    }
}
