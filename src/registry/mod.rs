// A registry maps logical service paths to the addresses of the providers
// serving them. Every registry keeps a local, durable copy of what it has
// seen so that a process restarted while the backend is unreachable can
// still find its providers. The backend is authoritative; the local cache
// converges on it through change notifications and periodic refreshes.
//
// Backends implement the `Registry` contract and compose `RegistrySupport`
// for the parts that are the same everywhere: the cache, the listener
// bookkeeping and the lookup refresh.

use std::{borrow::Cow, sync::Arc};

use async_trait::async_trait;

use crate::{
    common::address::{EndpointAddress, NODE_NAME},
    error::{Error, Result},
};

pub mod cache;
pub mod memory;
pub mod properties;
pub mod support;

pub use cache::LocalCache;
pub use memory::{Coordinator, MemoryRegistry};
pub use support::{Discovery, RegistrySupport};

#[async_trait]
pub trait Registry: Send + Sync {
    /// Address of the registry backend itself.
    fn address(&self) -> &EndpointAddress;

    /// Publishes a provider address. The address must carry a `nodeName`
    /// parameter. Registering the same address twice is harmless.
    ///
    /// Returning `Ok` means the backend accepted the call. It does not wait
    /// for watchers elsewhere to observe the new entry.
    async fn register(&self, address: &EndpointAddress) -> Result<()>;

    /// Withdraws a provider address published by [`Registry::register`].
    async fn unregister(&self, address: &EndpointAddress) -> Result<()>;

    /// Starts delivering changes under the subscription key of `address` to
    /// `listener`.
    fn subscribe(
        &self,
        address: &EndpointAddress,
        listener: Arc<dyn NotifyListener>,
    );

    fn unsubscribe(
        &self,
        address: &EndpointAddress,
        listener: &Arc<dyn NotifyListener>,
    );

    /// Returns the providers registered under the service path of `address`,
    /// restricted to one node when `address` carries a `nodeName`.
    async fn lookup(
        &self,
        address: &EndpointAddress,
    ) -> Result<Vec<EndpointAddress>>;

    fn subscribe_state(&self, listener: Arc<dyn StateListener>);

    fn unsubscribe_state(&self, listener: &Arc<dyn StateListener>);

    /// Stops background work and flushes the local cache.
    async fn close(&self);
}

/// Connectivity of a registry to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Connected,
    Disconnected,
    /// The backend dropped the session; ephemeral registrations are gone
    /// until they are re-issued on the next session.
    Expired,
}

/// The data stored at one key changed. `address` is `None` when the entry
/// was removed.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub source: String,
    pub address: Option<EndpointAddress>,
}

/// The set of entries below one key changed; `children` is the new set.
#[derive(Debug, Clone)]
pub struct ChildEvent {
    pub source: String,
    pub children: Vec<EndpointAddress>,
}

/// Receives data changes for the keys it subscribed to. Errors are logged by
/// the registry and never reach the code that caused the change.
pub trait NotifyListener: Send + Sync {
    fn data_changed(&self, _event: &DataEvent) -> Result<()> {
        Ok(())
    }

    fn children_changed(&self, _event: &ChildEvent) -> Result<()> {
        Ok(())
    }
}

/// Receives connectivity events, e.g. to re-issue work after the backend
/// lost a session.
pub trait StateListener: Send + Sync {
    fn state_changed(&self, _state: RegistryState) -> Result<()> {
        Ok(())
    }

    fn new_session(&self) -> Result<()> {
        Ok(())
    }

    fn establishment_error(&self, _error: &Error) -> Result<()> {
        Ok(())
    }
}

/// `/group/services/command` for an address with path
/// `group/services/command`, percent-decoded.
pub fn service_key(address: &EndpointAddress) -> String {
    let path = address.path().unwrap_or("");
    let decoded = urlencoding::decode_binary(path.as_bytes());
    let decoded = String::from_utf8_lossy(&decoded);
    format!("/{}", decoded.trim_matches('/'))
}

/// The service key, followed by `/nodeName` when the address names a node.
pub fn subscription_key(address: &EndpointAddress) -> String {
    let key = service_key(address);
    match address.parameter(NODE_NAME) {
        Some(node) => join_key(&key, node).into_owned(),
        None => key,
    }
}

pub(crate) fn join_key<'a>(parent: &'a str, child: &str) -> Cow<'a, str> {
    if child.is_empty() {
        Cow::Borrowed(parent)
    } else if parent.ends_with('/') {
        Cow::Owned(format!("{parent}{child}"))
    } else {
        Cow::Owned(format!("{parent}/{child}"))
    }
}

/// Splits `/a/b/node` into `("/a/b", "node")`.
pub(crate) fn split_key(key: &str) -> Option<(&str, &str)> {
    let (parent, child) = key.rsplit_once('/')?;
    let parent = if parent.is_empty() { "/" } else { parent };
    Some((parent, child))
}

pub(crate) fn check_registration(address: &EndpointAddress) -> Result<&str> {
    match address.parameter(NODE_NAME) {
        Some(node) if !node.trim().is_empty() => Ok(node),
        _ => Err(Error::InvalidArgument(format!(
            "{address} has no {NODE_NAME} parameter"
        ))),
    }
}

/// Keeps the addresses of `addresses` that belong to the node named by
/// `query`, or all of them if `query` names no node.
pub(crate) fn filter_by_node(
    query: &EndpointAddress,
    addresses: Vec<EndpointAddress>,
) -> Vec<EndpointAddress> {
    match query.parameter(NODE_NAME) {
        Some(node) => addresses
            .into_iter()
            .filter(|a| a.parameter(NODE_NAME) == Some(node))
            .collect(),
        None => addresses,
    }
}
