use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use hashbrown::{hash_map::Entry, HashMap};
use parking_lot::Mutex;
use tokio::time;
use tracing::debug;

use super::{Connection, ConnectionId};
use crate::{
    common::address::EndpointAddress,
    error::{Error, Result},
};

/// A connection seen as a message pipe with optionally acknowledged sends.
pub struct Channel {
    connection: Arc<dyn Connection>,
    ack_timeout: Duration,
    registry: Weak<ChannelRegistry>,
}

impl Channel {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn remote(&self) -> &EndpointAddress {
        self.connection.remote()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Sends one frame. Without `wait_for_ack` the frame is only queued;
    /// with it, the call returns once the frame was written and fails if
    /// that does not happen within the ack timeout.
    pub async fn send(&self, frame: Vec<u8>, wait_for_ack: bool) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::remoting_with(
                format!("failed to send to {}", self.remote()),
                Error::ConnectionClosed,
            ));
        }
        let ack = self.connection.write(frame);
        if !wait_for_ack {
            return Ok(());
        }
        match time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::remoting_with(
                format!("failed to send to {}", self.remote()),
                e,
            )),
            Ok(Err(_)) => Err(Error::remoting_with(
                format!("failed to send to {}", self.remote()),
                Error::ConnectionClosed,
            )),
            Err(_) => Err(Error::remoting_with(
                format!(
                    "failed to send to {} within {}ms",
                    self.remote(),
                    self.ack_timeout.as_millis()
                ),
                Error::Timeout(self.ack_timeout),
            )),
        }
    }

    /// Closes the connection and forgets this channel.
    pub fn close(&self) {
        self.connection.close();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_disconnected(&self.connection);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("remote", &self.remote().to_string())
            .field("open", &self.is_connected())
            .finish()
    }
}

/// One [`Channel`] per open connection.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ConnectionId, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the channel of `connection`, creating it on first use.
    ///
    /// A connection that is already closed gets a fresh channel that is not
    /// remembered, and any stale entry for it is dropped.
    pub fn get_or_add_channel(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
        ack_timeout: Duration,
    ) -> Arc<Channel> {
        let fresh = || {
            Arc::new(Channel {
                connection: connection.clone(),
                ack_timeout,
                registry: Arc::downgrade(self),
            })
        };
        let mut channels = self.channels.lock();
        if !connection.is_open() {
            if channels.remove(&connection.id()).is_some() {
                debug!(id = connection.id(), "evicted closed channel");
            }
            return fresh();
        }
        match channels.entry(connection.id()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(fresh()).clone(),
        }
    }

    pub fn remove_if_disconnected(&self, connection: &Arc<dyn Connection>) {
        if !connection.is_open() {
            self.remove(connection.id());
        }
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Channel>> {
        self.channels.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::oneshot;

    use super::*;
    use crate::remoting::{next_connection_id, settled, WriteAck};

    enum Writes {
        Succeed,
        Fail,
        Hang,
    }

    struct Stub {
        id: ConnectionId,
        remote: EndpointAddress,
        open: AtomicBool,
        writes: Writes,
        hung: Mutex<Vec<oneshot::Sender<Result<()>>>>,
    }

    impl Stub {
        fn new(writes: Writes) -> Arc<dyn Connection> {
            Arc::new(Self {
                id: next_connection_id(),
                remote: EndpointAddress::new("peer", 7),
                open: AtomicBool::new(true),
                writes,
                hung: Mutex::new(Vec::new()),
            })
        }
    }

    impl Connection for Stub {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn remote(&self) -> &EndpointAddress {
            &self.remote
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn write(&self, _frame: Vec<u8>) -> WriteAck {
            match self.writes {
                Writes::Succeed => settled(Ok(())),
                Writes::Fail => settled(Err(Error::ConnectionClosed)),
                Writes::Hang => {
                    let (tx, rx) = oneshot::channel();
                    self.hung.lock().push(tx);
                    rx
                }
            }
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_channel_per_open_connection() {
        let registry = ChannelRegistry::new();
        let connection = Stub::new(Writes::Succeed);
        let a = registry.get_or_add_channel(&connection, Duration::from_secs(1));
        let b = registry.get_or_add_channel(&connection, Duration::from_secs(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn closed_connections_are_never_cached() {
        let registry = ChannelRegistry::new();
        let connection = Stub::new(Writes::Succeed);
        let cached = registry.get_or_add_channel(&connection, Duration::from_secs(1));
        connection.close();

        let fresh = registry.get_or_add_channel(&connection, Duration::from_secs(1));
        assert!(!Arc::ptr_eq(&cached, &fresh));
        assert!(registry.is_empty());
        registry.get_or_add_channel(&connection, Duration::from_secs(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn closing_a_channel_evicts_it() {
        let registry = ChannelRegistry::new();
        let connection = Stub::new(Writes::Succeed);
        let channel = registry.get_or_add_channel(&connection, Duration::from_secs(1));
        channel.close();
        assert!(!channel.is_connected());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn acknowledged_send_reports_write_failures() {
        let registry = ChannelRegistry::new();
        let ok = registry.get_or_add_channel(
            &Stub::new(Writes::Succeed),
            Duration::from_secs(1),
        );
        ok.send(vec![1], true).await.unwrap();

        let failing = registry.get_or_add_channel(
            &Stub::new(Writes::Fail),
            Duration::from_secs(1),
        );
        failing.send(vec![1], false).await.unwrap();
        let error = failing.send(vec![1], true).await.unwrap_err();
        assert!(matches!(error, Error::Remoting { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_send_times_out() {
        let registry = ChannelRegistry::new();
        let channel = registry.get_or_add_channel(
            &Stub::new(Writes::Hang),
            Duration::from_millis(3000),
        );
        let error = channel.send(vec![1], true).await.unwrap_err();
        match error {
            Error::Remoting { cause: Some(cause), .. } => {
                assert!(matches!(*cause, Error::Timeout(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn sending_on_a_closed_channel_fails_fast() {
        let registry = ChannelRegistry::new();
        let connection = Stub::new(Writes::Succeed);
        let channel = registry.get_or_add_channel(&connection, Duration::from_secs(1));
        connection.close();
        assert!(channel.send(vec![1], false).await.is_err());
    }
}
