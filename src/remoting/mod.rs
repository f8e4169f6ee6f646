// Transport plumbing between an invoker and a provider.
//
// A `Transport` produces `Connection`s. Each connection delivers whole
// frames to the `FrameHandler` it was opened with, and accepts frames to
// write. `Channel` wraps a connection with acknowledged sends, and `Client`
// owns the connection lifecycle towards one provider address.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::{common::address::EndpointAddress, error::Result};

pub mod channel;
pub mod client;
pub mod loopback;
#[cfg(feature = "quic")]
pub mod quic;

pub use channel::{Channel, ChannelRegistry};
pub use client::Client;
pub use loopback::LoopbackTransport;
#[cfg(feature = "quic")]
pub use quic::{Identity, QuicConfig, QuicServer, QuicTransport};

pub type ConnectionId = usize;

/// Resolves once the frame handed to [`Connection::write`] was written, or
/// failed to be.
pub type WriteAck = oneshot::Receiver<Result<()>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection to `address`. Frames arriving on it are handed to
    /// `handler`.
    async fn connect(
        &self,
        address: &EndpointAddress,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<dyn Connection>>;
}

pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn remote(&self) -> &EndpointAddress;

    fn is_open(&self) -> bool;

    /// Queues `frame` for writing. Never waits for the write itself.
    fn write(&self, frame: Vec<u8>) -> WriteAck;

    fn close(&self);
}

pub trait FrameHandler: Send + Sync {
    fn received(&self, connection: &Arc<dyn Connection>, frame: Vec<u8>);

    fn closed(&self, _connection: ConnectionId) {}
}

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A [`WriteAck`] that already carries its outcome.
pub(crate) fn settled(outcome: Result<()>) -> WriteAck {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(outcome);
    rx
}
