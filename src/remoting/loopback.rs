//! In-process transport: both ends of every connection live in this process
//! and frames are handed across through channels. Useful to run a provider
//! and its callers in one process, and to provoke connection failures on
//! demand.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
};
use tracing::debug;

use super::{
    next_connection_id, settled, Connection, ConnectionId, FrameHandler,
    Transport, WriteAck,
};
use crate::{
    common::address::EndpointAddress,
    error::{Error, Result},
};

/// How the next connects behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    /// Fail with a connection refused error.
    Refuse,
    /// Never complete.
    Hang,
    /// Complete with a connection that is already closed.
    Dead,
}

pub struct LoopbackTransport {
    server: Arc<dyn FrameHandler>,
    mode: Mutex<ConnectMode>,
    accepted: Mutex<Vec<Arc<LoopbackConnection>>>,
}

impl LoopbackTransport {
    /// A transport whose every connection ends at `server`.
    pub fn new(server: Arc<dyn FrameHandler>) -> Arc<Self> {
        Arc::new(Self {
            server,
            mode: Mutex::new(ConnectMode::Accept),
            accepted: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: ConnectMode) {
        *self.mode.lock() = mode;
    }

    /// Open server side connections.
    pub fn connections(&self) -> usize {
        let mut accepted = self.accepted.lock();
        accepted.retain(|connection| connection.is_open());
        accepted.len()
    }

    /// Closes every connection from the server side.
    pub fn drop_connections(&self) {
        let accepted: Vec<_> = self.accepted.lock().drain(..).collect();
        for connection in accepted {
            connection.close();
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        address: &EndpointAddress,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<dyn Connection>> {
        let mode = *self.mode.lock();
        match mode {
            ConnectMode::Refuse => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", address.host_port()),
            )
            .into()),
            ConnectMode::Hang => futures::future::pending().await,
            ConnectMode::Accept | ConnectMode::Dead => {
                let (client, server) =
                    pair(address.clone(), handler, self.server.clone());
                if mode == ConnectMode::Dead {
                    client.close();
                } else {
                    self.accepted.lock().push(server);
                }
                Ok(client)
            }
        }
    }
}

type Outbound = (Vec<u8>, oneshot::Sender<Result<()>>);

struct Link {
    open: AtomicBool,
    closed: watch::Sender<bool>,
    sides: [(ConnectionId, Arc<dyn FrameHandler>); 2],
}

pub struct LoopbackConnection {
    id: ConnectionId,
    remote: EndpointAddress,
    link: Arc<Link>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

fn pair(
    server_address: EndpointAddress,
    client_handler: Arc<dyn FrameHandler>,
    server_handler: Arc<dyn FrameHandler>,
) -> (Arc<LoopbackConnection>, Arc<LoopbackConnection>) {
    let (client_id, server_id) = (next_connection_id(), next_connection_id());
    let (closed, _) = watch::channel(false);
    let link = Arc::new(Link {
        open: AtomicBool::new(true),
        closed,
        sides: [
            (client_id, client_handler.clone()),
            (server_id, server_handler.clone()),
        ],
    });

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let client = Arc::new(LoopbackConnection {
        id: client_id,
        remote: server_address,
        link: link.clone(),
        outbound: client_tx,
    });
    let server = Arc::new(LoopbackConnection {
        id: server_id,
        remote: EndpointAddress::builder()
            .protocol("loop")
            .host("client")
            .build(),
        link: link.clone(),
        outbound: server_tx,
    });

    tokio::spawn(deliver(
        client_rx,
        server.clone(),
        server_handler,
        link.clone(),
    ));
    tokio::spawn(deliver(server_rx, client.clone(), client_handler, link));
    debug!(client_id, server_id, "loopback connection opened");
    (client, server)
}

// Hands the frames written on one end to the handler of the other end, in
// write order, until the link closes.
async fn deliver(
    mut frames: mpsc::UnboundedReceiver<Outbound>,
    peer: Arc<LoopbackConnection>,
    handler: Arc<dyn FrameHandler>,
    link: Arc<Link>,
) {
    let mut closed = link.closed.subscribe();
    let peer: Arc<dyn Connection> = peer;
    loop {
        select! {
            _ = closed.wait_for(|closed| *closed) => break,
            next = frames.recv() => {
                let Some((frame, ack)) = next else { break };
                if !link.open.load(Ordering::Acquire) {
                    let _ = ack.send(Err(Error::ConnectionClosed));
                    break;
                }
                handler.received(&peer, frame);
                let _ = ack.send(Ok(()));
            }
        }
    }
    while let Ok((_, ack)) = frames.try_recv() {
        let _ = ack.send(Err(Error::ConnectionClosed));
    }
}

impl Connection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote(&self) -> &EndpointAddress {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    fn write(&self, frame: Vec<u8>) -> WriteAck {
        if !self.is_open() {
            return settled(Err(Error::ConnectionClosed));
        }
        let (tx, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError((_, tx))) = self.outbound.send((frame, tx)) {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        rx
    }

    fn close(&self) {
        if !self.link.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.link.closed.send_replace(true);
        debug!(id = self.id, "loopback connection closed");
        for (id, handler) in &self.link.sides {
            handler.closed(*id);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::rpc::wire::Envelope;

    /// Answers every request with its own payload.
    pub struct Echo;

    impl FrameHandler for Echo {
        fn received(&self, connection: &Arc<dyn Connection>, frame: Vec<u8>) {
            let Ok(request) = Envelope::decode(&frame) else {
                return;
            };
            let payload = request.payload.clone().unwrap_or_default();
            if let Ok(reply) = Envelope::response_to(&request, Ok(payload)).encode() {
                drop(connection.write(reply));
            }
        }
    }

    /// Takes requests and never answers.
    pub struct Silent;

    impl FrameHandler for Silent {
        fn received(&self, _connection: &Arc<dyn Connection>, _frame: Vec<u8>) {}
    }

    impl LoopbackTransport {
        pub(crate) fn echo() -> Arc<Self> {
            Self::new(Arc::new(Echo))
        }

        pub(crate) fn silent() -> Arc<Self> {
            Self::new(Arc::new(Silent))
        }
    }
}
