//! QUIC transport. Each connection carries one bidirectional stream opened
//! by the dialing side; frames on it are prefixed with their length as a
//! little endian `u32`.

use std::{
    io::{BufReader, Cursor},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use futures::TryFutureExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use quinn::{RecvStream, SendStream};
use rustls::{Certificate, PrivateKey, RootCertStore};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, debug_span, warn, Instrument};
use typed_builder::TypedBuilder;

use super::{
    next_connection_id, settled, Connection, ConnectionId, FrameHandler,
    Transport, WriteAck,
};
use crate::{
    common::address::{EndpointAddress, SERVER_NAME},
    error::{Error, Result},
};

/// Settings shared by the dialing and the listening side.
#[derive(TypedBuilder, Debug, Clone)]
pub struct QuicConfig {
    /// Local address of a dialing endpoint.
    #[builder(default = SocketAddr::from(([0, 0, 0, 0], 0)))]
    pub bind: SocketAddr,
    #[builder(default = Duration::from_secs(5))]
    pub keep_alive: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub idle_timeout: Duration,
    /// Frames above this size are refused on both ends.
    #[builder(default = 16 * 1024 * 1024)]
    pub max_frame: usize,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

// the default transport with the BBR congestion controller and keep alives
fn transport_config(config: &QuicConfig) -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    let bbr = quinn::congestion::BbrConfig::default();
    transport.congestion_controller_factory(Arc::new(bbr));
    transport.keep_alive_interval(Some(config.keep_alive));
    match quinn::IdleTimeout::try_from(config.idle_timeout) {
        Ok(idle) => {
            transport.max_idle_timeout(Some(idle));
        }
        Err(_) => warn!(
            idle = ?config.idle_timeout,
            "idle timeout out of range, keeping the default"
        ),
    }
    Arc::new(transport)
}

/// A certificate chain and its private key.
#[derive(Clone)]
pub struct Identity {
    certificates: Vec<Certificate>,
    key: PrivateKey,
}

impl Identity {
    /// A fresh self-signed certificate for `names`.
    pub fn self_signed(names: Vec<String>) -> Result<Self> {
        let generated = rcgen::generate_simple_self_signed(names)?;
        Ok(Self {
            certificates: vec![Certificate(generated.serialize_der()?)],
            key: PrivateKey(generated.serialize_private_key_der()),
        })
    }

    /// Reads a PEM certificate chain and a PEM PKCS#8 private key.
    pub fn from_pem(certificates: &[u8], key: &[u8]) -> Result<Self> {
        let certificates: Vec<Certificate> =
            rustls_pemfile::certs(&mut BufReader::new(Cursor::new(certificates)))?
                .into_iter()
                .map(Certificate)
                .collect();
        if certificates.is_empty() {
            return Err(Error::Tls("no certificate in PEM input".into()));
        }
        let mut keys =
            rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(key)))?;
        if keys.len() != 1 {
            return Err(Error::Tls(format!(
                "expected exactly one private key, found {}",
                keys.len()
            )));
        }
        Ok(Self {
            certificates,
            key: PrivateKey(keys.remove(0)),
        })
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }
}

/// Dials providers over QUIC, trusting the given root certificates.
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
    config: QuicConfig,
}

impl QuicTransport {
    pub fn new(roots: &[Certificate], config: QuicConfig) -> Result<Self> {
        let mut store = RootCertStore::empty();
        for root in roots {
            store
                .add(root)
                .map_err(|e| Error::Tls(format!("untrusted root: {e:?}")))?;
        }
        let mut client = quinn::ClientConfig::with_root_certificates(store);
        client.transport_config(transport_config(&config));
        let mut endpoint = quinn::Endpoint::client(config.bind)?;
        endpoint.set_default_client_config(client);
        Ok(Self { endpoint, config })
    }
}

async fn resolve(address: &EndpointAddress) -> Result<SocketAddr> {
    let host = address.host().unwrap_or("localhost");
    tokio::net::lookup_host((host, address.port()))
        .await?
        .next()
        .ok_or_else(|| {
            Error::remoting(format!("cannot resolve {}", address.host_port()))
        })
}

#[async_trait]
impl Transport for QuicTransport {
    async fn connect(
        &self,
        address: &EndpointAddress,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<dyn Connection>> {
        let target = resolve(address).await?;
        let server_name = address
            .parameter(SERVER_NAME)
            .or(address.host())
            .unwrap_or("localhost");
        let span = debug_span!("quic connect", remote = %target, server_name);
        async move {
            debug!("establishing QUIC connection");
            let connection = self.endpoint.connect(target, server_name)?.await?;
            debug!("connected via QUIC, opening frame stream");
            let (send, recv) = connection.open_bi().await?;
            let connection = QuicConnection::start(
                connection,
                send,
                recv,
                address.clone(),
                handler,
                self.config.max_frame,
            );
            Ok::<_, Error>(connection as Arc<dyn Connection>)
        }
        .instrument(span)
        .await
    }
}

type Outbound = (Vec<u8>, oneshot::Sender<Result<()>>);

pub struct QuicConnection {
    id: ConnectionId,
    connection: quinn::Connection,
    remote: EndpointAddress,
    writes: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl QuicConnection {
    fn start(
        connection: quinn::Connection,
        send: SendStream,
        recv: RecvStream,
        remote: EndpointAddress,
        handler: Arc<dyn FrameHandler>,
        max_frame: usize,
    ) -> Arc<Self> {
        let (writes, queued) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            id: next_connection_id(),
            connection,
            remote,
            writes,
            open: AtomicBool::new(true),
        });
        let span = debug_span!("quic", id = this.id(), remote = %this.remote);
        tokio::spawn(
            write_frames(FrameSendStream(send), queued, max_frame)
                .instrument(span.clone()),
        );
        tokio::spawn(
            read_frames(this.clone(), FrameRecvStream(recv), handler, max_frame)
                .instrument(span),
        );
        this
    }
}

impl Connection for QuicConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote(&self) -> &EndpointAddress {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
            && self.connection.close_reason().is_none()
    }

    fn write(&self, frame: Vec<u8>) -> WriteAck {
        if !self.is_open() {
            return settled(Err(Error::ConnectionClosed));
        }
        let (tx, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError((_, tx))) = self.writes.send((frame, tx)) {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        rx
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.connection.close(0u32.into(), b"closed");
        }
    }
}

async fn write_frames(
    mut stream: FrameSendStream,
    mut queued: mpsc::UnboundedReceiver<Outbound>,
    max_frame: usize,
) {
    while let Some((frame, ack)) = queued.recv().await {
        let result = if frame.len() > max_frame {
            Err(Error::Codec(format!(
                "frame of {} bytes exceeds the {max_frame} byte limit",
                frame.len()
            )))
        } else {
            stream.send(&frame).await
        };
        let failed = matches!(&result, Err(e) if e.is_retryable());
        let _ = ack.send(result);
        if failed {
            break;
        }
    }
    debug!("frame writer stopped");
}

async fn read_frames(
    connection: Arc<QuicConnection>,
    mut stream: FrameRecvStream,
    handler: Arc<dyn FrameHandler>,
    max_frame: usize,
) {
    let id = connection.id();
    let as_dyn: Arc<dyn Connection> = connection.clone();
    loop {
        match stream.receive(max_frame).await {
            Ok(frame) => handler.received(&as_dyn, frame),
            Err(e) => {
                debug!(%e, "frame stream ended");
                break;
            }
        }
    }
    connection.close();
    handler.closed(id);
}

/// Writes length prefixed frames.
pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(4 + frame.len());
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, frame.len() as u32);
        buf.extend_from_slice(&len);
        buf.extend_from_slice(frame);
        self.0.write_all(&buf).await?;
        Ok(())
    }
}

/// Reads length prefixed frames.
pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub async fn receive(&mut self, max_frame: usize) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.0.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf) as usize;
        if len > max_frame {
            return Err(Error::Codec(format!(
                "peer announced a {len} byte frame, limit is {max_frame}"
            )));
        }
        let mut frame = vec![0u8; len];
        self.0.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

/// Accepts QUIC connections and hands their frames to one handler.
pub struct QuicServer {
    endpoint: quinn::Endpoint,
    connections: Arc<Mutex<HashMap<ConnectionId, Arc<QuicConnection>>>>,
    acceptor: JoinHandle<()>,
}

impl QuicServer {
    pub fn bind(
        address: SocketAddr,
        identity: &Identity,
        handler: Arc<dyn FrameHandler>,
        config: QuicConfig,
    ) -> Result<Self> {
        let mut server = quinn::ServerConfig::with_single_cert(
            identity.certificates.clone(),
            identity.key.clone(),
        )?;
        server.transport_config(transport_config(&config));
        let endpoint = quinn::Endpoint::server(server, address)?;
        let connections = Arc::new(Mutex::new(HashMap::new()));
        let acceptor = tokio::spawn(Self::start_acceptor(
            endpoint.clone(),
            handler,
            connections.clone(),
            config.max_frame,
        ));
        debug!(local = ?endpoint.local_addr().ok(), "quic server listening");
        Ok(Self {
            endpoint,
            connections,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn connections(&self) -> usize {
        let mut connections = self.connections.lock();
        connections.retain(|_, connection| connection.is_open());
        connections.len()
    }

    /// Accepts incoming connections until the endpoint is closed. Each
    /// connection is set up on a task of its own.
    async fn start_acceptor(
        endpoint: quinn::Endpoint,
        handler: Arc<dyn FrameHandler>,
        connections: Arc<Mutex<HashMap<ConnectionId, Arc<QuicConnection>>>>,
        max_frame: usize,
    ) {
        while let Some(connecting) = endpoint.accept().await {
            let handler = handler.clone();
            let connections = connections.clone();
            let remote = connecting.remote_address();
            let span = debug_span!("quic accept", %remote);
            tokio::spawn(
                async move {
                    let connection = connecting.await?;
                    debug!("waiting for the peer to open its frame stream");
                    let (send, recv) = connection.accept_bi().await?;
                    let peer = EndpointAddress::builder()
                        .protocol("quic")
                        .host(remote.ip().to_string())
                        .port(remote.port())
                        .build();
                    let connection = QuicConnection::start(
                        connection, send, recv, peer, handler, max_frame,
                    );
                    connections.lock().insert(connection.id(), connection);
                    debug!("accepted");
                    Ok::<_, Error>(())
                }
                .instrument(span)
                .unwrap_or_else(|e| debug!(%e, "connection not accepted")),
            );
        }
    }

    pub fn close(&self) {
        self.acceptor.abort();
        for (_, connection) in self.connections.lock().drain() {
            connection.close();
        }
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

impl Drop for QuicServer {
    fn drop(&mut self) {
        self.close();
    }
}
