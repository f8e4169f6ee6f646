use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;
use tokio::time;
use tracing::{debug, debug_span, warn, Instrument};

use super::{Channel, ChannelRegistry, Connection, Transport};
use crate::{
    common::{
        address::EndpointAddress,
        promise::Promise,
        retry::{self, RetryPolicy},
        scheduler::Scheduler,
    },
    config::ClientConfig,
    error::{Error, Result},
    rpc::{
        call::{RpcCall, RpcResponse},
        exchange::Exchange,
        wire::Envelope,
    },
};

/// The connection from this process to one provider address.
///
/// A client connects lazily: the first request starts the connection in the
/// background and queues behind it. Requests are correlated with responses
/// by the client's [`Exchange`].
pub struct Client {
    address: EndpointAddress,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    channels: Arc<ChannelRegistry>,
    exchange: Arc<Exchange>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    // held across the connect itself, so it is the async flavour
    connecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    scheduler: Arc<Scheduler>,
}

impl Client {
    pub fn new(
        address: EndpointAddress,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        channels: Arc<ChannelRegistry>,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            config,
            transport,
            channels,
            exchange: Exchange::new(),
            connection: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            scheduler,
        })
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.is_open())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connects unless already connected, waiting at most the connect
    /// timeout.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        if self.is_closed() {
            return Err(Error::remoting(format!(
                "client to {} is closed",
                self.address
            )));
        }
        if self.is_connected() {
            return Ok(());
        }

        let started = Instant::now();
        let attempt = self.transport.connect(&self.address, self.exchange.clone());
        let connection = match time::timeout(self.config.connect_timeout, attempt)
            .instrument(debug_span!("connect", remote = %self.address))
            .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(Error::remoting_with(
                    format!("connect to [{}] failed", self.address),
                    e,
                ))
            }
            Err(_) => {
                return Err(Error::remoting_with(
                    format!(
                        "connect to [{}] timed out after {}ms",
                        self.address,
                        self.config.connect_timeout.as_millis()
                    ),
                    Error::Timeout(self.config.connect_timeout),
                ))
            }
        };
        if !connection.is_open() {
            return Err(Error::remoting(format!(
                "connect to [{}] failed without reason",
                self.address
            )));
        }

        // a close racing the connect wins
        if self.is_closed() {
            connection.close();
            return Err(Error::remoting(format!(
                "client to {} is closed",
                self.address
            )));
        }
        let previous = self.connection.lock().replace(connection);
        if let Some(previous) = previous {
            self.release(&previous);
        }
        debug!(
            remote = %self.address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connected"
        );
        Ok(())
    }

    pub fn disconnect(&self) {
        let previous = self.connection.lock().take();
        if let Some(connection) = previous {
            self.release(&connection);
            debug!(remote = %self.address, "disconnected");
        }
    }

    // Requests written on a connection we let go of will not be answered.
    fn release(&self, connection: &Arc<dyn Connection>) {
        connection.close();
        self.channels.remove(connection.id());
        self.exchange
            .fail_connection(connection.id(), Error::ConnectionClosed);
    }

    /// Drops the current connection and connects again, retrying failed
    /// attempts while `policy` allows.
    pub async fn reconnect(&self, policy: &dyn RetryPolicy) -> Result<()> {
        let started = Instant::now();
        let mut retries = 0;
        loop {
            self.disconnect();
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if self.is_closed()
                        || !retry::backoff(policy, retries, started.elapsed()).await
                    {
                        return Err(e);
                    }
                    retries += 1;
                    warn!(remote = %self.address, retries, %e, "reconnecting");
                }
            }
        }
    }

    /// The channel of the current connection; `None` while disconnected.
    pub fn get_channel(&self) -> Option<Arc<Channel>> {
        let connection = self.connection.lock().clone()?;
        if !connection.is_open() {
            return None;
        }
        Some(
            self.channels
                .get_or_add_channel(&connection, self.config.ack_timeout),
        )
    }

    /// Sends `call` and returns the promise of its response right away.
    /// Connecting and writing happen in the background; their failures
    /// fail the promise.
    pub fn request(self: &Arc<Self>, call: &RpcCall) -> Promise<RpcResponse> {
        let (id, promise) = self.exchange.open();
        if self.is_closed() {
            self.exchange.fail(id, Error::ConnectionClosed);
            return promise;
        }
        let request =
            Envelope::request(id, call.command.as_str(), call.payload.clone());
        let frame = match request.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.exchange.fail(id, e);
                return promise;
            }
        };

        let client = self.clone();
        let spawned = self.scheduler.spawn(async move {
            let sent = async {
                client.connect().await?;
                let channel =
                    client.get_channel().ok_or(Error::ConnectionClosed)?;
                if !client.exchange.sent_on(id, channel.id()) {
                    // answered or given up on while connecting
                    return Ok(());
                }
                channel.send(frame, true).await
            }
            .await;
            if let Err(e) = sent {
                debug!(remote = %client.address, id, %e, "request not sent");
                client.exchange.fail(id, e);
            }
        });
        if spawned.is_none() {
            self.exchange.fail(id, Error::ConnectionClosed);
        }
        promise
    }

    /// Disconnects for good. Every request still waiting for a response
    /// fails with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disconnect();
        self.exchange.fail_all(Error::ConnectionClosed);
        debug!(remote = %self.address, "client closed");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        common::retry::{NoRetry, RetryNTimes},
        remoting::loopback::{ConnectMode, LoopbackTransport},
        rpc::command::RpcCommand,
    };

    fn client(transport: &Arc<LoopbackTransport>) -> Arc<Client> {
        let config = ClientConfig::builder()
            .connect_timeout(Duration::from_millis(200))
            .ack_timeout(Duration::from_millis(200))
            .build();
        Client::new(
            EndpointAddress::parse("loop://provider:1").unwrap(),
            config,
            transport.clone(),
            ChannelRegistry::new(),
            Arc::new(Scheduler::current().unwrap()),
        )
    }

    fn call() -> RpcCall {
        RpcCall::new("g", RpcCommand::new("a::B", "echo", &["Vec<u8>"]), vec![5])
    }

    #[tokio::test]
    async fn connect_and_request_round_trip() {
        let transport = LoopbackTransport::echo();
        let client = client(&transport);
        assert!(client.get_channel().is_none());

        let response = client.request(&call()).get().await.unwrap();
        assert_eq!(response, RpcResponse::value(vec![5]));
        assert!(client.is_connected());
        assert!(client.get_channel().is_some());

        client.disconnect();
        assert!(client.get_channel().is_none());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn refused_connect_carries_the_transport_cause() {
        let transport = LoopbackTransport::echo();
        transport.set_mode(ConnectMode::Refuse);
        let client = client(&transport);
        match client.connect().await {
            Err(Error::Remoting { cause: Some(cause), .. }) => {
                assert!(matches!(*cause, Error::Io(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
        let promise = client.request(&call());
        assert!(matches!(promise.get().await, Err(Error::Remoting { .. })));
    }

    #[tokio::test]
    async fn dead_connection_fails_without_reason() {
        let transport = LoopbackTransport::echo();
        transport.set_mode(ConnectMode::Dead);
        let client = client(&transport);
        let error = client.connect().await.unwrap_err();
        assert!(error.to_string().contains("without reason"));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_times_out() {
        let transport = LoopbackTransport::echo();
        transport.set_mode(ConnectMode::Hang);
        let client = client(&transport);
        match client.connect().await {
            Err(Error::Remoting { cause: Some(cause), .. }) => {
                assert!(matches!(*cause, Error::Timeout(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_retries_until_the_provider_is_back() {
        let transport = LoopbackTransport::echo();
        transport.set_mode(ConnectMode::Refuse);
        let client = client(&transport);

        assert!(client.reconnect(&NoRetry).await.is_err());

        let flip = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            flip.set_mode(ConnectMode::Accept);
        });
        client
            .reconnect(&RetryNTimes::new(20, Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn close_fails_outstanding_requests() {
        let transport = LoopbackTransport::silent();
        let client = client(&transport);
        let promise = client.request(&call());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!promise.is_done());

        client.close();
        assert!(matches!(promise.get().await, Err(Error::ConnectionClosed)));
        assert!(matches!(
            client.request(&call()).get().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn provider_going_away_fails_outstanding_requests() {
        let transport = LoopbackTransport::silent();
        let client = client(&transport);
        let promise = client.request(&call());
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.drop_connections();
        assert!(matches!(promise.get().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn reconnect_fails_requests_of_the_old_connection() {
        let transport = LoopbackTransport::silent();
        let client = client(&transport);
        let before = client.request(&call());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.exchange().pending(), 1);

        client.reconnect(&NoRetry).await.unwrap();
        assert!(matches!(before.get().await, Err(Error::ConnectionClosed)));

        let after = client.request(&call());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!after.is_done());
        assert_eq!(client.exchange().pending(), 1);
    }
}
