//! The provider side: routing request frames to the code that serves them,
//! and announcing what is served in the registry.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use hashbrown::{hash_map::Entry, HashMap};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    command::RpcCommand,
    wire::{Envelope, FrameKind},
};
use crate::{
    common::address::{EndpointAddress, NODE_NAME},
    error::{Error, Result},
    registry::Registry,
    remoting::{Connection, FrameHandler},
};

/// Serves one command: encoded arguments in, encoded result out.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send,
{
    async fn handle(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        self(payload).await
    }
}

/// Command string to handler. As a [`FrameHandler`] it answers every request
/// frame on the connection it came in on; requests run concurrently.
#[derive(Default)]
pub struct CommandTable {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails with [`Error::Rpc`] if `command` already has a handler.
    pub fn register(
        &self,
        command: &RpcCommand,
        handler: impl CommandHandler,
    ) -> Result<()> {
        match self.handlers.write().entry(command.as_str().to_owned()) {
            Entry::Occupied(_) => Err(Error::Rpc(format!(
                "command {command} is already registered"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(handler));
                Ok(())
            }
        }
    }

    pub fn unregister(&self, command: &RpcCommand) -> bool {
        self.handlers.write().remove(command.as_str()).is_some()
    }

    pub fn commands(&self) -> Vec<RpcCommand> {
        let mut commands: Vec<_> = self
            .handlers
            .read()
            .keys()
            .map(|command| RpcCommand::from_raw(command.as_str()))
            .collect();
        commands.sort();
        commands
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Runs the handler of `request`'s command and builds the response.
    pub async fn dispatch(&self, request: Envelope) -> Envelope {
        let handler = self.handlers.read().get(&request.command).cloned();
        run(handler, request).await
    }
}

async fn run(
    handler: Option<Arc<dyn CommandHandler>>,
    request: Envelope,
) -> Envelope {
    let outcome = match handler {
        Some(handler) => {
            let payload = request.payload.clone().unwrap_or_default();
            handler.handle(payload).await
        }
        None => Err(Error::Rpc(format!("no handler for {}", request.command))),
    };
    if let Err(e) = &outcome {
        debug!(%e, "request failed");
    }
    Envelope::response_to(&request, outcome)
}

impl FrameHandler for CommandTable {
    fn received(&self, connection: &Arc<dyn Connection>, frame: Vec<u8>) {
        let request = match Envelope::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    remote = %connection.remote(),
                    %e,
                    "dropping unreadable frame"
                );
                return;
            }
        };
        if request.kind != FrameKind::Request {
            warn!(
                remote = %connection.remote(),
                id = request.id,
                "unexpected response on a server connection"
            );
            return;
        }

        let handler = self.handlers.read().get(&request.command).cloned();
        let connection = connection.clone();
        let span = debug_span!(
            "dispatch",
            id = request.id,
            command = %request.command
        );
        tokio::spawn(
            async move {
                match run(handler, request).await.encode() {
                    Ok(reply) => {
                        if let Ok(Err(e)) = connection.write(reply).await {
                            debug!(%e, "response not written");
                        }
                    }
                    Err(e) => warn!(%e, "cannot encode response"),
                }
            }
            .instrument(span),
        );
    }
}

/// Publishes the commands of one provider in a registry.
///
/// Each command becomes an entry at `{group}/services/{command}` whose
/// address is the provider's, so the provider address must be reachable
/// by callers. A provider without a `nodeName` gets a random one.
pub struct Exporter {
    registry: Arc<dyn Registry>,
    provider: EndpointAddress,
    exported: Mutex<Vec<EndpointAddress>>,
}

impl Exporter {
    pub fn new(registry: Arc<dyn Registry>, provider: EndpointAddress) -> Self {
        let provider = if provider.parameter(NODE_NAME).is_some() {
            provider
        } else {
            let node = format!("{:016x}", rand::random::<u64>());
            provider.with_parameter(NODE_NAME, node)
        };
        Self {
            registry,
            provider,
            exported: Mutex::new(Vec::new()),
        }
    }

    pub fn provider(&self) -> &EndpointAddress {
        &self.provider
    }

    /// Registers every command in `commands` under `group` and returns the
    /// registered addresses.
    pub async fn export(
        &self,
        group: &str,
        commands: &[RpcCommand],
    ) -> Result<Vec<EndpointAddress>> {
        let mut registered = Vec::with_capacity(commands.len());
        for command in commands {
            let address = self.provider.with_path(command.service_path(group));
            self.registry.register(&address).await?;
            debug!(%address, "exported");
            self.exported.lock().push(address.clone());
            registered.push(address);
        }
        Ok(registered)
    }

    /// Withdraws everything exported so far. Keeps going past failures and
    /// reports the first.
    pub async fn unexport(&self) -> Result<()> {
        let exported: Vec<_> = self.exported.lock().drain(..).collect();
        let mut first_error = None;
        for address in exported {
            if let Err(e) = self.registry.unregister(&address).await {
                warn!(%address, %e, "cannot withdraw export");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(method: &str) -> RpcCommand {
        RpcCommand::new("calc::Calculator", method, &["i64", "i64"])
    }

    fn sum(payload: Vec<u8>) -> impl Future<Output = Result<Vec<u8>>> {
        async move { Ok(vec![payload.iter().sum()]) }
    }

    #[test]
    fn duplicate_commands_are_refused() {
        let table = CommandTable::new();
        table.register(&command("add"), sum).unwrap();
        assert!(matches!(
            table.register(&command("add"), sum),
            Err(Error::Rpc(_))
        ));
        table.register(&command("sub"), sum).unwrap();
        assert_eq!(table.len(), 2);

        assert!(table.unregister(&command("add")));
        assert!(!table.unregister(&command("add")));
        assert_eq!(table.commands(), vec![command("sub")]);
    }

    #[tokio::test]
    async fn requests_reach_their_handler() {
        let table = CommandTable::new();
        table.register(&command("add"), sum).unwrap();

        let request = Envelope::request(9, command("add").as_str(), vec![2, 3]);
        let response = table.dispatch(request).await;
        assert_eq!((response.id, response.kind), (9, FrameKind::Response));
        assert_eq!(response.payload, Some(vec![5]));

        let unknown = Envelope::request(10, command("mul").as_str(), vec![]);
        let response = table.dispatch(unknown).await;
        assert_eq!(response.payload, None);
        assert!(response.error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn handler_errors_are_returned_to_the_caller() {
        let table = CommandTable::new();
        table
            .register(&command("div"), |_payload: Vec<u8>| async {
                Err::<Vec<u8>, _>(Error::Remote("division by zero".into()))
            })
            .unwrap();
        let request = Envelope::request(1, command("div").as_str(), vec![1, 0]);
        let response = table.dispatch(request).await;
        assert_eq!(response.error.as_deref(), Some("division by zero"));
    }
}
