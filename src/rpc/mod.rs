// The caller side of a call, from the command name to the promise of its
// response, and the provider side that answers it.
//
// A call names its command and registry group. The resolver looks the
// command's providers up in the registry and keeps one invoker per provider
// address; a `ServiceReference` picks among them in turn. Invokers hold
// clients, clients hold connections, and each client's `Exchange` matches
// response frames to the promises of waiting callers. On the provider side a
// `CommandTable` answers request frames and an `Exporter` announces the
// commands in the registry.

pub mod call;
pub mod command;
pub mod dispatch;
pub mod exchange;
pub mod invoker;
pub mod reference;
pub mod resolver;
pub mod wire;

pub use call::{process_async, process_sync, RpcCall, RpcResponse};
pub use command::{connect_address, RpcCommand};
pub use dispatch::{CommandHandler, CommandTable, Exporter};
pub use exchange::Exchange;
pub use invoker::{next_index, Invoker, RemoteInvoker};
pub use reference::ServiceReference;
pub use resolver::{InvokerResolver, Protocol, TransportProtocol};
