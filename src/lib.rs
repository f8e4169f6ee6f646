//! Runtime core of an RPC framework: provider discovery through a registry
//! with a durable local cache, invoker resolution with round robin selection,
//! connections with acknowledged sends, and the promises that hand responses
//! back to waiting callers.

pub mod common;
pub mod config;
pub mod error;
pub mod registry;
pub mod remoting;
pub mod rpc;

pub use common::{EndpointAddress, Promise, RetryPolicy, Scheduler};
pub use error::{Error, Result};
pub use registry::{MemoryRegistry, Registry};
pub use rpc::{InvokerResolver, RpcCall, RpcCommand, ServiceReference};
