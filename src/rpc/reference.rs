use std::{
    sync::{atomic::AtomicUsize, Arc},
    time::{Duration, Instant},
};

use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use super::{
    call::{process_sync, RpcCall, RpcResponse},
    invoker::{next_index, Invoker},
    resolver::InvokerResolver,
};
use crate::{
    common::{
        promise::Promise,
        retry::{self, NoRetry, RetryPolicy},
    },
    config::ClientConfig,
    error::{Error, Result},
};

/// What callers hold to reach a remote service.
///
/// Every call asks the resolver for the current providers and picks one in
/// turn. A call that fails in a way another provider might not is retried on
/// the next provider for as long as the retry policy allows.
#[derive(TypedBuilder)]
pub struct ServiceReference {
    resolver: Arc<InvokerResolver>,
    #[builder(default = Arc::new(NoRetry) as Arc<dyn RetryPolicy>)]
    retry: Arc<dyn RetryPolicy>,
    /// Used when neither the call nor the provider sets a timeout.
    #[builder(default = ClientConfig::default().request_timeout)]
    timeout: Duration,
    #[builder(default, setter(skip))]
    next: AtomicUsize,
}

impl ServiceReference {
    pub fn resolver(&self) -> &Arc<InvokerResolver> {
        &self.resolver
    }

    async fn pick(&self, call: &RpcCall) -> Result<Arc<dyn Invoker>> {
        let mut invokers = self.resolver.find(call).await?;
        invokers.retain(|invoker| invoker.is_available());
        if invokers.is_empty() {
            return Err(Error::NoProvider(call.command.to_string()));
        }
        let index = next_index(&self.next, invokers.len());
        Ok(invokers.swap_remove(index))
    }

    fn timeout_for(&self, call: &RpcCall, invoker: &dyn Invoker) -> Duration {
        call.timeout
            .or_else(|| invoker.request_timeout())
            .unwrap_or(self.timeout)
    }

    /// Calls a provider and waits for the encoded result.
    pub async fn call(&self, call: &RpcCall) -> Result<Vec<u8>> {
        let started = Instant::now();
        let mut retries = 0;
        loop {
            let invoker = self.pick(call).await?;
            let promise = invoker.invoke(call);
            let outcome =
                process_sync(&promise, self.timeout_for(call, invoker.as_ref()))
                    .await;
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    let elapsed = started.elapsed();
                    if !retry::backoff(self.retry.as_ref(), retries, elapsed)
                        .await
                    {
                        return Err(e);
                    }
                    retries += 1;
                    warn!(
                        command = %call.command,
                        provider = %invoker.address(),
                        retries,
                        %e,
                        "call failed, trying the next provider"
                    );
                }
                Err(e) => {
                    debug!(command = %call.command, %e, "call failed");
                    return Err(e);
                }
            }
        }
    }

    /// Starts a call on one provider without waiting for it; there is no
    /// failover. Use [`process_async`](super::call::process_async) or the
    /// promise itself to get at the outcome.
    pub async fn call_async(
        &self,
        call: &RpcCall,
    ) -> Result<Promise<RpcResponse>> {
        let invoker = self.pick(call).await?;
        Ok(invoker.invoke(call))
    }
}
