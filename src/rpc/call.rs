use std::time::Duration;

use super::command::RpcCommand;
use crate::{
    common::promise::Promise,
    error::{Error, Result},
};

/// One invocation: which command, in which registry group, with which
/// encoded arguments.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub group: String,
    pub command: RpcCommand,
    pub payload: Vec<u8>,
    /// Overrides the client's request timeout; zero waits indefinitely.
    pub timeout: Option<Duration>,
}

impl RpcCall {
    pub fn new(
        group: impl Into<String>,
        command: RpcCommand,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            group: group.into(),
            command,
            payload,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What came back for a call: the encoded result, or the provider's error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcResponse {
    pub value: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn value(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Vec<u8>> {
        match self {
            Self { error: Some(message), .. } => Err(Error::Remote(message)),
            Self { value: Some(value), .. } => Ok(value),
            Self { .. } => Err(Error::Rpc(
                "empty response, the service may have failed".into(),
            )),
        }
    }
}

/// Waits for the response of a call, for at most `timeout` unless it is
/// zero.
///
/// Any failure, including the wait running out, also fails `promise` so
/// that everybody else waiting on it is released with the same error.
pub async fn process_sync(
    promise: &Promise<RpcResponse>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let response = if timeout > Duration::ZERO {
        promise.get_timeout(timeout).await
    } else {
        promise.get().await
    };
    let outcome = response.and_then(RpcResponse::into_result);
    if let Err(e) = &outcome {
        promise.set_failure(e.clone());
    }
    outcome
}

/// The outcome of a call if there is one yet, without waiting. `Ok(None)`
/// while the call is in flight.
pub fn process_async(promise: &Promise<RpcResponse>) -> Result<Option<Vec<u8>>> {
    if let Some(cause) = promise.cause() {
        return Err(cause);
    }
    match promise.get_now() {
        Some(response) => response.into_result().map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sync_timeout_fails_the_promise_for_everyone() {
        let promise = Promise::new();
        let other = promise.clone();
        let result = process_sync(&promise, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(matches!(other.get().await, Err(Error::Timeout(_))));

        // a late reply changes nothing
        assert!(!promise.set_success(RpcResponse::value(vec![1])));
    }

    #[tokio::test]
    async fn sync_outcomes() {
        let ok = Promise::succeeded(RpcResponse::value(vec![7]));
        assert_eq!(process_sync(&ok, Duration::ZERO).await.unwrap(), vec![7]);

        let remote = Promise::succeeded(RpcResponse::failure("boom"));
        assert!(matches!(
            process_sync(&remote, Duration::from_secs(1)).await,
            Err(Error::Remote(m)) if m == "boom"
        ));

        let empty = Promise::succeeded(RpcResponse::default());
        assert!(matches!(
            process_sync(&empty, Duration::from_secs(1)).await,
            Err(Error::Rpc(_))
        ));
    }

    #[test]
    fn async_snapshot() {
        let promise = Promise::new();
        assert_eq!(process_async(&promise).unwrap(), None);
        promise.set_success(RpcResponse::value(vec![3]));
        assert_eq!(process_async(&promise).unwrap(), Some(vec![3]));

        let failed: Promise<RpcResponse> = Promise::failed(Error::ConnectionClosed);
        assert!(matches!(process_async(&failed), Err(Error::ConnectionClosed)));
    }
}
