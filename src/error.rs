use std::{io, sync::Arc, time::Duration};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure dendrite reports.
///
/// Errors are cloneable so that one outcome can be handed to every waiter of
/// a [`Promise`](crate::common::promise::Promise); foreign sources are shared
/// behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Address text that cannot be parsed.
    #[error("malformed address {input:?}: {reason}")]
    Format { input: String, reason: &'static str },
    /// A registration without its required identity parameter, or any other
    /// caller supplied value that is rejected up front.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The registry backend or the local cache failed.
    #[error("registry failure: {0}")]
    Registry(String),
    #[error("io failure: {0}")]
    Io(Arc<io::Error>),
    /// Connecting, writing or acknowledging on a connection failed.
    #[error("{reason}")]
    Remoting {
        reason: String,
        #[source]
        cause: Option<Arc<Error>>,
    },
    /// A caller's wait elapsed. The awaited operation may still complete.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// A null or invalid response, or a duplicate command registration.
    #[error("rpc failure: {0}")]
    Rpc(String),
    /// The connection carrying a request went away before it was answered.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no provider available for {0}")]
    NoProvider(String),
    #[error("codec failure: {0}")]
    Codec(String),
    /// The provider answered with an error of its own.
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("tls failure: {0}")]
    Tls(String),
}

impl Error {
    pub(crate) fn format(input: &str, reason: &'static str) -> Self {
        Self::Format {
            input: input.to_owned(),
            reason,
        }
    }

    pub fn remoting(reason: impl Into<String>) -> Self {
        Self::Remoting {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn remoting_with(reason: impl Into<String>, cause: Error) -> Self {
        Self::Remoting {
            reason: reason.into(),
            cause: Some(Arc::new(cause)),
        }
    }

    /// Returns true for failures that a retry against another provider may
    /// cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Remoting { .. }
                | Self::ConnectionClosed
                | Self::Io(_)
                | Self::Timeout(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

#[cfg(feature = "quic")]
mod quic {
    use super::Error;

    impl From<quinn::ConnectError> for Error {
        fn from(error: quinn::ConnectError) -> Self {
            Self::remoting(format!("cannot start connecting: {error}"))
        }
    }

    impl From<quinn::ConnectionError> for Error {
        fn from(error: quinn::ConnectionError) -> Self {
            match error {
                quinn::ConnectionError::LocallyClosed
                | quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::ConnectionClosed(_)
                | quinn::ConnectionError::Reset => Self::ConnectionClosed,
                other => Self::remoting(format!("connection failed: {other}")),
            }
        }
    }

    impl From<quinn::WriteError> for Error {
        fn from(error: quinn::WriteError) -> Self {
            match error {
                quinn::WriteError::ConnectionLost(e) => e.into(),
                other => Self::remoting(format!("write failed: {other}")),
            }
        }
    }

    impl From<quinn::ReadExactError> for Error {
        fn from(error: quinn::ReadExactError) -> Self {
            match error {
                quinn::ReadExactError::FinishedEarly => Self::ConnectionClosed,
                quinn::ReadExactError::ReadError(
                    quinn::ReadError::ConnectionLost(e),
                ) => e.into(),
                quinn::ReadExactError::ReadError(e) => {
                    Self::remoting(format!("read failed: {e}"))
                }
            }
        }
    }

    impl From<rustls::Error> for Error {
        fn from(error: rustls::Error) -> Self {
            Self::Tls(error.to_string())
        }
    }

    impl From<rcgen::RcgenError> for Error {
        fn from(error: rcgen::RcgenError) -> Self {
            Self::Tls(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn remoting_error_keeps_its_cause() {
        let cause = Error::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let error = Error::remoting_with("connect to [tcp://a:1] failed", cause);
        assert_eq!(error.to_string(), "connect to [tcp://a:1] failed");
        let source = error.source().expect("cause is attached");
        assert!(source.to_string().contains("refused"));
    }

    #[test]
    fn timeouts_and_closed_connections_are_retryable() {
        assert!(Error::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(!Error::Rpc("bad".into()).is_retryable());
        assert!(!Error::Remote("boom".into()).is_retryable());
    }
}
