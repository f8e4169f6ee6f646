use std::{path::PathBuf, time::Duration};

use typed_builder::TypedBuilder;

use crate::common::address::{EndpointAddress, CONNECTIONS, REQUEST_TIMEOUT};

pub const CACHE_DIR: &str = "cacheDir";
pub const REFRESH_INTERVAL: &str = "refreshInterval";
pub const FLUSH_DELAY: &str = "flushDelay";
pub const SYNC_SAVE: &str = "syncSave";
pub const CONNECT_TIMEOUT: &str = "connectTimeout";
pub const ACK_TIMEOUT: &str = "ackTimeout";

/// Where the registry cache lives unless configured otherwise: a directory
/// in the user's home, or the temp directory when there is no home.
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".dendrite"))
        .unwrap_or_else(std::env::temp_dir)
}

/// Settings of a registry and its local cache.
#[derive(TypedBuilder, Debug, Clone)]
pub struct RegistryConfig {
    /// Directory holding the cache file.
    #[builder(default = default_cache_dir(), setter(into))]
    pub cache_dir: PathBuf,
    /// Period of the background refresh of looked up keys.
    #[builder(default = Duration::from_secs(30))]
    pub refresh_interval: Duration,
    /// Mutations arriving within this window are flushed by one write.
    #[builder(default = Duration::from_millis(100))]
    pub flush_delay: Duration,
    /// Write the cache file on the mutating call instead of debouncing.
    #[builder(default = false)]
    pub sync_save: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RegistryConfig {
    /// Reads overrides from the parameters of a registry address, e.g.
    /// `memory://local?refreshInterval=5000&syncSave=true`.
    pub fn from_address(address: &EndpointAddress) -> Self {
        let defaults = Self::default();
        Self {
            cache_dir: address
                .parameter(CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            refresh_interval: address.duration_parameter(
                REFRESH_INTERVAL,
                defaults.refresh_interval,
            ),
            flush_delay: address
                .duration_parameter(FLUSH_DELAY, defaults.flush_delay),
            sync_save: address.bool_parameter(SYNC_SAVE, defaults.sync_save),
        }
    }
}

/// Settings of the clients an invoker keeps to one provider.
#[derive(TypedBuilder, Debug, Clone)]
pub struct ClientConfig {
    #[builder(default = Duration::from_millis(3000))]
    pub connect_timeout: Duration,
    /// Bound on an acknowledged send.
    #[builder(default = Duration::from_millis(3000))]
    pub ack_timeout: Duration,
    /// Default per call timeout; zero waits for as long as it takes.
    #[builder(default = Duration::from_millis(5000))]
    pub request_timeout: Duration,
    /// Connections per provider address.
    #[builder(default = 1)]
    pub connections: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientConfig {
    /// Reads overrides from the parameters of a provider address.
    pub fn from_address(address: &EndpointAddress) -> Self {
        let defaults = Self::default();
        let connections = address.int_parameter(CONNECTIONS, 1).max(1);
        Self {
            connect_timeout: address
                .duration_parameter(CONNECT_TIMEOUT, defaults.connect_timeout),
            ack_timeout: address
                .duration_parameter(ACK_TIMEOUT, defaults.ack_timeout),
            request_timeout: address
                .duration_parameter(REQUEST_TIMEOUT, defaults.request_timeout),
            connections: connections as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_overrides_come_from_parameters() {
        let address = EndpointAddress::parse(
            "memory://local?refreshInterval=5000&syncSave=true&cacheDir=/tmp/d",
        )
        .unwrap();
        let config = RegistryConfig::from_address(&address);
        assert_eq!(config.refresh_interval, Duration::from_secs(5));
        assert_eq!(config.flush_delay, Duration::from_millis(100));
        assert!(config.sync_save);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/d"));
    }

    #[test]
    fn client_connections_are_at_least_one() {
        let address =
            EndpointAddress::parse("quic://h:1?connections=0&timeout=250")
                .unwrap();
        let config = ClientConfig::from_address(&address);
        assert_eq!(config.connections, 1);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.ack_timeout, Duration::from_millis(3000));
    }
}
