use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Identity of a provider instance. Registration requires it.
pub const NODE_NAME: &str = "nodeName";
/// Per request timeout in milliseconds.
pub const REQUEST_TIMEOUT: &str = "timeout";
/// Number of connections an invoker keeps to one provider.
pub const CONNECTIONS: &str = "connections";
/// Host to dial instead of the advertised one.
pub const RPC_HOST: &str = "rpcHost";
/// TLS server name used when dialing over QUIC.
pub const SERVER_NAME: &str = "serverName";

type Attachment = Arc<dyn Any + Send + Sync>;

/// Per call metadata riding along with an address. Never serialized and
/// never part of the address identity.
#[derive(Default)]
struct Attachments(Mutex<HashMap<String, Attachment>>);

impl Clone for Attachments {
    fn clone(&self) -> Self {
        Self(Mutex::new(self.0.lock().clone()))
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.lock().keys()).finish()
    }
}

/// An endpoint address of the form
/// `protocol://[user[:pass]@]host[:port]/path?k1=v1&k2=v2`.
///
/// Addresses are used as keys for registry entries, invokers and connection
/// targets. Once an address has been published into one of those caches it
/// must be treated as immutable: use [`EndpointAddress::with_host`] and
/// friends to derive a modified copy instead. Attachments are the exception,
/// they have their own lock and may be changed at any time.
#[derive(TypedBuilder, Clone, Debug)]
pub struct EndpointAddress {
    #[builder(default, setter(strip_option, into))]
    protocol: Option<String>,
    #[builder(default, setter(strip_option, into))]
    username: Option<String>,
    #[builder(default, setter(strip_option, into))]
    password: Option<String>,
    #[builder(default, setter(strip_option, into))]
    host: Option<String>,
    /// Zero means unspecified.
    #[builder(default)]
    port: u16,
    #[builder(default, setter(strip_option, into))]
    path: Option<String>,
    #[builder(default)]
    parameters: IndexMap<String, String>,
    #[builder(default, setter(skip))]
    attachments: Attachments,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::builder().host(host).port(port).build()
    }

    /// Parses the textual form of an address.
    ///
    /// The query is split off first, then the protocol marker (`://`, or
    /// `:/` for forms like `file:/tmp/x`), then the path, the credentials
    /// and finally the port.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rest = text.trim();
        if rest.is_empty() {
            return Err(Error::format(text, "address is empty"));
        }

        let mut parameters = IndexMap::new();
        if let Some(i) = rest.find('?') {
            for part in rest[i + 1..].split('&') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (key, value) = part.split_once('=').unwrap_or((part, part));
                parameters.insert(key.to_owned(), value.to_owned());
            }
            rest = &rest[..i];
        }

        let mut protocol = None;
        if let Some(i) = rest.find("://") {
            if i == 0 {
                return Err(Error::format(text, "missing protocol"));
            }
            protocol = Some(rest[..i].to_owned());
            rest = &rest[i + 3..];
        } else if let Some(i) = rest.find(":/") {
            if i == 0 {
                return Err(Error::format(text, "missing protocol"));
            }
            protocol = Some(rest[..i].to_owned());
            rest = &rest[i + 1..];
        }

        let mut path = None;
        if let Some(i) = rest.find('/') {
            path = Some(rest[i + 1..].to_owned());
            rest = &rest[..i];
        }

        let (mut username, mut password) = (None, None);
        if let Some(i) = rest.find('@') {
            match rest[..i].split_once(':') {
                Some((user, pass)) => {
                    username = Some(user.to_owned());
                    password = Some(pass.to_owned());
                }
                None => username = Some(rest[..i].to_owned()),
            }
            rest = &rest[i + 1..];
        }

        let mut port = 0;
        if let Some(i) = rest.find(':') {
            if i < rest.len() - 1 {
                port = rest[i + 1..]
                    .parse()
                    .map_err(|_| Error::format(text, "invalid port"))?;
            }
            rest = &rest[..i];
        }

        let host = (!rest.is_empty()).then(|| rest.to_owned());

        Ok(Self {
            protocol,
            username,
            password,
            host,
            port,
            path,
            parameters,
            attachments: Attachments::default(),
        })
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn parameters(&self) -> &IndexMap<String, String> {
        &self.parameters
    }

    pub fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = Some(protocol.into());
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    pub fn set_parameter(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn remove_parameter(&mut self, key: &str) -> Option<String> {
        self.parameters.shift_remove(key)
    }

    /// Returns a copy of this address pointing at another host.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.set_host(host);
        copy
    }

    pub fn with_path(&self, path: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.set_path(path);
        copy
    }

    /// Returns a copy of this address carrying one more parameter.
    pub fn with_parameter(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        let mut copy = self.clone();
        copy.set_parameter(key, value);
        copy
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn parameter_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameter(key).unwrap_or(default)
    }

    pub fn int_parameter(&self, key: &str, default: i32) -> i32 {
        self.parsed_parameter(key).unwrap_or(default)
    }

    pub fn long_parameter(&self, key: &str, default: i64) -> i64 {
        self.parsed_parameter(key).unwrap_or(default)
    }

    pub fn bool_parameter(&self, key: &str, default: bool) -> bool {
        match self.parameter(key).map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            _ => default,
        }
    }

    /// Reads a parameter holding a number of milliseconds.
    pub fn duration_parameter(&self, key: &str, default: Duration) -> Duration {
        self.parsed_parameter::<u64>(key)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    fn parsed_parameter<T: FromStr>(&self, key: &str) -> Option<T> {
        self.parameter(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn set_attachment<T: Any + Send + Sync>(
        &self,
        key: impl Into<String>,
        value: T,
    ) {
        self.attachments.0.lock().insert(key.into(), Arc::new(value));
    }

    pub fn attachment<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attachments.0.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove_attachment(&self, key: &str) -> bool {
        self.attachments.0.lock().remove(key).is_some()
    }

    /// `host:port`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or(""), self.port)
    }

    /// `protocol://host:port`
    pub fn protocol_host_port(&self) -> String {
        format!(
            "{}://{}",
            self.protocol.as_deref().unwrap_or(""),
            self.host_port()
        )
    }

    pub fn encode(text: &str) -> String {
        urlencoding::encode(text).into_owned()
    }

    pub fn decode(text: &str) -> Result<String> {
        urlencoding::decode(text)
            .map(|s| s.into_owned())
            .map_err(|_| Error::format(text, "invalid percent encoding"))
    }
}

impl PartialEq for EndpointAddress {
    fn eq(&self, other: &Self) -> bool {
        // IndexMap equality ignores insertion order.
        self.port == other.port
            && self.protocol == other.protocol
            && self.username == other.username
            && self.password == other.password
            && self.host == other.host
            && self.path == other.path
            && self.parameters == other.parameters
    }
}

impl Eq for EndpointAddress {}

impl Hash for EndpointAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.username.hash(state);
        self.password.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.path.hash(state);
        let mut parameters: Vec<_> = self.parameters.iter().collect();
        parameters.sort_unstable();
        parameters.hash(state);
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(protocol) = &self.protocol {
            write!(f, "{protocol}://")?;
        }
        if let Some(username) = &self.username {
            f.write_str(username)?;
            if let Some(password) = &self.password {
                write!(f, ":{password}")?;
            }
            f.write_str("@")?;
        }
        if let Some(host) = &self.host {
            f.write_str(host)?;
            if self.port > 0 {
                write!(f, ":{}", self.port)?;
            }
        }
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        for (i, (key, value)) in self.parameters.iter().enumerate() {
            let separator = if i == 0 { '?' } else { '&' };
            write!(f, "{separator}{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for EndpointAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
