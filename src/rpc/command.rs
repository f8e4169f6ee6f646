use std::fmt;

use crate::common::address::{EndpointAddress, RPC_HOST};

/// Registry directory below a group that holds the RPC services.
pub const SERVICES: &str = "services";

/// The wire name of one remote method:
/// `rpc@{interface descriptor}{method};{parameter descriptors}`.
///
/// `rpc@Lbilling/Ledger;post;Lbilling/Entry;J` names
/// `billing::Ledger::post(Entry, i64)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcCommand(String);

impl RpcCommand {
    pub fn new(interface: &str, method: &str, parameters: &[&str]) -> Self {
        let mut text = format!("rpc@{}{method};", descriptor(interface));
        for parameter in parameters {
            text.push_str(&descriptor(parameter));
        }
        Self(text)
    }

    /// Wraps an already formatted command, e.g. one read off the wire.
    pub fn from_raw(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The command as one registry path segment: every `/` becomes `_`.
    pub fn registry_segment(&self) -> String {
        self.0.replace('/', "_")
    }

    /// `{group}/services/{segment}`
    pub fn service_path(&self, group: &str) -> String {
        format!(
            "{}/{SERVICES}/{}",
            group.trim_matches('/'),
            self.registry_segment()
        )
    }

    /// The address to look providers of this command up with.
    pub fn lookup_address(&self, group: &str) -> EndpointAddress {
        EndpointAddress::builder()
            .path(self.service_path(group))
            .build()
    }
}

impl fmt::Display for RpcCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RpcCommand {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Descriptor of a type name: one letter for primitives, `[` plus the
/// element descriptor for slices and vectors, and `L{path};` for everything
/// else with `::` written as `/`.
pub fn descriptor(type_name: &str) -> String {
    let name = type_name.trim();
    let primitive = match name {
        "bool" => Some("Z"),
        "i8" | "u8" => Some("B"),
        "i16" | "u16" => Some("S"),
        "char" => Some("C"),
        "i32" | "u32" => Some("I"),
        "i64" | "u64" | "isize" | "usize" => Some("J"),
        "f32" => Some("F"),
        "f64" => Some("D"),
        "()" => Some("V"),
        _ => None,
    };
    if let Some(letter) = primitive {
        return letter.to_owned();
    }
    if let Some(element) = name
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .or_else(|| {
            name.strip_prefix("Vec<").and_then(|rest| rest.strip_suffix('>'))
        })
    {
        return format!("[{}", descriptor(element));
    }
    format!("L{};", name.replace("::", "/").replace('.', "/"))
}

/// The address to dial for a provider. A provider may advertise a
/// different host for RPC traffic in its `rpcHost` parameter.
pub fn connect_address(provider: &EndpointAddress) -> EndpointAddress {
    match provider.parameter(RPC_HOST) {
        Some(host) => {
            let mut address = provider.with_host(host);
            address.remove_parameter(RPC_HOST);
            address
        }
        None => provider.clone(),
    }
}
