//! Mapping descriptors, owned records and gateway table rows

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::nat::error::ConfigError;

const PORT_SEPARATOR: char = ':';

/// Transport protocol of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Tcp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            _ => Err(ConfigError::InvalidProtocol(s.to_string())),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Protocol> for String {
    fn from(value: Protocol) -> Self {
        value.to_string()
    }
}

impl From<Protocol> for igd::PortMappingProtocol {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::Tcp => igd::PortMappingProtocol::TCP,
            Protocol::Udp => igd::PortMappingProtocol::UDP,
        }
    }
}

impl From<igd::PortMappingProtocol> for Protocol {
    fn from(value: igd::PortMappingProtocol) -> Self {
        match value {
            igd::PortMappingProtocol::TCP => Protocol::Tcp,
            igd::PortMappingProtocol::UDP => Protocol::Udp,
        }
    }
}

/// A port we want forwarded, as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingDescriptor {
    pub internal_port: u16,
    pub external_port: u16,
    pub protocol: Protocol,
}

impl MappingDescriptor {
    pub fn new(internal_port: u16, external_port: u16, protocol: Protocol) -> Self {
        Self {
            internal_port,
            external_port,
            protocol,
        }
    }

    /// Parse `local[:external[:protocol]]`.
    ///
    /// The external port defaults to the local one and the protocol to
    /// `default_protocol`.
    pub fn parse(spec: &str, default_protocol: Protocol) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.trim().split(PORT_SEPARATOR).collect();
        if parts.len() > 3 {
            return Err(ConfigError::TooManyParts(spec.to_string()));
        }

        let internal_port = parse_port("local", parts[0])?;
        let external_port = match parts.get(1) {
            Some(part) => parse_port("external", part)?,
            None => internal_port,
        };
        let protocol = match parts.get(2) {
            Some(part) => part.parse()?,
            None => default_protocol,
        };

        Ok(Self::new(internal_port, external_port, protocol))
    }
}

impl fmt::Display for MappingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.internal_port, self.external_port, self.protocol)
    }
}

fn parse_port(part: &'static str, value: &str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort {
            part,
            value: value.to_string(),
        }),
    }
}

/// External identity of a mapping on the gateway
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingKey {
    pub external_port: u16,
    pub protocol: Protocol,
    pub remote_host: String,
}

impl MappingKey {
    pub fn new(external_port: u16, protocol: Protocol, remote_host: impl Into<String>) -> Self {
        Self {
            external_port,
            protocol,
            remote_host: remote_host.into(),
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.external_port, self.protocol)?;
        if !self.remote_host.is_empty() {
            write!(f, " from {}", self.remote_host)?;
        }
        Ok(())
    }
}

/// A row of the gateway's port mapping table.
///
/// Doubles as the add request. When read back from the gateway,
/// `lease_seconds` is the *remaining* lease, not the one requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayMapping {
    pub remote_host: String,
    pub external_port: u16,
    pub protocol: Protocol,
    pub internal_port: u16,
    pub internal_client: String,
    pub enabled: bool,
    pub description: String,
    pub lease_seconds: u32,
}

impl GatewayMapping {
    pub fn key(&self) -> MappingKey {
        MappingKey::new(self.external_port, self.protocol, self.remote_host.clone())
    }
}

/// A mapping this process created and keeps alive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMapping {
    pub descriptor: MappingDescriptor,
    pub remote_host: String,
    pub lease_seconds: u32,
    pub label: String,
    pub enabled: bool,
    /// LAN address the mapping forwards to
    pub internal_client: String,
}

impl OwnedMapping {
    pub fn key(&self) -> MappingKey {
        MappingKey::new(
            self.descriptor.external_port,
            self.descriptor.protocol,
            self.remote_host.clone(),
        )
    }

    /// Add request for this mapping
    pub fn to_request(&self) -> GatewayMapping {
        GatewayMapping {
            remote_host: self.remote_host.clone(),
            external_port: self.descriptor.external_port,
            protocol: self.descriptor.protocol,
            internal_port: self.descriptor.internal_port,
            internal_client: self.internal_client.clone(),
            enabled: self.enabled,
            description: self.label.clone(),
            lease_seconds: self.lease_seconds,
        }
    }

    /// Whether a gateway row still forwards the way this record was created.
    ///
    /// Lease is not compared: gateways report the remaining time. The label
    /// is not compared either, some routers rewrite or truncate it.
    pub fn matches(&self, row: &GatewayMapping) -> bool {
        self.descriptor.external_port == row.external_port
            && self.descriptor.protocol == row.protocol
            && self.descriptor.internal_port == row.internal_port
            && self.remote_host == row.remote_host
            && self.enabled == row.enabled
            && self.internal_client == row.internal_client
    }
}
