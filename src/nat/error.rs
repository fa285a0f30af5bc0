use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::nat::mapping::{MappingKey, Protocol};

/// Errors raised by a single gateway call
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Discovery finished without a usable gateway
    #[error("No UPnP gateway found on network")]
    NoGatewayFound,

    /// More than one gateway answered, refusing to guess
    #[error("Found {0} UPnP gateways, expected exactly one")]
    AmbiguousGateway(usize),

    /// A discovery probe failed
    #[error("Gateway discovery failed: {0}")]
    Discovery(String),

    /// External address query failed
    #[error("Failed to get external IP: {0}")]
    ExternalAddress(String),

    /// Add request rejected
    #[error("Failed to add port mapping: {0}")]
    AddMapping(String),

    /// Delete request rejected
    #[error("Failed to delete port mapping: {0}")]
    DeleteMapping(String),

    /// Delete targeted a mapping the gateway does not have
    #[error("No such port mapping: {external_port}/{protocol}")]
    NoSuchMapping { external_port: u16, protocol: Protocol },

    /// Indexed table lookup failed
    #[error("Failed to get port mapping at index {index}: {reason}")]
    MappingEntry { index: u16, reason: String },

    /// Request the client cannot express
    #[error("Unsupported request: {0}")]
    Unsupported(String),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<igd::SearchError> for GatewayError {
    fn from(error: igd::SearchError) -> Self {
        Self::Discovery(error.to_string())
    }
}

impl From<igd::GetExternalIpError> for GatewayError {
    fn from(error: igd::GetExternalIpError) -> Self {
        Self::ExternalAddress(error.to_string())
    }
}

impl From<igd::AddPortError> for GatewayError {
    fn from(error: igd::AddPortError) -> Self {
        Self::AddMapping(error.to_string())
    }
}

/// Which half of a delete-then-add (or a teardown) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStep {
    Add,
    Delete,
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One port that could not be brought to the desired state
#[derive(Debug)]
pub struct PortFailure {
    pub key: MappingKey,
    pub internal_port: u16,
    pub step: FailedStep,
    pub source: GatewayError,
}

impl fmt::Display for PortFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "port {} -> {}: {} failed: {}",
            self.key, self.internal_port, self.step, self.source
        )
    }
}

/// Every per-port failure of one pass, joined into a single error
#[derive(Debug, Default)]
pub struct PortFailures(Vec<PortFailure>);

impl PortFailures {
    pub fn push(&mut self, failure: PortFailure) {
        self.0.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// External ports that failed, in attempt order
    pub fn external_ports(&self) -> Vec<u16> {
        self.0.iter().map(|f| f.key.external_port).collect()
    }

    /// `Err` carrying the joined failures, if any
    pub fn into_result(self, wrap: fn(PortFailures) -> ForwardError) -> ForwardResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(wrap(self))
        }
    }
}

impl fmt::Display for PortFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, failure) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

/// Errors returned by reconciler and scheduler operations
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Fatal to the whole pass, nothing was attempted
    #[error("Failed to query external address: {0}")]
    ExternalAddress(#[source] GatewayError),

    #[error("Error forwarding ports: {0}")]
    Establish(PortFailures),

    #[error("Failed to ensure forwardings: {0}")]
    Ensure(PortFailures),

    #[error("Errors stopping forwarding: {0}")]
    Teardown(PortFailures),

    /// Teardown did not finish before the shutdown deadline
    #[error("Teardown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

impl ForwardError {
    /// Per-port failures carried by this error, if it has any
    pub fn failures(&self) -> Option<&PortFailures> {
        match self {
            Self::Establish(f) | Self::Ensure(f) | Self::Teardown(f) => Some(f),
            Self::ExternalAddress(_) | Self::ShutdownTimeout(_) => None,
        }
    }
}

/// Configuration and port-spec errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse port, {part} part {value:?} is not a valid port number")]
    InvalidPort { part: &'static str, value: String },

    #[error("Unknown protocol {0:?}, expected TCP or UDP")]
    InvalidProtocol(String),

    #[error("Too many parts in port spec {0:?}, expected local[:external[:protocol]]")]
    TooManyParts(String),

    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for gateway calls
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type for reconciler operations
pub type ForwardResult<T> = Result<T, ForwardError>;
