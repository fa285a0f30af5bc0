//! Runtime configuration: JSON file plus command line overrides

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::nat::error::ConfigError;
use crate::nat::mapping::{MappingDescriptor, Protocol};
use crate::nat::reconciler::ForwardOptions;
use crate::nat::scheduler::ScheduleConfig;

/// Everything needed to run the keeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeeperConfig {
    /// Port specs, `local[:external[:protocol]]`
    pub ports: Vec<String>,
    /// Protocol for specs that do not name one
    pub protocol: Protocol,
    /// Label shown in the router's mapping table
    pub label: String,
    /// Remote host scope, empty for any
    pub remote_host: String,
    pub lease_secs: u64,
    pub retry_secs: u64,
    pub check_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    /// trace, debug, info, warn or error
    pub log_level: String,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            protocol: Protocol::Tcp,
            label: "portkeeper".to_string(),
            remote_host: String::new(),
            lease_secs: 3600, // 1 hour
            retry_secs: 1,
            check_secs: 10,
            shutdown_timeout_secs: 10,
            discovery_timeout_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

/// Port specs split into usable descriptors and rejected inputs
#[derive(Debug, Default)]
pub struct ParsedPorts {
    pub descriptors: Vec<MappingDescriptor>,
    pub rejected: Vec<(String, ConfigError)>,
}

impl KeeperConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Check value ranges the scheduler relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("lease_secs", self.lease_secs),
            ("retry_secs", self.retry_secs),
            ("check_secs", self.check_secs),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        if self.lease_secs > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(format!(
                "lease_secs {} exceeds the protocol maximum {}",
                self.lease_secs,
                u32::MAX
            )));
        }

        if self.retry_secs >= self.lease_secs {
            return Err(ConfigError::Invalid(format!(
                "retry_secs {} must be shorter than lease_secs {}",
                self.retry_secs, self.lease_secs
            )));
        }

        Ok(())
    }

    /// Parse every port spec, keeping the failures apart
    pub fn descriptors(&self) -> ParsedPorts {
        let mut parsed = ParsedPorts::default();
        for spec in &self.ports {
            match MappingDescriptor::parse(spec, self.protocol) {
                Ok(descriptor) => parsed.descriptors.push(descriptor),
                Err(e) => parsed.rejected.push((spec.clone(), e)),
            }
        }
        parsed
    }

    pub fn forward_options(&self) -> ForwardOptions {
        ForwardOptions {
            remote_host: self.remote_host.clone(),
            label: self.label.clone(),
            lease_duration: Duration::from_secs(self.lease_secs),
        }
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            retry_interval: Duration::from_secs(self.retry_secs),
            check_interval: Duration::from_secs(self.check_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}
