//! Lease reconciliation engine.
//!
//! Holds the set of mappings this process believes it created and keeps the
//! gateway in line with it. A record is in the set only while its last
//! create succeeded: it is removed right before every delete-then-add and
//! put back only once the add went through.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{Instrument, Span};

use crate::nat::error::{
    FailedStep, ForwardError, ForwardResult, GatewayError, PortFailure, PortFailures,
};
use crate::nat::gateway::GatewayClient;
use crate::nat::mapping::{MappingDescriptor, MappingKey, OwnedMapping};

/// Per-pass parameters for [`Reconciler::establish_all`]
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Remote host scope, empty for any
    pub remote_host: String,
    /// Label shown in the router's mapping table
    pub label: String,
    /// Nominal lease requested for every mapping
    pub lease_duration: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            label: "portkeeper".to_string(),
            lease_duration: Duration::from_secs(3600),
        }
    }
}

impl ForwardOptions {
    fn lease_seconds(&self) -> u32 {
        u32::try_from(self.lease_duration.as_secs()).unwrap_or(u32::MAX)
    }
}

pub struct Reconciler<G> {
    gateway: G,
    existing: BTreeMap<MappingKey, OwnedMapping>,
    /// Keys of the last establish input, in input order
    order: Vec<MappingKey>,
    span: Span,
}

impl<G: GatewayClient> Reconciler<G> {
    pub fn new(gateway: G) -> Self {
        Self::with_span(gateway, tracing::info_span!("reconciler"))
    }

    /// Create a reconciler that logs inside `span`
    pub fn with_span(gateway: G, span: Span) -> Self {
        Self {
            gateway,
            existing: BTreeMap::new(),
            order: Vec::new(),
            span,
        }
    }

    /// Records currently believed present on the gateway
    pub fn mappings(&self) -> impl Iterator<Item = &OwnedMapping> {
        self.existing.values()
    }

    pub fn get(&self, key: &MappingKey) -> Option<&OwnedMapping> {
        self.existing.get(key)
    }

    pub fn len(&self) -> usize {
        self.existing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.existing.is_empty()
    }

    /// (Re)create every desired mapping, in order.
    ///
    /// Fails without touching the gateway if its external address cannot be
    /// read. Otherwise every port is attempted and the failures are returned
    /// together.
    pub async fn establish_all(
        &mut self,
        desired: &[MappingDescriptor],
        opts: &ForwardOptions,
    ) -> ForwardResult<()> {
        let span = self.span.clone();
        self.establish_inner(desired, opts).instrument(span).await
    }

    async fn establish_inner(
        &mut self,
        desired: &[MappingDescriptor],
        opts: &ForwardOptions,
    ) -> ForwardResult<()> {
        let external = self
            .gateway
            .external_address()
            .await
            .map_err(ForwardError::ExternalAddress)?;
        let local = self.gateway.local_address().to_string();

        tracing::info!(
            external_address = %external,
            local_address = %local,
            ports = desired.len(),
            "Recreating forwarding"
        );

        let lease_seconds = opts.lease_seconds();
        let mut failures = PortFailures::default();

        self.order = desired
            .iter()
            .map(|d| MappingKey::new(d.external_port, d.protocol, opts.remote_host.clone()))
            .collect();

        for descriptor in desired {
            let record = OwnedMapping {
                descriptor: *descriptor,
                remote_host: opts.remote_host.clone(),
                lease_seconds,
                label: opts.label.clone(),
                enabled: true,
                internal_client: local.clone(),
            };

            if let Err(failure) = self.recreate(record).await {
                failures.push(failure);
            }
        }

        failures.into_result(ForwardError::Establish)
    }

    /// Recreate owned mappings the gateway no longer reports as created.
    ///
    /// Gateway rows that do not belong to us are never touched. Enumeration
    /// stops at the first failed index lookup, so a transient error in the
    /// middle of the table looks like the end of it and the unseen owned
    /// mappings get recreated.
    pub async fn ensure_all(&mut self) -> ForwardResult<()> {
        let span = self.span.clone();
        self.ensure_inner().instrument(span).await
    }

    async fn ensure_inner(&mut self) -> ForwardResult<()> {
        let mut needs_recreation = self.existing.clone();

        // no listing primitive, walk indices until the gateway says no
        for index in 0..u16::MAX {
            let mut row = match self.gateway.mapping_by_index(index).await {
                Ok(row) => row,
                Err(e) => {
                    tracing::debug!(index, "Mapping table ends: {}", e);
                    break;
                }
            };

            tracing::debug!(
                index,
                external_port = row.external_port,
                protocol = %row.protocol,
                internal_client = %row.internal_client,
                internal_port = row.internal_port,
                "Found port mapping"
            );

            let Some(owned) = self.existing.get(&row.key()) else {
                continue; // created by someone else
            };

            // gateway reports REMAINING lease
            row.lease_seconds = owned.lease_seconds;

            if owned.matches(&row) {
                needs_recreation.remove(&row.key());
            } else {
                tracing::warn!(
                    external_port = row.external_port,
                    protocol = %row.protocol,
                    internal_client = %row.internal_client,
                    internal_port = row.internal_port,
                    enabled = row.enabled,
                    "Port mapping diverged from what we created"
                );
            }
        }

        if needs_recreation.is_empty() {
            return Ok(());
        }

        // same order as the establish input
        let mut pending = Vec::with_capacity(needs_recreation.len());
        for key in &self.order {
            if let Some(record) = needs_recreation.remove(key) {
                pending.push(record);
            }
        }
        pending.extend(needs_recreation.into_values());

        let ports: Vec<String> = pending.iter().map(|r| r.key().to_string()).collect();
        tracing::info!(ports = ?ports, "Ports need re-creation");

        let local = self.gateway.local_address().to_string();
        let mut failures = PortFailures::default();

        for mut record in pending {
            record.internal_client = local.clone();
            if let Err(failure) = self.recreate(record).await {
                failures.push(failure);
            }
        }

        failures.into_result(ForwardError::Ensure)
    }

    /// Delete every owned mapping.
    ///
    /// The owned set is emptied before the first delete, so it ends up
    /// empty whatever the gateway answers.
    pub async fn teardown_all(&mut self) -> ForwardResult<()> {
        let span = self.span.clone();
        self.teardown_inner().instrument(span).await
    }

    async fn teardown_inner(&mut self) -> ForwardResult<()> {
        tracing::info!(ports = self.existing.len(), "Shutting down existing forwarding");

        let owned = std::mem::take(&mut self.existing);
        let mut failures = PortFailures::default();

        for (key, record) in owned {
            match self
                .gateway
                .delete_mapping(&key.remote_host, key.external_port, key.protocol)
                .await
            {
                Ok(()) => {
                    tracing::info!(external_port = key.external_port, protocol = %key.protocol, "Port forwarding stopped");
                }
                Err(GatewayError::NoSuchMapping { .. }) => {
                    tracing::info!(external_port = key.external_port, protocol = %key.protocol, "Port forwarding already gone");
                }
                Err(e) => {
                    tracing::error!(external_port = key.external_port, protocol = %key.protocol, "Failed to delete port forwarding: {}", e);
                    failures.push(PortFailure {
                        internal_port: record.descriptor.internal_port,
                        key,
                        step: FailedStep::Delete,
                        source: e,
                    });
                }
            }
        }

        failures.into_result(ForwardError::Teardown)
    }

    /// Delete-then-add one mapping, keeping `existing` truthful throughout
    async fn recreate(&mut self, record: OwnedMapping) -> Result<(), PortFailure> {
        let key = record.key();
        self.existing.remove(&key);

        // whatever holds the external port may point elsewhere, and some
        // gateways reject add over a conflicting row
        if let Err(e) = self
            .gateway
            .delete_mapping(&key.remote_host, key.external_port, key.protocol)
            .await
        {
            tracing::debug!(external_port = key.external_port, protocol = %key.protocol, "Delete before create failed: {}", e);
        }

        let request = record.to_request();
        if let Err(e) = self.gateway.add_mapping(&request).await {
            tracing::warn!(external_port = key.external_port, protocol = %key.protocol, "Failed to create port forwarding: {}", e);
            return Err(PortFailure {
                internal_port: record.descriptor.internal_port,
                key,
                step: FailedStep::Add,
                source: e,
            });
        }

        tracing::info!(
            remote_host = %record.remote_host,
            internal_port = record.descriptor.internal_port,
            internal_client = %record.internal_client,
            external_port = key.external_port,
            protocol = %key.protocol,
            enabled = record.enabled,
            lease = record.lease_seconds,
            "Port forwarding created"
        );

        self.existing.insert(key, record);
        Ok(())
    }
}
