//! The gateway capability the reconciler consumes, plus discovery selection

use std::future::Future;
use std::net::IpAddr;

use async_trait::async_trait;
use futures::future::join_all;

use crate::nat::error::{GatewayError, GatewayResult};
use crate::nat::mapping::{GatewayMapping, Protocol};

/// A device that holds leased port mappings
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Create (or overwrite) one mapping
    async fn add_mapping(&self, mapping: &GatewayMapping) -> GatewayResult<()>;

    /// Remove the mapping with this external identity
    async fn delete_mapping(
        &self,
        remote_host: &str,
        external_port: u16,
        protocol: Protocol,
    ) -> GatewayResult<()>;

    /// Row `index` of the mapping table. Fails past the last row.
    async fn mapping_by_index(&self, index: u16) -> GatewayResult<GatewayMapping>;

    /// Internet-facing address of the gateway
    async fn external_address(&self) -> GatewayResult<IpAddr>;

    /// Our own address on the gateway's LAN
    fn local_address(&self) -> IpAddr;
}

/// Run every probe to completion and return the only gateway found.
///
/// Each probe may yield any number of candidates. Failed probes count as
/// yielding none. Candidates with the same `identity` are the same device
/// seen twice and count once. Zero or several devices overall is an error.
pub async fn select_gateway<C, K, F>(probes: Vec<F>, identity: impl Fn(&C) -> K) -> GatewayResult<C>
where
    F: Future<Output = GatewayResult<Vec<C>>>,
    K: PartialEq,
{
    let results = join_all(probes).await;

    let mut candidates: Vec<C> = Vec::new();
    for (idx, result) in results.into_iter().enumerate() {
        match result {
            Ok(found) => {
                tracing::debug!(probe = idx, found = found.len(), "Gateway probe finished");
                for candidate in found {
                    let id = identity(&candidate);
                    if !candidates.iter().any(|c| identity(c) == id) {
                        candidates.push(candidate);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(probe = idx, "Gateway probe failed: {}", e);
            }
        }
    }

    match candidates.len() {
        0 => Err(GatewayError::NoGatewayFound),
        1 => Ok(candidates.remove(0)),
        n => Err(GatewayError::AmbiguousGateway(n)),
    }
}
