use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use igd::aio::{search_gateway, Gateway};
use igd::{RemovePortError, SearchOptions};

use crate::nat::error::{GatewayError, GatewayResult};
use crate::nat::gateway::{select_gateway, GatewayClient};
use crate::nat::mapping::{GatewayMapping, Protocol};

/// UPnP IGD client bound to the interface it discovered the gateway on
#[derive(Clone)]
pub struct UpnpGateway {
    gateway: Gateway,
    local_ip: Ipv4Addr,
}

impl UpnpGateway {
    pub fn new(gateway: Gateway, local_ip: Ipv4Addr) -> Self {
        Self { gateway, local_ip }
    }

    fn identity(&self) -> (SocketAddrV4, String) {
        (self.gateway.addr, self.gateway.control_url.clone())
    }
}

impl std::fmt::Display for UpnpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gateway {} via {}", self.gateway.addr, self.local_ip)
    }
}

/// Find the single UPnP gateway reachable from this host.
///
/// One search runs per non-loopback IPv4 interface, all in parallel.
/// The same router seen from several interfaces counts once.
pub async fn discover(timeout: Duration) -> GatewayResult<UpnpGateway> {
    let local_ips = local_ipv4_addrs()?;
    if local_ips.is_empty() {
        return Err(GatewayError::Discovery(
            "no non-loopback IPv4 interface".to_string(),
        ));
    }

    tracing::info!(interfaces = local_ips.len(), "Searching for UPnP gateway...");

    let probes: Vec<BoxFuture<'static, GatewayResult<Vec<UpnpGateway>>>> = local_ips
        .into_iter()
        .map(|ip| probe_interface(ip, timeout).boxed())
        .collect();

    let gateway = select_gateway(probes, UpnpGateway::identity).await?;
    tracing::info!("UPnP {} selected", gateway);

    Ok(gateway)
}

async fn probe_interface(local_ip: Ipv4Addr, timeout: Duration) -> GatewayResult<Vec<UpnpGateway>> {
    let options = SearchOptions {
        bind_addr: SocketAddr::new(IpAddr::V4(local_ip), 0),
        timeout: Some(timeout),
        ..Default::default()
    };

    match search_gateway(options).await {
        Ok(gateway) => {
            tracing::debug!("UPnP gateway {} answered on {}", gateway.addr, local_ip);
            Ok(vec![UpnpGateway::new(gateway, local_ip)])
        }
        Err(e) => Err(e.into()),
    }
}

fn local_ipv4_addrs() -> GatewayResult<Vec<Ipv4Addr>> {
    let interfaces = if_addrs::get_if_addrs()?;

    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect())
}

#[async_trait]
impl GatewayClient for UpnpGateway {
    async fn add_mapping(&self, mapping: &GatewayMapping) -> GatewayResult<()> {
        // igd always sends the wildcard remote host and NewEnabled=1
        if !mapping.remote_host.is_empty() {
            return Err(GatewayError::Unsupported(format!(
                "remote host {:?} on UPnP add",
                mapping.remote_host
            )));
        }
        if !mapping.enabled {
            return Err(GatewayError::Unsupported("disabled mapping on UPnP add".to_string()));
        }

        let client: Ipv4Addr = mapping.internal_client.parse().map_err(|_| {
            GatewayError::Unsupported(format!(
                "UPnP requires an IPv4 internal client, got {:?}",
                mapping.internal_client
            ))
        })?;

        self.gateway
            .add_port(
                mapping.protocol.into(),
                mapping.external_port,
                SocketAddrV4::new(client, mapping.internal_port),
                mapping.lease_seconds,
                &mapping.description,
            )
            .await?;

        Ok(())
    }

    async fn delete_mapping(
        &self,
        remote_host: &str,
        external_port: u16,
        protocol: Protocol,
    ) -> GatewayResult<()> {
        if !remote_host.is_empty() {
            return Err(GatewayError::Unsupported(format!(
                "remote host {:?} on UPnP delete",
                remote_host
            )));
        }

        match self.gateway.remove_port(protocol.into(), external_port).await {
            Ok(()) => Ok(()),
            Err(RemovePortError::NoSuchPortMapping) => Err(GatewayError::NoSuchMapping {
                external_port,
                protocol,
            }),
            Err(e) => Err(GatewayError::DeleteMapping(e.to_string())),
        }
    }

    async fn mapping_by_index(&self, index: u16) -> GatewayResult<GatewayMapping> {
        let entry = self
            .gateway
            .get_generic_port_mapping_entry(u32::from(index))
            .await
            .map_err(|e| GatewayError::MappingEntry {
                index,
                reason: e.to_string(),
            })?;

        Ok(GatewayMapping {
            remote_host: entry.remote_host,
            external_port: entry.external_port,
            protocol: entry.protocol.into(),
            internal_port: entry.internal_port,
            internal_client: entry.internal_client,
            enabled: entry.enabled,
            description: entry.port_mapping_description,
            lease_seconds: entry.lease_duration,
        })
    }

    async fn external_address(&self) -> GatewayResult<IpAddr> {
        let external_ip = self.gateway.get_external_ip().await?;
        Ok(IpAddr::V4(external_ip))
    }

    fn local_address(&self) -> IpAddr {
        IpAddr::V4(self.local_ip)
    }
}
