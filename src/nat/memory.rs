//! In-process simulated gateway.
//!
//! Behaves like a cooperative IGD: add overwrites the row with the same
//! external identity, delete of a missing row reports `NoSuchMapping`, and
//! indexed lookup fails past the last row. Failures can be injected per
//! port or per call, and the table can be edited behind the reconciler's
//! back to simulate drift.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::nat::error::{GatewayError, GatewayResult};
use crate::nat::gateway::GatewayClient;
use crate::nat::mapping::{GatewayMapping, MappingKey, Protocol};

#[derive(Debug, Default)]
struct MemoryState {
    table: Vec<GatewayMapping>,
    reject_add: HashSet<u16>,
    reject_delete: HashSet<u16>,
    fail_external: bool,
    fail_index_at: Option<u16>,
    delete_stall: Option<Duration>,
    adds: usize,
    deletes: usize,
}

/// Cloneable handle to a shared simulated mapping table
#[derive(Debug, Clone)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
    external_ip: Ipv4Addr,
    local_ip: Ipv4Addr,
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new(Ipv4Addr::new(203, 0, 113, 1), Ipv4Addr::new(192, 168, 1, 10))
    }
}

impl MemoryGateway {
    pub fn new(external_ip: Ipv4Addr, local_ip: Ipv4Addr) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            external_ip,
            local_ip,
        }
    }

    /// Current table, in index order
    pub fn table(&self) -> Vec<GatewayMapping> {
        self.state.lock().table.clone()
    }

    pub fn get(&self, key: &MappingKey) -> Option<GatewayMapping> {
        self.state.lock().table.iter().find(|m| &m.key() == key).cloned()
    }

    /// Put a row in the table as if someone else had created it
    pub fn insert(&self, mapping: GatewayMapping) {
        upsert(&mut self.state.lock().table, mapping);
    }

    /// Drop a row as if the router had expired or an admin removed it
    pub fn remove(&self, key: &MappingKey) -> Option<GatewayMapping> {
        let mut state = self.state.lock();
        let pos = state.table.iter().position(|m| &m.key() == key)?;
        Some(state.table.remove(pos))
    }

    /// Edit a row in place
    pub fn tamper(&self, key: &MappingKey, edit: impl FnOnce(&mut GatewayMapping)) -> bool {
        let mut state = self.state.lock();
        match state.table.iter_mut().find(|m| &m.key() == key) {
            Some(row) => {
                edit(row);
                true
            }
            None => false,
        }
    }

    /// Reject adds for this external port until cleared
    pub fn reject_add(&self, external_port: u16, reject: bool) {
        let mut state = self.state.lock();
        if reject {
            state.reject_add.insert(external_port);
        } else {
            state.reject_add.remove(&external_port);
        }
    }

    /// Reject deletes for this external port until cleared
    pub fn reject_delete(&self, external_port: u16, reject: bool) {
        let mut state = self.state.lock();
        if reject {
            state.reject_delete.insert(external_port);
        } else {
            state.reject_delete.remove(&external_port);
        }
    }

    pub fn fail_external_address(&self, fail: bool) {
        self.state.lock().fail_external = fail;
    }

    /// Make indexed lookup fail from `index` on, regardless of table size
    pub fn fail_index_at(&self, index: Option<u16>) {
        self.state.lock().fail_index_at = index;
    }

    /// Make every delete hang for `stall` before it is answered
    pub fn stall_deletes(&self, stall: Option<Duration>) {
        self.state.lock().delete_stall = stall;
    }

    /// Successful adds so far
    pub fn add_count(&self) -> usize {
        self.state.lock().adds
    }

    /// Successful deletes so far
    pub fn delete_count(&self) -> usize {
        self.state.lock().deletes
    }
}

fn upsert(table: &mut Vec<GatewayMapping>, mapping: GatewayMapping) {
    let key = mapping.key();
    match table.iter_mut().find(|m| m.key() == key) {
        Some(row) => *row = mapping,
        None => table.push(mapping),
    }
}

#[async_trait]
impl GatewayClient for MemoryGateway {
    async fn add_mapping(&self, mapping: &GatewayMapping) -> GatewayResult<()> {
        let mut state = self.state.lock();
        if state.reject_add.contains(&mapping.external_port) {
            return Err(GatewayError::AddMapping(format!(
                "ConflictInMappingEntry on port {}",
                mapping.external_port
            )));
        }

        upsert(&mut state.table, mapping.clone());
        state.adds += 1;
        Ok(())
    }

    async fn delete_mapping(
        &self,
        remote_host: &str,
        external_port: u16,
        protocol: Protocol,
    ) -> GatewayResult<()> {
        let stall = self.state.lock().delete_stall;
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let mut state = self.state.lock();
        if state.reject_delete.contains(&external_port) {
            return Err(GatewayError::DeleteMapping(format!(
                "ActionNotAuthorized on port {}",
                external_port
            )));
        }

        let key = MappingKey::new(external_port, protocol, remote_host);
        match state.table.iter().position(|m| m.key() == key) {
            Some(pos) => {
                state.table.remove(pos);
                state.deletes += 1;
                Ok(())
            }
            None => Err(GatewayError::NoSuchMapping {
                external_port,
                protocol,
            }),
        }
    }

    async fn mapping_by_index(&self, index: u16) -> GatewayResult<GatewayMapping> {
        let state = self.state.lock();
        if state.fail_index_at.is_some_and(|at| index >= at) {
            return Err(GatewayError::MappingEntry {
                index,
                reason: "injected failure".to_string(),
            });
        }

        state
            .table
            .get(usize::from(index))
            .cloned()
            .ok_or_else(|| GatewayError::MappingEntry {
                index,
                reason: "SpecifiedArrayIndexInvalid".to_string(),
            })
    }

    async fn external_address(&self) -> GatewayResult<IpAddr> {
        if self.state.lock().fail_external {
            return Err(GatewayError::ExternalAddress("injected failure".to_string()));
        }
        Ok(IpAddr::V4(self.external_ip))
    }

    fn local_address(&self) -> IpAddr {
        IpAddr::V4(self.local_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(port: u16) -> GatewayMapping {
        GatewayMapping {
            remote_host: String::new(),
            external_port: port,
            protocol: Protocol::Tcp,
            internal_port: port,
            internal_client: "192.168.1.10".into(),
            enabled: true,
            description: "test".into(),
            lease_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_add_overwrites_same_key() {
        let gw = MemoryGateway::default();
        gw.add_mapping(&row(80)).await.unwrap();

        let mut moved = row(80);
        moved.internal_port = 8080;
        gw.add_mapping(&moved).await.unwrap();

        assert_eq!(gw.table(), vec![moved]);
        assert_eq!(gw.add_count(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_reports_no_such_mapping() {
        let gw = MemoryGateway::default();
        let result = gw.delete_mapping("", 80, Protocol::Tcp).await;
        assert!(matches!(result, Err(GatewayError::NoSuchMapping { external_port: 80, .. })));
    }

    #[tokio::test]
    async fn test_index_lookup_ends_past_table() {
        let gw = MemoryGateway::default();
        gw.insert(row(80));
        gw.insert(row(443));

        assert_eq!(gw.mapping_by_index(1).await.unwrap().external_port, 443);
        assert!(gw.mapping_by_index(2).await.is_err());

        gw.fail_index_at(Some(1));
        assert!(gw.mapping_by_index(1).await.is_err());
    }
}
